//! Command-line interface for the `spiced` binary

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{DaemonConfig, PathsConfig};

#[derive(Parser, Debug)]
#[command(name = "spiced")]
#[command(author, version, about = "Training daemon for trading-agent pods")]
pub struct Cli {
    /// Directory holding default.toml and environment overrides
    #[arg(long, global = true, env = "SPICED_CONFIG_DIR", default_value = "config")]
    pub config_dir: PathBuf,

    /// Keep pods, data, runs and checkpoints under one directory
    #[arg(long, global = true, env = "SPICED_ROOT")]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the daemon with its control API
    Serve {
        /// Override the API bind address
        #[arg(long)]
        bind: Option<String>,
        /// Pods to start training at boot
        #[arg(long = "train", value_name = "POD")]
        train: Vec<String>,
    },

    /// Train a pod in the foreground until it finishes or is interrupted
    Train {
        pod: String,
        /// Resume a run paused on corrupt data
        #[arg(long)]
        resume_paused: bool,
    },

    /// Check a pod definition without training it
    Validate { pod: String },

    /// List runs
    Runs {
        #[arg(long)]
        json: bool,
    },

    /// Show one run with its episode history
    Status {
        run_id: String,
        #[arg(long)]
        json: bool,
    },

    /// Copy the pod's latest checkpoint to a directory
    Export { pod: String, dest: PathBuf },

    /// Seed a new run from an exported checkpoint
    Import { pod: String, source: PathBuf },

    /// Ask the pod's latest checkpoint for an action on the newest data
    Infer {
        pod: String,
        #[arg(long)]
        json: bool,
    },

    /// Append JSON-lines records to the pod's dataset
    AddData { pod: String, file: PathBuf },
}

impl Cli {
    /// Layered config with `--root` applied, validated
    pub fn load_config(&self) -> anyhow::Result<DaemonConfig> {
        let mut config = DaemonConfig::load_from(&self.config_dir)?;
        if let Some(root) = &self.root {
            config.paths = PathsConfig::under(root);
        }
        if let Err(errors) = config.validate() {
            anyhow::bail!("invalid configuration: {}", errors.join("; "));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_train() {
        let cli = Cli::parse_from(["spiced", "--root", "/tmp/spice", "train", "btc", "--resume-paused"]);
        assert_eq!(cli.root, Some(PathBuf::from("/tmp/spice")));
        match cli.command {
            Commands::Train { pod, resume_paused } => {
                assert_eq!(pod, "btc");
                assert!(resume_paused);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_serve_with_boot_pods() {
        let cli = Cli::parse_from(["spiced", "serve", "--train", "btc", "--train", "eth"]);
        match cli.command {
            Commands::Serve { bind, train } => {
                assert!(bind.is_none());
                assert_eq!(train, vec!["btc", "eth"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_root_overrides_paths() {
        let root = std::env::temp_dir().join(format!("spiced-cli-{}", uuid::Uuid::new_v4()));
        let cli = Cli::parse_from([
            "spiced",
            "--config-dir",
            root.join("config").to_str().unwrap(),
            "--root",
            root.to_str().unwrap(),
            "runs",
        ]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.paths.runs_dir, root.join("runs"));
        assert_eq!(config.paths.pods_dir, root.join("pods"));
    }

    #[test]
    fn test_parse_infer_and_add_data() {
        let cli = Cli::parse_from(["spiced", "infer", "btc", "--json"]);
        assert!(matches!(cli.command, Commands::Infer { ref pod, json: true } if pod == "btc"));

        let cli = Cli::parse_from(["spiced", "add-data", "btc", "bars.jsonl"]);
        match cli.command {
            Commands::AddData { pod, file } => {
                assert_eq!(pod, "btc");
                assert_eq!(file, PathBuf::from("bars.jsonl"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
