use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    pub paths: PathsConfig,
    #[serde(default)]
    pub trainer: TrainerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub checkpoints: CheckpointConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// Directory holding pod definitions (`<name>.toml`)
    pub pods_dir: PathBuf,
    /// Directory holding JSON-lines datasets
    pub data_dir: PathBuf,
    /// Directory for run records
    pub runs_dir: PathBuf,
    /// Directory for model checkpoints
    pub checkpoints_dir: PathBuf,
}

impl PathsConfig {
    /// Lay out all directories under a single root
    pub fn under<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        Self {
            pods_dir: root.join("pods"),
            data_dir: root.join("data"),
            runs_dir: root.join("runs"),
            checkpoints_dir: root.join("checkpoints"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrainerConfig {
    /// Executable of the external trainer process
    #[serde(default = "default_trainer_command")]
    pub command: String,
    /// Extra arguments passed to the trainer
    #[serde(default)]
    pub args: Vec<String>,
    /// Per-call timeout for infer/feedback in milliseconds
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Timeout for open/checkpoint calls in milliseconds
    #[serde(default = "default_slow_call_timeout_ms")]
    pub slow_call_timeout_ms: u64,
    /// Algorithms served by the external trainer
    #[serde(default = "default_algorithms")]
    pub algorithms: Vec<String>,
}

fn default_trainer_command() -> String {
    "spice-trainer".to_string()
}

fn default_call_timeout_ms() -> u64 {
    5_000
}

fn default_slow_call_timeout_ms() -> u64 {
    60_000
}

fn default_algorithms() -> Vec<String> {
    vec!["vpg".to_string(), "dql".to_string(), "sacd".to_string()]
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            command: default_trainer_command(),
            args: Vec::new(),
            call_timeout_ms: default_call_timeout_ms(),
            slow_call_timeout_ms: default_slow_call_timeout_ms(),
            algorithms: default_algorithms(),
        }
    }
}

/// Bounded retry with exponential backoff for one fault class
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_backoff_ms: u64,
    /// Upper bound on any single delay
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Timeouts on infer/feedback and flaky connector reads
    #[serde(default = "default_transient_backoff")]
    pub transient: BackoffConfig,
    /// Run record commits
    #[serde(default = "default_registry_backoff")]
    pub registry: BackoffConfig,
}

fn default_transient_backoff() -> BackoffConfig {
    BackoffConfig {
        max_attempts: 3,
        base_backoff_ms: 200,
        max_backoff_ms: 5_000,
    }
}

fn default_registry_backoff() -> BackoffConfig {
    BackoffConfig {
        max_attempts: 5,
        base_backoff_ms: 100,
        max_backoff_ms: 2_000,
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            transient: default_transient_backoff(),
            registry: default_registry_backoff(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for rolling log files
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Address the control API binds to
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// Checkpoint the session before closing on a stop request
    #[serde(default = "default_true")]
    pub checkpoint_on_shutdown: bool,
    /// How long to wait for runs to reach an episode boundary
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_drain_timeout() -> u64 {
    120
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            checkpoint_on_shutdown: true,
            drain_timeout_secs: default_drain_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointConfig {
    /// Checkpoints kept per run; the one a run references is never pruned
    #[serde(default = "default_max_per_run")]
    pub max_per_run: usize,
}

fn default_max_per_run() -> usize {
    5
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            max_per_run: default_max_per_run(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        let home = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".spice");
        let defaults = PathsConfig::under(&home);

        let builder = Config::builder()
            .set_default("paths.pods_dir", path_str(&defaults.pods_dir))?
            .set_default("paths.data_dir", path_str(&defaults.data_dir))?
            .set_default("paths.runs_dir", path_str(&defaults.runs_dir))?
            .set_default("paths.checkpoints_dir", path_str(&defaults.checkpoints_dir))?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific overrides (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("SPICED_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // SPICED__TRAINER__COMMAND, SPICED__PATHS__RUNS_DIR, ...
            .add_source(
                Environment::with_prefix("SPICED")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Configuration rooted at one directory, used by tests and `--root`
    pub fn rooted<P: AsRef<Path>>(root: P) -> Self {
        Self {
            paths: PathsConfig::under(root),
            trainer: TrainerConfig::default(),
            retry: RetryConfig::default(),
            logging: LoggingConfig::default(),
            api: ApiConfig::default(),
            shutdown: ShutdownConfig::default(),
            checkpoints: CheckpointConfig::default(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.trainer.call_timeout_ms == 0 {
            errors.push("trainer.call_timeout_ms must be positive".to_string());
        }
        if self.retry.transient.max_attempts == 0 {
            errors.push("retry.transient.max_attempts must be at least 1".to_string());
        }
        if self.retry.registry.max_attempts == 0 {
            errors.push("retry.registry.max_attempts must be at least 1".to_string());
        }
        if self.checkpoints.max_per_run == 0 {
            errors.push("checkpoints.max_per_run must be at least 1".to_string());
        }
        if self.retry.transient.base_backoff_ms > self.retry.transient.max_backoff_ms {
            errors.push("retry.transient.base_backoff_ms exceeds max_backoff_ms".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
