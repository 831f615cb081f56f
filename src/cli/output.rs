//! Output formatting for `spiced` commands.
//!
//! Supports two modes: human-readable tables (default) and JSON (--json).

use serde::Serialize;
use tabled::{Table, Tabled};

use crate::daemon::RunView;
use crate::persistence::{EpisodeRecord, Termination};

/// Output mode for command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Table,
    Json,
}

impl OutputMode {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            OutputMode::Json
        } else {
            OutputMode::Table
        }
    }
}

/// Print a vec of Tabled + Serialize items in the chosen mode.
pub fn print_items<T: Tabled + Serialize>(items: &[T], mode: OutputMode) -> anyhow::Result<()> {
    match mode {
        OutputMode::Table => {
            if items.is_empty() {
                println!("(no results)");
            } else {
                let table = Table::new(items).to_string();
                println!("{table}");
            }
        }
        OutputMode::Json => {
            let json = serde_json::to_string_pretty(items)?;
            println!("{json}");
        }
    }
    Ok(())
}

/// Print a single Serialize item as JSON.
pub fn print_item<T: Serialize>(item: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(item)?);
    Ok(())
}

/// Print a simple key-value pair.
pub fn print_kv(key: &str, value: &str) {
    println!("{key:>12}: {value}");
}

#[derive(Debug, Serialize, Tabled)]
pub struct RunRow {
    #[tabled(rename = "Run")]
    pub id: String,
    #[tabled(rename = "Pod")]
    pub pod: String,
    #[tabled(rename = "Algorithm")]
    pub algorithm: String,
    #[tabled(rename = "Status")]
    pub status: String,
    #[tabled(rename = "Next")]
    pub progress: String,
    #[tabled(rename = "Episodes")]
    pub episodes: usize,
    #[tabled(rename = "Reward")]
    pub total_reward: String,
    #[tabled(rename = "Updated")]
    pub updated: String,
}

impl From<&RunView> for RunRow {
    fn from(view: &RunView) -> Self {
        let status = if view.active {
            format!("{} *", view.run.status)
        } else {
            view.run.status.to_string()
        };
        Self {
            id: view.run.id.clone(),
            pod: view.run.pod_name.clone(),
            algorithm: view.run.algorithm.clone(),
            status,
            progress: view.run.progress.to_string(),
            episodes: view.run.episodes.len(),
            total_reward: format!("{:.4}", view.total_reward),
            updated: view.run.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
pub struct EpisodeRow {
    #[tabled(rename = "Episode")]
    pub coordinates: String,
    #[tabled(rename = "Steps")]
    pub steps: u32,
    #[tabled(rename = "Reward")]
    pub reward: String,
    #[tabled(rename = "Ended by")]
    pub termination: String,
}

impl From<&EpisodeRecord> for EpisodeRow {
    fn from(record: &EpisodeRecord) -> Self {
        let termination = match &record.termination {
            Termination::EpisodeLength => "length".to_string(),
            Termination::EndOfData => "end of data".to_string(),
            Termination::Signal { reason } => format!("signal: {}", reason),
        };
        Self {
            coordinates: record.coordinates.to_string(),
            steps: record.steps,
            reward: format!("{:.4}", record.cumulative_reward),
            termination,
        }
    }
}
