//! Run Registry
//!
//! Durable record of every training run: which pod and algorithm it belongs
//! to, how far it got, and where its latest checkpoint lives. Everything a
//! restarted daemon needs to resume lives in the [`Run`] record.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::checkpoint::CheckpointRef;
use crate::error::{FaultClass, Result, SpiceError};

/// Position in a run's training budget
///
/// Ordered by epoch, then episode. For a run this is the next episode to
/// execute; for a checkpoint it is the run position the weights correspond to.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Coordinates {
    pub epoch: u32,
    pub episode: u32,
}

impl Coordinates {
    pub fn new(epoch: u32, episode: u32) -> Self {
        Self { epoch, episode }
    }
}

impl std::fmt::Display for Coordinates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "epoch {} episode {}", self.epoch, self.episode)
    }
}

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, no episode executed yet
    Pending,
    /// Owned by an active orchestrator
    Running,
    /// Training budget exhausted
    Completed,
    /// Stopped on a fault; may be retried
    Failed,
    /// Stopped on corrupt data; needs an operator
    Paused,
    /// Stopped on request at an episode boundary
    Stopped,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Paused => write!(f, "paused"),
            RunStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Why an episode ended normally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Termination {
    /// Reached the pod's episode length
    EpisodeLength,
    /// Dataset ran out of windows
    EndOfData,
    /// The reward function ended the episode
    Signal { reason: String },
}

/// Committed result of one episode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeRecord {
    pub coordinates: Coordinates,
    pub start_cursor: usize,
    pub steps: u32,
    pub cumulative_reward: f64,
    pub termination: Termination,
    pub finished_at: DateTime<Utc>,
}

/// Recorded cause of a failed or paused run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub class: String,
    pub code: String,
    pub message: String,
    pub coordinates: Coordinates,
    pub at: DateTime<Utc>,
}

/// Persistent progress record for one pod's training
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub pod_name: String,
    pub pod_fingerprint: String,
    pub algorithm: String,
    pub status: RunStatus,
    /// Next episode to execute; everything before it is committed
    pub progress: Coordinates,
    pub episodes: Vec<EpisodeRecord>,
    pub checkpoint: Option<CheckpointRef>,
    pub failure: Option<RunFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(pod_name: &str, pod_fingerprint: &str, algorithm: &str) -> Self {
        let now = Utc::now();
        Self {
            id: format!("{}-{}", pod_name, uuid::Uuid::new_v4().simple()),
            pod_name: pod_name.to_string(),
            pod_fingerprint: pod_fingerprint.to_string(),
            algorithm: algorithm.to_string(),
            status: RunStatus::Pending,
            progress: Coordinates::default(),
            episodes: Vec::new(),
            checkpoint: None,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record a finished episode and move progress past it
    pub fn commit_episode(&mut self, record: EpisodeRecord, episodes_per_epoch: u32) {
        let next = if record.coordinates.episode + 1 >= episodes_per_epoch {
            Coordinates::new(record.coordinates.epoch + 1, 0)
        } else {
            Coordinates::new(record.coordinates.epoch, record.coordinates.episode + 1)
        };
        self.progress = next;
        self.episodes.push(record);
        self.touch();
    }

    /// Undo the last `commit_episode` after its record failed to persist
    pub fn rollback_episode(&mut self, progress: Coordinates) {
        self.episodes.pop();
        self.progress = progress;
        self.touch();
    }

    /// Checkpoints ahead of committed progress indicate corruption
    pub fn checkpoint_is_valid(&self, checkpoint: &CheckpointRef) -> bool {
        checkpoint.coordinates <= self.progress
    }

    pub fn mark(&mut self, status: RunStatus) {
        self.status = status;
        if matches!(status, RunStatus::Running | RunStatus::Completed) {
            self.failure = None;
        }
        self.touch();
    }

    pub fn mark_faulted(&mut self, error: &SpiceError) {
        let status = match error.fault_class() {
            FaultClass::DataCorruption => RunStatus::Paused,
            _ => RunStatus::Failed,
        };
        self.status = status;
        self.failure = Some(RunFailure {
            class: error.fault_class().to_string(),
            code: error.code().to_string(),
            message: error.to_string(),
            coordinates: self.progress,
            at: Utc::now(),
        });
        self.touch();
    }

    pub fn total_reward(&self) -> f64 {
        self.episodes.iter().map(|e| e.cumulative_reward).sum()
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Durable store of run records
#[async_trait]
pub trait RunRegistry: Send + Sync {
    async fn load(&self, run_id: &str) -> Result<Option<Run>>;

    /// Persist a run; a concurrent `load` sees either the old or the new record
    async fn save(&self, run: &Run) -> Result<()>;

    async fn list(&self) -> Result<Vec<Run>>;

    async fn latest_checkpoint(&self, run_id: &str) -> Result<Option<CheckpointRef>> {
        Ok(self.load(run_id).await?.and_then(|run| run.checkpoint))
    }

    /// Newest unfinished run for a pod definition
    async fn find_resumable(&self, pod_name: &str, fingerprint: &str) -> Result<Option<Run>> {
        let runs = self.list().await?;
        Ok(runs
            .into_iter()
            .filter(|r| r.pod_name == pod_name && r.pod_fingerprint == fingerprint)
            .filter(|r| r.status != RunStatus::Completed)
            .max_by_key(|r| r.created_at))
    }
}

/// Registry keeping one JSON document per run
pub struct FileRunRegistry {
    dir: PathBuf,
}

impl FileRunRegistry {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn run_path(&self, run_id: &str) -> Result<PathBuf> {
        let valid = !run_id.is_empty()
            && run_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(SpiceError::Registry(format!("invalid run id '{}'", run_id)));
        }
        Ok(self.dir.join(format!("{}.json", run_id)))
    }

    async fn read_run(path: &Path) -> Result<Run> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| SpiceError::Registry(format!("read {}: {}", path.display(), e)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| SpiceError::Registry(format!("parse {}: {}", path.display(), e)))
    }
}

#[async_trait]
impl RunRegistry for FileRunRegistry {
    async fn load(&self, run_id: &str) -> Result<Option<Run>> {
        let path = self.run_path(run_id)?;
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        Self::read_run(&path).await.map(Some)
    }

    async fn save(&self, run: &Run) -> Result<()> {
        let path = self.run_path(&run.id)?;
        let registry_err = |e: std::io::Error| {
            SpiceError::Registry(format!("save {}: {}", run.id, e))
        };

        tokio::fs::create_dir_all(&self.dir).await.map_err(registry_err)?;

        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", run.id, uuid::Uuid::new_v4().simple()));
        let bytes = serde_json::to_vec_pretty(run)?;

        let mut file = tokio::fs::File::create(&tmp).await.map_err(registry_err)?;
        let written = async {
            file.write_all(&bytes).await?;
            file.sync_all().await
        }
        .await;
        drop(file);

        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(registry_err(e));
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(registry_err(e));
        }

        debug!(run_id = %run.id, status = %run.status, progress = %run.progress, "Saved run");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Run>> {
        let mut runs = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(runs),
            Err(e) => return Err(SpiceError::Registry(format!("list: {}", e))),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SpiceError::Registry(format!("list: {}", e)))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            match Self::read_run(&entry.path()).await {
                Ok(run) => runs.push(run),
                Err(e) => warn!("Skipping unreadable run record {}: {}", name, e),
            }
        }

        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }
}

/// In-memory registry, for tests and ephemeral daemons
#[derive(Default)]
pub struct MemoryRunRegistry {
    runs: RwLock<HashMap<String, Run>>,
}

impl MemoryRunRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunRegistry for MemoryRunRegistry {
    async fn load(&self, run_id: &str) -> Result<Option<Run>> {
        Ok(self.runs.read().await.get(run_id).cloned())
    }

    async fn save(&self, run: &Run) -> Result<()> {
        self.runs.write().await.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Run>> {
        let mut runs: Vec<Run> = self.runs.read().await.values().cloned().collect();
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }
}
