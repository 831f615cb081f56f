//! Training daemon
//!
//! Owns the shared collaborators and the table of active runs. Each pod has
//! at most one active run; runs for different pods train concurrently as
//! independent tasks.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::DaemonConfig;
use crate::coordination::{GracefulShutdown, ShutdownSignal};
use crate::dataset::{Connector, DatasetCatalog, JsonlConnector, WindowProvider};
use crate::error::{Result, SpiceError};
use crate::persistence::{blocking, CheckpointRef, CheckpointStore, Coordinates, FileRunRegistry, Run};
use crate::pod::Pod;
use crate::services::health::{check_readable_dir, check_writable_dir, HealthResponse};
use crate::session::registry::check_compatible;
use crate::session::{AlgorithmRegistry, SessionSpec};
use crate::training::{Orchestrator, RetryPolicies, StartOptions, TrainingContext};

enum Slot {
    /// Being validated; holds the pod's place
    Starting,
    Active(ActiveRun),
}

struct ActiveRun {
    run_id: String,
    stop: Arc<GracefulShutdown>,
    handle: JoinHandle<Result<Run>>,
}

/// A pod's `Starting` slot, released on drop unless the run goes live
struct Reservation<'a> {
    slots: &'a DashMap<String, Slot>,
    pod_name: String,
    live: bool,
}

impl Reservation<'_> {
    fn activate(mut self, active: ActiveRun) {
        self.slots.insert(self.pod_name.clone(), Slot::Active(active));
        self.live = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.live {
            self.slots
                .remove_if(&self.pod_name, |_, slot| matches!(slot, Slot::Starting));
        }
    }
}

/// Run record plus whether it is training right now
#[derive(Debug, Clone, Serialize)]
pub struct RunView {
    #[serde(flatten)]
    pub run: Run,
    pub active: bool,
    pub total_reward: f64,
}

/// Action the latest checkpoint picks for the newest window of data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inference {
    pub pod: String,
    pub run_id: String,
    /// Digest of the checkpoint that answered
    pub checkpoint: String,
    /// Run position the checkpoint was taken at
    pub coordinates: Coordinates,
    /// Time of the newest record in the observed window
    pub time: i64,
    pub action: String,
    pub action_index: usize,
}

/// One record to append to a pod's dataset: `time` plus one value per column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRow {
    pub time: i64,
    #[serde(flatten)]
    pub values: BTreeMap<String, f64>,
}

/// Result of appending rows to a dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataAppend {
    pub pod: String,
    pub source: String,
    pub appended: usize,
    /// Records in the dataset afterwards
    pub records: usize,
}

pub struct Daemon {
    config: DaemonConfig,
    ctx: TrainingContext,
    slots: DashMap<String, Slot>,
    /// Serializes dataset appends
    appends: Mutex<()>,
    started_at: DateTime<Utc>,
}

impl Daemon {
    /// Daemon with file-backed state under the configured paths
    pub fn new(config: DaemonConfig) -> Self {
        let ctx = TrainingContext {
            registry: Arc::new(FileRunRegistry::new(&config.paths.runs_dir)),
            checkpoints: CheckpointStore::new(
                &config.paths.checkpoints_dir,
                config.checkpoints.max_per_run,
            ),
            algorithms: Arc::new(AlgorithmRegistry::from_config(&config.trainer)),
            datasets: Arc::new(DatasetCatalog::new(&config.paths.data_dir)),
            retry: RetryPolicies::from_config(&config.retry),
            checkpoint_on_shutdown: config.shutdown.checkpoint_on_shutdown,
        };
        Self::with_context(config, ctx)
    }

    /// Daemon over explicit collaborators
    pub fn with_context(config: DaemonConfig, ctx: TrainingContext) -> Self {
        Self {
            config,
            ctx,
            slots: DashMap::new(),
            appends: Mutex::new(()),
            started_at: Utc::now(),
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn datasets(&self) -> &DatasetCatalog {
        &self.ctx.datasets
    }

    /// Read `<pods_dir>/<name>.toml`
    pub fn load_pod(&self, name: &str) -> Result<Pod> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(SpiceError::PodNotFound(name.to_string()));
        }
        let path = self.config.paths.pods_dir.join(format!("{}.toml", name));
        if !path.is_file() {
            return Err(SpiceError::PodNotFound(name.to_string()));
        }
        let pod = Pod::load(&path)?;
        if pod.name != name {
            return Err(SpiceError::InvalidPod(format!(
                "{} declares name '{}'",
                path.display(),
                pod.name
            )));
        }
        Ok(pod)
    }

    /// Check a pod against the algorithm registry and reward set
    pub fn validate_pod(&self, name: &str) -> Result<Pod> {
        let pod = self.load_pod(name)?;
        Orchestrator::new(self.ctx.clone()).validate(&pod)?;
        Ok(pod)
    }

    /// Validate and start training a pod in the background
    ///
    /// Configuration errors are returned here; faults during training are
    /// recorded on the run.
    pub async fn start_training(&self, pod: Pod, options: StartOptions) -> Result<Run> {
        let reservation = self.reserve(&pod.name)?;
        let prepared = Orchestrator::new(self.ctx.clone())
            .prepare(pod.clone(), options)
            .await?;

        let run = prepared.run().clone();
        let stop = Arc::new(GracefulShutdown::new());
        let token = stop.token();
        let handle = tokio::spawn(async move { prepared.execute(token).await });

        info!(run_id = %run.id, pod = %pod.name, "Training started");
        reservation.activate(ActiveRun {
            run_id: run.id.clone(),
            stop,
            handle,
        });
        Ok(run)
    }

    /// Load a pod by name and start training it
    pub async fn train_pod(&self, name: &str, options: StartOptions) -> Result<Run> {
        let pod = self.load_pod(name)?;
        self.start_training(pod, options).await
    }

    fn reserve(&self, pod_name: &str) -> Result<Reservation<'_>> {
        match self.slots.entry(pod_name.to_string()) {
            Entry::Occupied(mut entry) => {
                let finished = matches!(entry.get(), Slot::Active(active) if active.handle.is_finished());
                if !finished {
                    return Err(SpiceError::AlreadyTraining(pod_name.to_string()));
                }
                entry.insert(Slot::Starting);
            }
            Entry::Vacant(entry) => {
                entry.insert(Slot::Starting);
            }
        }
        Ok(Reservation {
            slots: &self.slots,
            pod_name: pod_name.to_string(),
            live: false,
        })
    }

    /// Ask a pod's active run to stop at the next episode boundary
    pub fn stop_run(&self, pod_name: &str) -> Result<String> {
        self.signal_run(pod_name, ShutdownSignal::Requested)
    }

    /// Forward a stop signal to a pod's active run
    pub fn signal_run(&self, pod_name: &str, signal: ShutdownSignal) -> Result<String> {
        match self.slots.get(pod_name).as_deref() {
            Some(Slot::Active(active)) if !active.handle.is_finished() => {
                active.stop.request_shutdown(signal);
                Ok(active.run_id.clone())
            }
            _ => Err(SpiceError::RunNotFound(format!(
                "no active run for pod {}",
                pod_name
            ))),
        }
    }

    /// Wait for a pod's active run to finish and return its final record
    pub async fn wait(&self, pod_name: &str) -> Option<Result<Run>> {
        let (_, slot) = self.slots.remove(pod_name)?;
        match slot {
            Slot::Active(active) => Some(join(active.handle).await),
            Slot::Starting => None,
        }
    }

    /// Pods with a run in progress
    pub fn active_pods(&self) -> Vec<String> {
        let mut pods: Vec<String> = self
            .slots
            .iter()
            .filter(|entry| match entry.value() {
                Slot::Active(active) => !active.handle.is_finished(),
                Slot::Starting => true,
            })
            .map(|entry| entry.key().clone())
            .collect();
        pods.sort();
        pods
    }

    fn is_active(&self, run_id: &str) -> bool {
        self.slots.iter().any(|entry| match entry.value() {
            Slot::Active(active) => active.run_id == run_id && !active.handle.is_finished(),
            Slot::Starting => false,
        })
    }

    fn view(&self, run: Run) -> RunView {
        RunView {
            active: self.is_active(&run.id),
            total_reward: run.total_reward(),
            run,
        }
    }

    pub async fn run_status(&self, run_id: &str) -> Result<RunView> {
        let run = self
            .ctx
            .registry
            .load(run_id)
            .await?
            .ok_or_else(|| SpiceError::RunNotFound(run_id.to_string()))?;
        Ok(self.view(run))
    }

    /// All runs, oldest first
    pub async fn list_runs(&self) -> Result<Vec<RunView>> {
        let runs = self.ctx.registry.list().await?;
        Ok(runs.into_iter().map(|run| self.view(run)).collect())
    }

    /// Resume exactly this stopped, failed or paused run
    pub async fn resume_run(&self, run_id: &str) -> Result<Run> {
        let run = self
            .ctx
            .registry
            .load(run_id)
            .await?
            .ok_or_else(|| SpiceError::RunNotFound(run_id.to_string()))?;
        let pod = self.load_pod(&run.pod_name)?;
        if pod.fingerprint() != run.pod_fingerprint {
            return Err(SpiceError::InvalidPod(format!(
                "pod {} changed since run {} started",
                pod.name, run.id
            )));
        }

        let options = StartOptions {
            resume_paused: true,
            run_id: Some(run.id.clone()),
        };
        let resumed = self.start_training(pod, options).await?;
        if resumed.id != run.id {
            return Err(SpiceError::Internal(format!(
                "asked to resume run {} but started {}",
                run.id, resumed.id
            )));
        }
        Ok(resumed)
    }

    /// Newest checkpoint across every run of a pod, with its run id
    async fn latest_checkpoint(&self, pod_name: &str) -> Result<(String, CheckpointRef)> {
        self.ctx
            .registry
            .list()
            .await?
            .into_iter()
            .filter(|run| run.pod_name == pod_name)
            .filter_map(|run| run.checkpoint.map(|checkpoint| (run.id, checkpoint)))
            .max_by_key(|(_, checkpoint)| checkpoint.created_at)
            .ok_or_else(|| SpiceError::NotTrained(pod_name.to_string()))
    }

    /// Copy a pod's most recent checkpoint to `dest`
    pub async fn export_model(&self, pod_name: &str, dest: &Path) -> Result<PathBuf> {
        let (_, latest) = self.latest_checkpoint(pod_name).await?;
        let store = self.ctx.checkpoints.clone();
        let dest = dest.to_path_buf();
        blocking(move || store.export(&latest, &dest)).await
    }

    /// Ask the pod's latest checkpoint for an action on the newest window
    ///
    /// Opens a separate session, so it works whether or not the pod is
    /// training. The session never receives feedback and learns nothing.
    pub async fn infer(&self, pod_name: &str) -> Result<Inference> {
        let pod = self.load_pod(pod_name)?;
        let (run_id, recorded) = self.latest_checkpoint(&pod.name).await?;
        let store = self.ctx.checkpoints.clone();
        let path = recorded.path.clone();
        let checkpoint = blocking(move || store.load(&path)).await?;

        let connector = self.ctx.datasets.resolve(&pod.dataset.source).await?;
        let mut provider = WindowProvider::open(connector, &pod.dataset).await?;
        provider.seek(provider.window_count().saturating_sub(1));
        let window = provider
            .next_window()
            .await?
            .ok_or_else(|| SpiceError::NotEnoughData {
                available: 0,
                required: pod.dataset.window,
            })?;

        let spec = SessionSpec::for_pod(&run_id, &pod);
        let mut session = self.ctx.algorithms.open(&spec, Some(&checkpoint)).await?;
        let inferred = session.infer(0, &window).await;
        if let Err(e) = session.close().await {
            warn!(pod = %pod.name, "Failed to close inference session: {}", e);
        }
        let action = inferred?;

        let name = pod
            .actions
            .get(action.index)
            .map(|a| a.name.clone())
            .ok_or_else(|| {
                SpiceError::Protocol(format!(
                    "action {} outside the {} actions of pod {}",
                    action.index,
                    pod.actions.len(),
                    pod.name
                ))
            })?;
        let time = window.times.last().copied().unwrap_or_default();
        info!(pod = %pod.name, run_id = %run_id, action = %name, "Inference at {}", time);

        Ok(Inference {
            pod: pod.name,
            run_id,
            checkpoint: checkpoint.id,
            coordinates: checkpoint.coordinates,
            time,
            action: name,
            action_index: action.index,
        })
    }

    /// Append records to a pod's file-backed dataset
    ///
    /// Rows must carry exactly the dataset's columns (the pod's fields for a
    /// new file) and times strictly after the last stored record. Runs that
    /// are already training keep the data they opened with.
    pub async fn add_data(&self, pod_name: &str, rows: Vec<DataRow>) -> Result<DataAppend> {
        let pod = self.load_pod(pod_name)?;
        let path = self.ctx.datasets.file_path(&pod.dataset.source)?;
        if rows.is_empty() {
            return Err(SpiceError::InvalidData("no rows to add".to_string()));
        }

        let _guard = self.appends.lock().await;
        let (schema, mut last_time, existing) = if path.is_file() {
            let connector = JsonlConnector::open(&path).await?;
            let existing = connector.len().await?;
            if existing == 0 {
                (pod.dataset.fields.clone(), None, 0)
            } else {
                let last = connector.read(existing - 1, 1).await?;
                let last_time = last.first().map(|record| record.time);
                (connector.schema().to_vec(), last_time, existing)
            }
        } else {
            (pod.dataset.fields.clone(), None, 0)
        };
        let columns: BTreeSet<&str> = schema.iter().map(String::as_str).collect();

        let mut text = String::new();
        for (i, row) in rows.iter().enumerate() {
            if let Some(unexpected) = row.values.keys().find(|k| !columns.contains(k.as_str())) {
                return Err(SpiceError::SchemaMismatch(format!(
                    "row {}: unexpected field '{}' (expected {:?})",
                    i, unexpected, schema
                )));
            }
            if let Some(missing) = columns.iter().find(|c| !row.values.contains_key(**c)) {
                return Err(SpiceError::SchemaMismatch(format!(
                    "row {}: missing field '{}'",
                    i, missing
                )));
            }
            if let Some((column, _)) = row.values.iter().find(|(_, v)| !v.is_finite()) {
                return Err(SpiceError::InvalidData(format!(
                    "row {}: '{}' is not a finite number",
                    i, column
                )));
            }
            if let Some(last) = last_time.filter(|&last| row.time <= last) {
                return Err(SpiceError::InvalidData(format!(
                    "row {}: time {} is not after {}",
                    i, row.time, last
                )));
            }
            last_time = Some(row.time);
            text.push_str(&serde_json::to_string(row)?);
            text.push('\n');
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if existing > 0 {
            let current = tokio::fs::read(&path).await?;
            if current.last() != Some(&b'\n') {
                text.insert(0, '\n');
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(text.as_bytes()).await?;
        file.sync_all().await?;

        info!(pod = %pod.name, "Added {} record(s) to {:?}", rows.len(), path);
        Ok(DataAppend {
            pod: pod.name,
            source: pod.dataset.source,
            appended: rows.len(),
            records: existing + rows.len(),
        })
    }

    /// Seed a new run of a pod with an exported checkpoint
    pub async fn import_model(&self, pod_name: &str, source: &Path) -> Result<Run> {
        let pod = self.load_pod(pod_name)?;
        if self.active_pods().contains(&pod.name) {
            return Err(SpiceError::AlreadyTraining(pod.name));
        }

        let mut run = Run::new(&pod.name, &pod.fingerprint(), &pod.algorithm);
        let store = self.ctx.checkpoints.clone();
        let (from, run_id) = (source.to_path_buf(), run.id.clone());
        let checkpoint = blocking(move || store.import(&from, &run_id)).await?;

        let spec = SessionSpec::for_pod(&run.id, &pod);
        if let Err(e) = check_compatible(&spec, &checkpoint) {
            if let Err(io) = tokio::fs::remove_dir_all(&checkpoint.path).await {
                warn!("Failed to remove rejected import {:?}: {}", checkpoint.path, io);
            }
            return Err(e);
        }

        run.checkpoint = Some(checkpoint);
        self.ctx.registry.save(&run).await?;
        info!(run_id = %run.id, pod = %pod.name, "Imported model from {:?}", source);
        Ok(run)
    }

    pub async fn health(&self) -> HealthResponse {
        let paths = &self.config.paths;
        let components = vec![
            check_writable_dir("runs", &paths.runs_dir),
            check_writable_dir("checkpoints", &paths.checkpoints_dir),
            check_readable_dir("pods", &paths.pods_dir),
            check_readable_dir("data", &paths.data_dir),
        ];
        HealthResponse::from_components(
            self.started_at,
            self.active_pods(),
            self.ctx.algorithms.algorithms(),
            components,
        )
    }

    /// Stop every active run and wait for them to reach an episode boundary
    pub async fn shutdown(&self, signal: ShutdownSignal) {
        let pods: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        if pods.is_empty() {
            return;
        }
        info!("Stopping {} run(s) ({})", pods.len(), signal);

        for entry in self.slots.iter() {
            if let Slot::Active(active) = entry.value() {
                active.stop.request_shutdown(signal);
            }
        }

        let drain = Duration::from_secs(self.config.shutdown.drain_timeout_secs);
        let waits = pods
            .iter()
            .map(|pod| async move { (pod.as_str(), self.wait(pod).await) });
        match tokio::time::timeout(drain, futures::future::join_all(waits)).await {
            Ok(results) => {
                for (pod, result) in results {
                    match result {
                        Some(Ok(run)) => info!(run_id = %run.id, pod = %pod, "Run {}", run.status),
                        Some(Err(e)) => error!(pod = %pod, "Run ended with error: {}", e),
                        None => {}
                    }
                }
            }
            Err(_) => warn!("Runs did not stop within {:?}", drain),
        }
    }
}

async fn join(handle: JoinHandle<Result<Run>>) -> Result<Run> {
    handle
        .await
        .map_err(|e| SpiceError::Internal(format!("training task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackoffConfig, RetryConfig};
    use crate::dataset::{MemoryConnector, Record};
    use crate::persistence::RunStatus;
    use crate::pod::tests::SAMPLE_POD;
    use crate::session::registry::RANDOM_ALGORITHM;
    use crate::session::{RandomSessionFactory, SessionFactory, TrainerSession};
    use async_trait::async_trait;

    /// Random policy that takes a while to come up
    struct SlowFactory;

    #[async_trait]
    impl SessionFactory for SlowFactory {
        async fn open(
            &self,
            spec: &SessionSpec,
            checkpoint: Option<&CheckpointRef>,
        ) -> Result<Box<dyn TrainerSession>> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            RandomSessionFactory.open(spec, checkpoint).await
        }
    }

    fn row(time: i64, close: f64) -> DataRow {
        DataRow {
            time,
            values: BTreeMap::from([("close".to_string(), close), ("volume".to_string(), 1.0)]),
        }
    }

    fn daemon() -> Daemon {
        let root = std::env::temp_dir().join(format!("spiced-daemon-{}", uuid::Uuid::new_v4()));
        let mut config = DaemonConfig::rooted(&root);
        config.trainer.algorithms = vec![];
        let backoff = BackoffConfig {
            max_attempts: 2,
            base_backoff_ms: 1,
            max_backoff_ms: 1,
        };
        config.retry = RetryConfig {
            transient: backoff,
            registry: backoff,
        };

        std::fs::create_dir_all(&config.paths.pods_dir).unwrap();
        let pod = SAMPLE_POD
            .replace("algorithm = \"dql\"", "algorithm = \"random\"")
            .replace("window = 3", "window = 1");
        std::fs::write(config.paths.pods_dir.join("btc.toml"), pod).unwrap();

        let daemon = Daemon::new(config);
        let records = (0..40)
            .map(|i| Record {
                time: i as i64,
                values: vec![50.0 + (i % 5) as f64, 1.0],
            })
            .collect();
        daemon.datasets().register(
            "btcusd.jsonl",
            Arc::new(MemoryConnector::new(
                "btcusd",
                vec!["close".to_string(), "volume".to_string()],
                records,
            )),
        );
        daemon
    }

    #[tokio::test]
    async fn test_train_and_export_import() {
        let daemon = daemon();
        let run = daemon.train_pod("btc", StartOptions::default()).await.unwrap();
        let finished = daemon.wait("btc").await.unwrap().unwrap();
        assert_eq!(finished.id, run.id);
        assert_eq!(finished.status, RunStatus::Completed);
        assert_eq!(finished.episodes.len(), 8);

        let view = daemon.run_status(&run.id).await.unwrap();
        assert!(!view.active);
        assert_eq!(view.run.status, RunStatus::Completed);

        let dest = std::env::temp_dir().join(format!("spiced-export-{}", uuid::Uuid::new_v4()));
        daemon.export_model("btc", &dest).await.unwrap();
        assert!(dest.join(crate::persistence::META_FILE).exists());

        let seeded = daemon.import_model("btc", &dest).await.unwrap();
        assert_ne!(seeded.id, run.id);
        assert_eq!(seeded.status, RunStatus::Pending);
        assert!(seeded.checkpoint.is_some());
    }

    #[tokio::test]
    async fn test_second_start_is_already_training() {
        let daemon = daemon();
        let _held = daemon.reserve("btc").unwrap();
        let err = daemon
            .train_pod("btc", StartOptions::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "already_training");
    }

    #[tokio::test]
    async fn test_unknown_pod_and_untrained_export() {
        let daemon = daemon();
        assert!(matches!(
            daemon.load_pod("eth").err().unwrap(),
            SpiceError::PodNotFound(_)
        ));
        assert!(matches!(
            daemon.load_pod("../btc").err().unwrap(),
            SpiceError::PodNotFound(_)
        ));
        let err = daemon
            .export_model("btc", Path::new("/tmp/unused"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "pod_not_trained");
        assert!(daemon.stop_run("btc").is_err());
    }

    #[tokio::test]
    async fn test_health_reports_algorithms() {
        let daemon = daemon();
        let health = daemon.health().await;
        assert_eq!(health.algorithms, vec!["random".to_string()]);
        assert!(health.active_runs.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_start_releases_pod() {
        let mut daemon = daemon();
        let mut algorithms = AlgorithmRegistry::new();
        algorithms.register(RANDOM_ALGORITHM, Arc::new(SlowFactory));
        daemon.ctx.algorithms = Arc::new(algorithms);

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            daemon.train_pod("btc", StartOptions::default()),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(daemon.active_pods().is_empty());

        let run = daemon.train_pod("btc", StartOptions::default()).await.unwrap();
        let finished = daemon.wait("btc").await.unwrap().unwrap();
        assert_eq!(finished.id, run.id);
        assert_eq!(finished.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_resume_targets_requested_run() {
        let daemon = daemon();
        let completed = daemon.train_pod("btc", StartOptions::default()).await.unwrap();
        daemon.wait("btc").await.unwrap().unwrap();
        let err = daemon.resume_run(&completed.id).await.err().unwrap();
        assert_eq!(err.code(), "invalid_state_transition");

        let pod = daemon.load_pod("btc").unwrap();
        let mut older = Run::new(&pod.name, &pod.fingerprint(), &pod.algorithm);
        older.mark(RunStatus::Stopped);
        daemon.ctx.registry.save(&older).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let mut newer = Run::new(&pod.name, &pod.fingerprint(), &pod.algorithm);
        newer.mark(RunStatus::Stopped);
        daemon.ctx.registry.save(&newer).await.unwrap();

        let resumed = daemon.resume_run(&older.id).await.unwrap();
        assert_eq!(resumed.id, older.id);
        let finished = daemon.wait("btc").await.unwrap().unwrap();
        assert_eq!(finished.id, older.id);
        assert_eq!(finished.status, RunStatus::Completed);

        let untouched = daemon.run_status(&newer.id).await.unwrap();
        assert_eq!(untouched.run.status, RunStatus::Stopped);
    }

    #[tokio::test]
    async fn test_infer_uses_latest_checkpoint() {
        let daemon = daemon();
        let err = daemon.infer("btc").await.unwrap_err();
        assert_eq!(err.code(), "pod_not_trained");

        let run = daemon.train_pod("btc", StartOptions::default()).await.unwrap();
        let finished = daemon.wait("btc").await.unwrap().unwrap();
        let checkpoint = finished.checkpoint.unwrap();

        let inference = daemon.infer("btc").await.unwrap();
        assert_eq!(inference.run_id, run.id);
        assert_eq!(inference.checkpoint, checkpoint.id);
        assert_eq!(inference.coordinates, checkpoint.coordinates);
        assert_eq!(inference.time, 39);
        assert!(["buy", "sell", "hold"].contains(&inference.action.as_str()));
        assert!(inference.action_index < 3);
    }

    #[tokio::test]
    async fn test_add_data_appends_in_order() {
        let daemon = daemon();
        let eth = SAMPLE_POD
            .replace("name = \"btc\"", "name = \"eth\"")
            .replace("btcusd.jsonl", "ethusd.jsonl");
        std::fs::write(daemon.config.paths.pods_dir.join("eth.toml"), eth).unwrap();

        let added = daemon
            .add_data("eth", (0..5).map(|t| row(t, 100.0 + t as f64)).collect())
            .await
            .unwrap();
        assert_eq!(added.appended, 5);
        assert_eq!(added.records, 5);

        let stale = daemon.add_data("eth", vec![row(4, 1.0)]).await.unwrap_err();
        assert_eq!(stale.code(), "invalid_data");

        let mut extra = row(5, 1.0);
        extra.values.insert("funding".to_string(), 0.01);
        let unexpected = daemon.add_data("eth", vec![extra]).await.unwrap_err();
        assert_eq!(unexpected.code(), "schema_mismatch");

        let mut partial = row(5, 1.0);
        partial.values.remove("volume");
        let missing = daemon.add_data("eth", vec![partial]).await.unwrap_err();
        assert_eq!(missing.code(), "schema_mismatch");

        let added = daemon.add_data("eth", vec![row(5, 105.0)]).await.unwrap();
        assert_eq!(added.records, 6);

        let path = daemon.config.paths.data_dir.join("ethusd.jsonl");
        let connector = JsonlConnector::open(&path).await.unwrap();
        assert_eq!(connector.schema(), ["close".to_string(), "volume".to_string()]);
        let records = connector.read(0, 10).await.unwrap();
        assert_eq!(records.len(), 6);
        assert_eq!(records[5].time, 5);
        assert_eq!(records[5].values, vec![105.0, 1.0]);

        let registered = daemon.add_data("btc", vec![row(100, 1.0)]).await.unwrap_err();
        assert_eq!(registered.code(), "invalid_data");
        assert!(daemon.add_data("eth", vec![]).await.is_err());
    }
}
