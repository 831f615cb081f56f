//! Training Orchestrator
//!
//! Owns one pod's training lifecycle:
//!
//! 1. Validate the pod and open its dataset
//! 2. Resolve the run to resume, or create a new one
//! 3. Open a trainer session from the run's latest valid checkpoint
//! 4. Run episodes in order, committing progress after each
//! 5. Checkpoint at every epoch boundary
//! 6. Honor stop requests between episodes
//!
//! Preparation errors are returned to the caller and no episode runs. Faults
//! during training are recorded on the run as `failed` or `paused`.

use std::sync::Arc;
use tracing::{error, info, warn};

use super::episode::{Episode, EpisodeContext, EpisodeOutcome};
use super::retry::{with_retry, RetryPolicies};
use super::reward::{self, RewardFunction};
use crate::coordination::{ShutdownSignal, ShutdownToken};
use crate::dataset::{DatasetCatalog, WindowProvider};
use crate::error::{Result, SpiceError};
use crate::persistence::{blocking, CheckpointRef, CheckpointStore, Run, RunRegistry, RunStatus};
use crate::pod::Pod;
use crate::session::{AlgorithmRegistry, SessionSpec, TrainerSession};

/// Shared collaborators for every run the daemon drives
#[derive(Clone)]
pub struct TrainingContext {
    pub registry: Arc<dyn RunRegistry>,
    pub checkpoints: CheckpointStore,
    pub algorithms: Arc<AlgorithmRegistry>,
    pub datasets: Arc<DatasetCatalog>,
    pub retry: RetryPolicies,
    /// Checkpoint before stopping on request
    pub checkpoint_on_shutdown: bool,
}

/// Per-start choices made by the operator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// Allow resuming a run paused on corrupt data
    pub resume_paused: bool,
    /// Resume this run instead of the pod's newest unfinished one
    pub run_id: Option<String>,
}

pub struct Orchestrator {
    ctx: TrainingContext,
}

impl Orchestrator {
    pub fn new(ctx: TrainingContext) -> Self {
        Self { ctx }
    }

    /// Check a pod can be trained without touching the dataset
    pub fn validate(&self, pod: &Pod) -> Result<()> {
        pod.validate()?;
        if !self.ctx.algorithms.is_known(&pod.algorithm) {
            return Err(SpiceError::AlgorithmUnavailable(format!(
                "{} (available: {})",
                pod.algorithm,
                self.ctx.algorithms.algorithms().join(", ")
            )));
        }
        reward::build(pod).map(|_| ())
    }

    /// Validate, resolve the run and open its session
    pub async fn prepare(&self, pod: Pod, options: StartOptions) -> Result<PreparedRun> {
        self.validate(&pod)?;
        let reward = reward::build(&pod)?;

        let connector = self.ctx.datasets.resolve(&pod.dataset.source).await?;
        let provider = WindowProvider::open(connector, &pod.dataset).await?;

        let mut run = self.resolve_run(&pod, &options).await?;

        let checkpoint = match self.checkpoint_for(&run).await {
            Ok(checkpoint) => checkpoint,
            Err(e) => return Err(self.reject(&mut run, e).await),
        };

        let spec = SessionSpec::for_pod(&run.id, &pod);
        let session = match self.ctx.algorithms.open(&spec, checkpoint.as_ref()).await {
            Ok(session) => session,
            Err(e) => return Err(self.reject(&mut run, e).await),
        };

        Ok(PreparedRun {
            ctx: self.ctx.clone(),
            pod,
            run,
            provider,
            session,
            reward,
        })
    }

    async fn resolve_run(&self, pod: &Pod, options: &StartOptions) -> Result<Run> {
        let fingerprint = pod.fingerprint();
        let found = match &options.run_id {
            Some(run_id) => Some(self.requested_run(pod, &fingerprint, run_id).await?),
            None => {
                self.ctx
                    .registry
                    .find_resumable(&pod.name, &fingerprint)
                    .await?
            }
        };
        match found {
            Some(run) if run.status == RunStatus::Paused && !options.resume_paused => {
                Err(SpiceError::InvalidStateTransition {
                    from: format!("paused run {}", run.id),
                    to: RunStatus::Running.to_string(),
                })
            }
            Some(run) => {
                info!(
                    run_id = %run.id,
                    pod = %pod.name,
                    "Resuming {} run at {}",
                    run.status,
                    run.progress
                );
                Ok(run)
            }
            None => {
                let run = Run::new(&pod.name, &fingerprint, &pod.algorithm);
                info!(run_id = %run.id, pod = %pod.name, algorithm = %pod.algorithm, "Created run");
                Ok(run)
            }
        }
    }

    /// A specific run of this pod definition that has not completed
    async fn requested_run(&self, pod: &Pod, fingerprint: &str, run_id: &str) -> Result<Run> {
        let run = self
            .ctx
            .registry
            .load(run_id)
            .await?
            .ok_or_else(|| SpiceError::RunNotFound(run_id.to_string()))?;
        if run.pod_name != pod.name || run.pod_fingerprint != fingerprint {
            return Err(SpiceError::InvalidPod(format!(
                "run {} was not started from the current definition of pod {}",
                run.id, pod.name
            )));
        }
        if run.status == RunStatus::Completed {
            return Err(SpiceError::InvalidStateTransition {
                from: format!("completed run {}", run.id),
                to: RunStatus::Running.to_string(),
            });
        }
        Ok(run)
    }

    /// The run's checkpoint, verified on disk and against its progress
    ///
    /// Both the reference in the run record and the metadata on disk must sit
    /// at or before committed progress, and they must name the same payload.
    async fn checkpoint_for(&self, run: &Run) -> Result<Option<CheckpointRef>> {
        let Some(checkpoint) = &run.checkpoint else {
            return Ok(None);
        };
        if !run.checkpoint_is_valid(checkpoint) {
            return Err(SpiceError::InvalidCheckpoint(format!(
                "checkpoint at {} is ahead of committed progress {}",
                checkpoint.coordinates, run.progress
            )));
        }

        let store = self.ctx.checkpoints.clone();
        let path = checkpoint.path.clone();
        let loaded = blocking(move || store.load(&path)).await?;
        if loaded.id != checkpoint.id {
            return Err(SpiceError::InvalidCheckpoint(format!(
                "{}: payload {} is not the recorded checkpoint {}",
                loaded.path.display(),
                &loaded.id[..12],
                &checkpoint.id[..checkpoint.id.len().min(12)]
            )));
        }
        if !run.checkpoint_is_valid(&loaded) {
            return Err(SpiceError::InvalidCheckpoint(format!(
                "{}: metadata places it at {}, ahead of committed progress {}",
                loaded.path.display(),
                loaded.coordinates,
                run.progress
            )));
        }
        Ok(Some(loaded))
    }

    /// Record a failure that happened before any episode ran
    async fn reject(&self, run: &mut Run, error: SpiceError) -> SpiceError {
        error!(run_id = %run.id, "Run cannot start: {}", error);
        run.mark_faulted(&error);
        if let Err(e) = save_run(&self.ctx, run).await {
            error!(run_id = %run.id, "Failed to record run failure: {}", e);
        }
        error
    }
}

async fn save_run(ctx: &TrainingContext, run: &Run) -> Result<()> {
    let registry = ctx.registry.as_ref();
    ctx.retry
        .registry
        .run("save run", move || registry.save(run))
        .await
}

/// A run ready to train: dataset open, session live
pub struct PreparedRun {
    ctx: TrainingContext,
    pod: Pod,
    run: Run,
    provider: WindowProvider,
    session: Box<dyn TrainerSession>,
    reward: Box<dyn RewardFunction>,
}

impl PreparedRun {
    pub fn run(&self) -> &Run {
        &self.run
    }

    /// Train until the budget is spent, a fault occurs or a stop is requested
    ///
    /// Returns the final run record; `Err` only when that record could not
    /// be saved.
    pub async fn execute(mut self, shutdown: ShutdownToken) -> Result<Run> {
        let result = self.train(&shutdown).await;

        if let Err(e) = self.session.close().await {
            warn!(run_id = %self.run.id, "Failed to close trainer session: {}", e);
        }

        match result {
            Ok(status) => {
                self.run.mark(status);
                info!(
                    run_id = %self.run.id,
                    episodes = self.run.episodes.len(),
                    total_reward = self.run.total_reward(),
                    "Run {}",
                    status
                );
            }
            Err(e) => {
                self.run.mark_faulted(&e);
                error!(
                    run_id = %self.run.id,
                    "Run {} at {}: {}",
                    self.run.status,
                    self.run.progress,
                    e
                );
            }
        }
        save_run(&self.ctx, &self.run).await?;
        Ok(self.run)
    }

    async fn train(&mut self, shutdown: &ShutdownToken) -> Result<RunStatus> {
        self.run.mark(RunStatus::Running);
        save_run(&self.ctx, &self.run).await?;

        let length = self.pod.episode_length;
        let episodes_per_epoch = self
            .provider
            .episode_plan(0, length, self.pod.episodes_per_epoch)
            .len() as u32;

        while self.run.progress.epoch < self.pod.epochs {
            if let Some(signal) = shutdown.signal() {
                return self.stop(signal).await;
            }

            let coordinates = self.run.progress;
            let plan = self
                .provider
                .episode_plan(coordinates.epoch, length, self.pod.episodes_per_epoch);
            let start = plan.get(coordinates.episode as usize).copied().ok_or_else(|| {
                SpiceError::CorruptData(format!(
                    "dataset no longer has episode {} ({} planned)",
                    coordinates,
                    plan.len()
                ))
            })?;

            let mut episode = Episode::new(coordinates, start, length);
            let outcome = episode
                .run(EpisodeContext {
                    provider: &mut self.provider,
                    session: self.session.as_mut(),
                    reward: self.reward.as_mut(),
                    actions: &self.pod.actions,
                    retry: self.ctx.retry.transient,
                })
                .await?;

            let record = match outcome {
                EpisodeOutcome::Terminated { record, .. } => record,
                EpisodeOutcome::Aborted { error, .. } => return Err(error),
            };

            info!(
                run_id = %self.run.id,
                epoch = coordinates.epoch,
                episode = coordinates.episode,
                steps = record.steps,
                reward = record.cumulative_reward,
                "Episode complete"
            );
            self.run.commit_episode(record, episodes_per_epoch);
            if let Err(e) = save_run(&self.ctx, &self.run).await {
                // Unsaved episodes are replayed on resume.
                self.run.rollback_episode(coordinates);
                return Err(e);
            }

            if self.run.progress.episode == 0 {
                self.checkpoint().await?;
            }
        }

        Ok(RunStatus::Completed)
    }

    async fn stop(&mut self, signal: ShutdownSignal) -> Result<RunStatus> {
        info!(
            run_id = %self.run.id,
            "Stopping run at {} ({})",
            self.run.progress,
            signal
        );

        let stale = match &self.run.checkpoint {
            Some(checkpoint) => checkpoint.coordinates < self.run.progress,
            None => !self.run.episodes.is_empty(),
        };
        if self.ctx.checkpoint_on_shutdown && signal != ShutdownSignal::Urgent && stale {
            self.checkpoint().await?;
        }
        Ok(RunStatus::Stopped)
    }

    /// Snapshot the session at the current progress and record it on the run
    ///
    /// The previous checkpoint stays referenced until the new one is sealed.
    async fn checkpoint(&mut self) -> Result<()> {
        let coordinates = self.run.progress;
        let store = self.ctx.checkpoints.clone();
        let run_id = self.run.id.clone();
        let staging = blocking({
            let (store, run_id) = (store.clone(), run_id.clone());
            move || store.staging_dir(&run_id, coordinates)
        })
        .await?;

        let retry = self.ctx.retry.transient;
        let written = with_retry!(retry, "checkpoint", self.session.checkpoint(&staging));
        let sealed = match written {
            Ok(()) => {
                let (store, staging, run_id) = (store.clone(), staging.clone(), run_id.clone());
                let (algorithm, shape) = (self.pod.algorithm.clone(), self.pod.shape());
                blocking(move || store.commit(&staging, &run_id, &algorithm, coordinates, shape))
                    .await
            }
            Err(e) => Err(e),
        };
        let checkpoint = match sealed {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                let store = store.clone();
                let discarded = blocking(move || {
                    store.discard(&staging);
                    Ok(())
                });
                if let Err(join) = discarded.await {
                    warn!(run_id = %run_id, "Failed to discard staged checkpoint: {}", join);
                }
                return Err(e);
            }
        };

        self.run.checkpoint = Some(checkpoint.clone());
        save_run(&self.ctx, &self.run).await?;
        blocking(move || {
            store.prune(&run_id, &checkpoint.path);
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackoffConfig, RetryConfig};
    use crate::coordination::GracefulShutdown;
    use crate::dataset::{MemoryConnector, Record};
    use crate::persistence::{CheckpointMeta, Coordinates, MemoryRunRegistry, Termination, META_FILE};
    use crate::pod::tests::SAMPLE_POD;
    use crate::session::registry::RANDOM_ALGORITHM;
    use crate::session::RandomSessionFactory;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Registry that refuses the save attempts `refuse` picks, counted from zero
    struct FlakyRegistry {
        inner: MemoryRunRegistry,
        saves: AtomicU32,
        refuse: fn(u32) -> bool,
    }

    impl FlakyRegistry {
        fn new(refuse: fn(u32) -> bool) -> Self {
            Self {
                inner: MemoryRunRegistry::new(),
                saves: AtomicU32::new(0),
                refuse,
            }
        }
    }

    #[async_trait]
    impl RunRegistry for FlakyRegistry {
        async fn load(&self, run_id: &str) -> Result<Option<Run>> {
            self.inner.load(run_id).await
        }

        async fn save(&self, run: &Run) -> Result<()> {
            let attempt = self.saves.fetch_add(1, Ordering::SeqCst);
            if (self.refuse)(attempt) {
                return Err(SpiceError::Registry(format!("save attempt {} refused", attempt)));
            }
            self.inner.save(run).await
        }

        async fn list(&self) -> Result<Vec<Run>> {
            self.inner.list().await
        }
    }

    fn fast_retry() -> RetryPolicies {
        let backoff = BackoffConfig {
            max_attempts: 3,
            base_backoff_ms: 1,
            max_backoff_ms: 2,
        };
        RetryPolicies::from_config(&RetryConfig {
            transient: backoff,
            registry: backoff,
        })
    }

    fn context(records: usize) -> TrainingContext {
        let datasets = DatasetCatalog::new(std::env::temp_dir());
        let data = (0..records)
            .map(|i| Record {
                time: 1_000 + i as i64 * 60,
                values: vec![100.0 + (i % 7) as f64, 5.0],
            })
            .collect();
        datasets.register(
            "btcusd.jsonl",
            Arc::new(MemoryConnector::new(
                "btcusd",
                vec!["close".to_string(), "volume".to_string()],
                data,
            )),
        );

        let mut algorithms = AlgorithmRegistry::new();
        algorithms.register(RANDOM_ALGORITHM, Arc::new(RandomSessionFactory));

        TrainingContext {
            registry: Arc::new(MemoryRunRegistry::new()),
            checkpoints: CheckpointStore::new(
                std::env::temp_dir().join(format!("spiced-orch-{}", uuid::Uuid::new_v4())),
                5,
            ),
            algorithms: Arc::new(algorithms),
            datasets: Arc::new(datasets),
            retry: fast_retry(),
            checkpoint_on_shutdown: true,
        }
    }

    fn random_pod() -> Pod {
        let mut pod = Pod::from_toml(SAMPLE_POD).unwrap();
        pod.algorithm = RANDOM_ALGORITHM.to_string();
        pod.dataset.window = 1;
        pod
    }

    #[tokio::test]
    async fn test_completed_run_records_full_budget() {
        let ctx = context(25);
        let orchestrator = Orchestrator::new(ctx.clone());
        let prepared = orchestrator
            .prepare(random_pod(), StartOptions::default())
            .await
            .unwrap();
        let shutdown = GracefulShutdown::new();
        let run = prepared.execute(shutdown.token()).await.unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        // 2 epochs x 3 episodes over 25 records
        assert_eq!(run.episodes.len(), 6);
        assert!(run.episodes.iter().all(|e| e.steps <= 10));
        assert_eq!(run.episodes[2].termination, Termination::EndOfData);
        assert_eq!(run.progress, Coordinates::new(2, 0));

        let checkpoint = run.checkpoint.clone().unwrap();
        assert_eq!(checkpoint.coordinates, Coordinates::new(2, 0));
        assert_eq!(ctx.checkpoints.list(&run.id).len(), 2);

        let saved = ctx.registry.load(&run.id).await.unwrap().unwrap();
        assert_eq!(saved, run);
    }

    #[tokio::test]
    async fn test_unknown_algorithm_fails_before_run() {
        let ctx = context(25);
        let mut pod = random_pod();
        pod.algorithm = "ppo".to_string();
        let err = Orchestrator::new(ctx.clone())
            .prepare(pod, StartOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SpiceError::AlgorithmUnavailable(_)));
        assert!(ctx.registry.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_schema_mismatch_fails_before_run() {
        let ctx = context(25);
        let mut pod = random_pod();
        pod.dataset.fields = vec!["close".to_string(), "funding".to_string()];
        let err = Orchestrator::new(ctx)
            .prepare(pod, StartOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SpiceError::SchemaMismatch(_)));
    }

    #[tokio::test]
    async fn test_stop_request_checkpoints_and_resumes() {
        let ctx = context(25);
        let orchestrator = Orchestrator::new(ctx.clone());

        let prepared = orchestrator
            .prepare(random_pod(), StartOptions::default())
            .await
            .unwrap();
        let shutdown = GracefulShutdown::new();
        shutdown.request_shutdown(ShutdownSignal::Requested);
        let stopped = prepared.execute(shutdown.token()).await.unwrap();
        assert_eq!(stopped.status, RunStatus::Stopped);
        assert!(stopped.episodes.is_empty());
        assert!(stopped.checkpoint.is_none());

        let resumed = orchestrator
            .prepare(random_pod(), StartOptions::default())
            .await
            .unwrap();
        assert_eq!(resumed.run().id, stopped.id);
        let run = resumed
            .execute(GracefulShutdown::new().token())
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.episodes.len(), 6);
    }

    #[tokio::test]
    async fn test_paused_run_needs_explicit_resume() {
        let ctx = context(25);
        let pod = random_pod();
        let mut run = Run::new(&pod.name, &pod.fingerprint(), &pod.algorithm);
        run.mark_faulted(&SpiceError::CorruptData("row 3".into()));
        assert_eq!(run.status, RunStatus::Paused);
        ctx.registry.save(&run).await.unwrap();

        let orchestrator = Orchestrator::new(ctx);
        let err = orchestrator
            .prepare(pod.clone(), StartOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SpiceError::InvalidStateTransition { .. }));

        let prepared = orchestrator
            .prepare(
                pod,
                StartOptions {
                    resume_paused: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(prepared.run().id, run.id);
    }

    #[tokio::test]
    async fn test_checkpoint_ahead_of_progress_is_rejected() {
        let ctx = context(25);
        let orchestrator = Orchestrator::new(ctx.clone());
        let run = orchestrator
            .prepare(random_pod(), StartOptions::default())
            .await
            .unwrap()
            .execute(GracefulShutdown::new().token())
            .await
            .unwrap();

        // A completed run is not resumed; fake an earlier progress instead.
        let mut rewound = run.clone();
        rewound.status = RunStatus::Failed;
        rewound.progress = Coordinates::new(1, 0);
        ctx.registry.save(&rewound).await.unwrap();

        let err = orchestrator
            .prepare(random_pod(), StartOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SpiceError::InvalidCheckpoint(_)));
        let saved = ctx.registry.load(&run.id).await.unwrap().unwrap();
        assert_eq!(saved.status, RunStatus::Paused);
    }

    #[tokio::test]
    async fn test_registry_retry_absorbs_single_failures() {
        let mut ctx = context(25);
        ctx.registry = Arc::new(FlakyRegistry::new(|attempt| attempt % 2 == 0));
        let run = Orchestrator::new(ctx.clone())
            .prepare(random_pod(), StartOptions::default())
            .await
            .unwrap()
            .execute(GracefulShutdown::new().token())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.episodes.len(), 6);
        let saved = ctx.registry.load(&run.id).await.unwrap().unwrap();
        assert_eq!(saved, run);
    }

    #[tokio::test]
    async fn test_unsaved_episode_is_replayed_on_resume() {
        let mut ctx = context(25);
        // Save 0 marks the run running and save 1 commits (0, 0); every
        // attempt at committing (0, 1) is refused.
        ctx.registry = Arc::new(FlakyRegistry::new(|attempt| (2..5).contains(&attempt)));
        let orchestrator = Orchestrator::new(ctx.clone());

        let failed = orchestrator
            .prepare(random_pod(), StartOptions::default())
            .await
            .unwrap()
            .execute(GracefulShutdown::new().token())
            .await
            .unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(failed.progress, Coordinates::new(0, 1));
        assert_eq!(failed.episodes.len(), 1);
        assert_eq!(failed.failure.as_ref().unwrap().code, "registry_error");
        let saved = ctx.registry.load(&failed.id).await.unwrap().unwrap();
        assert_eq!(saved, failed);

        let resumed = orchestrator
            .prepare(random_pod(), StartOptions::default())
            .await
            .unwrap();
        assert_eq!(resumed.run().id, failed.id);
        let run = resumed
            .execute(GracefulShutdown::new().token())
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.episodes.len(), 6);
        let unique: HashSet<Coordinates> = run.episodes.iter().map(|e| e.coordinates).collect();
        assert_eq!(unique.len(), 6);
    }

    #[tokio::test]
    async fn test_checkpoint_metadata_ahead_of_progress_is_rejected() {
        let ctx = context(25);
        let orchestrator = Orchestrator::new(ctx.clone());
        let run = orchestrator
            .prepare(random_pod(), StartOptions::default())
            .await
            .unwrap()
            .execute(GracefulShutdown::new().token())
            .await
            .unwrap();
        let checkpoint = run.checkpoint.clone().unwrap();

        // The run record still agrees with its reference; only meta.json moves.
        let mut reopened = run.clone();
        reopened.status = RunStatus::Failed;
        ctx.registry.save(&reopened).await.unwrap();
        let meta_path = checkpoint.path.join(META_FILE);
        let mut meta: CheckpointMeta =
            serde_json::from_slice(&std::fs::read(&meta_path).unwrap()).unwrap();
        meta.coordinates = Coordinates::new(5, 0);
        std::fs::write(&meta_path, serde_json::to_vec(&meta).unwrap()).unwrap();

        let err = orchestrator
            .prepare(random_pod(), StartOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SpiceError::InvalidCheckpoint(_)));
        let saved = ctx.registry.load(&run.id).await.unwrap().unwrap();
        assert_eq!(saved.status, RunStatus::Paused);
    }

    #[tokio::test]
    async fn test_explicit_run_id_resumes_that_run() {
        let ctx = context(25);
        let pod = random_pod();
        let mut older = Run::new(&pod.name, &pod.fingerprint(), &pod.algorithm);
        older.mark(RunStatus::Stopped);
        ctx.registry.save(&older).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let mut newer = Run::new(&pod.name, &pod.fingerprint(), &pod.algorithm);
        newer.mark(RunStatus::Stopped);
        ctx.registry.save(&newer).await.unwrap();

        let orchestrator = Orchestrator::new(ctx.clone());
        let implicit = orchestrator
            .prepare(pod.clone(), StartOptions::default())
            .await
            .unwrap();
        assert_eq!(implicit.run().id, newer.id);

        let explicit = orchestrator
            .prepare(
                pod.clone(),
                StartOptions {
                    run_id: Some(older.id.clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(explicit.run().id, older.id);

        let err = orchestrator
            .prepare(
                pod,
                StartOptions {
                    run_id: Some("btc-missing".to_string()),
                    ..Default::default()
                },
            )
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SpiceError::RunNotFound(_)));
    }

    #[tokio::test]
    async fn test_explicit_completed_run_is_not_restarted() {
        let ctx = context(25);
        let orchestrator = Orchestrator::new(ctx.clone());
        let run = orchestrator
            .prepare(random_pod(), StartOptions::default())
            .await
            .unwrap()
            .execute(GracefulShutdown::new().token())
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);

        let err = orchestrator
            .prepare(
                random_pod(),
                StartOptions {
                    run_id: Some(run.id.clone()),
                    ..Default::default()
                },
            )
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SpiceError::InvalidStateTransition { .. }));
        assert_eq!(ctx.registry.list().await.unwrap().len(), 1);
    }
}
