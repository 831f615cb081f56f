use async_trait::async_trait;
use serde_json::Value;
use spiced::{
    config::{BackoffConfig, RetryConfig},
    dataset::Window,
    persistence::{Coordinates, Termination},
    session::{Action, Feedback, SessionSpec},
    training::RetryPolicies,
    AlgorithmRegistry, CheckpointRef, CheckpointStore, Daemon, DaemonConfig, DatasetCatalog,
    FileRunRegistry, GracefulShutdown, MemoryConnector, MemoryRunRegistry, Orchestrator, Pod,
    Record, RunRegistry, RunStatus, SessionFactory, ShutdownSignal, SpiceError, StartOptions,
    TrainerSession, TrainingContext,
};
use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use uuid::Uuid;

const POD: &str = r#"
name = "btc"
algorithm = "scripted"
reward = "position_pnl"
episode_length = 10
epochs = 2

[[actions]]
name = "buy"
position = 1.0

[[actions]]
name = "sell"
position = -1.0

[[actions]]
name = "hold"

[dataset]
source = "btcusd.jsonl"
fields = ["close", "volume"]
window = 1
"#;

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Open(Option<Coordinates>),
    Infer { step: u64, cursor: usize },
    Feedback { step: u64, done: bool },
    Checkpoint,
    Close,
}

/// Deterministic trainer that logs every call it receives
struct ScriptedSession {
    calls: Arc<Mutex<Vec<Call>>>,
    feedbacks: u64,
    stop: Option<(u64, Arc<GracefulShutdown>)>,
    timeout_after: Option<u64>,
}

#[async_trait]
impl TrainerSession for ScriptedSession {
    async fn infer(&mut self, step: u64, observation: &Window) -> spiced::Result<Action> {
        if self.timeout_after.is_some_and(|n| self.feedbacks >= n) {
            return Err(SpiceError::Timeout {
                operation: "infer".to_string(),
                elapsed_ms: 200,
            });
        }
        self.calls.lock().unwrap().push(Call::Infer {
            step,
            cursor: observation.cursor,
        });
        Ok(Action {
            index: observation.cursor % 3,
        })
    }

    async fn feedback(&mut self, feedback: &Feedback) -> spiced::Result<()> {
        self.calls.lock().unwrap().push(Call::Feedback {
            step: feedback.step,
            done: feedback.done,
        });
        self.feedbacks += 1;
        if let Some((after, shutdown)) = &self.stop {
            if self.feedbacks == *after {
                shutdown.request_shutdown(ShutdownSignal::Requested);
            }
        }
        Ok(())
    }

    async fn checkpoint(&mut self, dest: &Path) -> spiced::Result<()> {
        self.calls.lock().unwrap().push(Call::Checkpoint);
        tokio::fs::create_dir_all(dest).await?;
        tokio::fs::write(dest.join("weights.json"), self.feedbacks.to_string()).await?;
        Ok(())
    }

    async fn close(&mut self) -> spiced::Result<()> {
        self.calls.lock().unwrap().push(Call::Close);
        Ok(())
    }
}

#[derive(Clone, Default)]
struct ScriptedFactory {
    calls: Arc<Mutex<Vec<Call>>>,
    stop: Arc<Mutex<Option<(u64, Arc<GracefulShutdown>)>>>,
    timeout_after: Arc<Mutex<Option<u64>>>,
}

impl ScriptedFactory {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn stop_after(&self, feedbacks: u64, shutdown: Arc<GracefulShutdown>) {
        *self.stop.lock().unwrap() = Some((feedbacks, shutdown));
    }

    fn time_out_after(&self, feedbacks: u64) {
        *self.timeout_after.lock().unwrap() = Some(feedbacks);
    }
}

#[async_trait]
impl SessionFactory for ScriptedFactory {
    async fn open(
        &self,
        _spec: &SessionSpec,
        checkpoint: Option<&CheckpointRef>,
    ) -> spiced::Result<Box<dyn TrainerSession>> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Open(checkpoint.map(|c| c.coordinates)));
        Ok(Box::new(ScriptedSession {
            calls: self.calls.clone(),
            feedbacks: 0,
            stop: self.stop.lock().unwrap().take(),
            timeout_after: *self.timeout_after.lock().unwrap(),
        }))
    }
}

fn scratch_dir(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("spiced-it-{}-{}", label, Uuid::new_v4()))
}

fn fast_retry() -> RetryPolicies {
    let backoff = BackoffConfig {
        max_attempts: 2,
        base_backoff_ms: 1,
        max_backoff_ms: 1,
    };
    RetryPolicies::from_config(&RetryConfig {
        transient: backoff,
        registry: backoff,
    })
}

fn context(records: usize, factory: &ScriptedFactory) -> TrainingContext {
    let datasets = DatasetCatalog::new(scratch_dir("data"));
    let data = (0..records)
        .map(|i| Record {
            time: 1_700_000_000 + i as i64 * 60,
            values: vec![100.0 + (i % 5) as f64, 10.0],
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
    algorithms.register("scripted", Arc::new(factory.clone()));

    TrainingContext {
        registry: Arc::new(MemoryRunRegistry::new()),
        checkpoints: CheckpointStore::new(scratch_dir("checkpoints"), 5),
        algorithms: Arc::new(algorithms),
        datasets: Arc::new(datasets),
        retry: fast_retry(),
        checkpoint_on_shutdown: true,
    }
}

fn pod() -> Pod {
    Pod::from_toml(POD).unwrap()
}

async fn train(ctx: &TrainingContext, shutdown: &GracefulShutdown) -> spiced::Result<spiced::Run> {
    let prepared = Orchestrator::new(ctx.clone())
        .prepare(pod(), StartOptions::default())
        .await?;
    prepared.execute(shutdown.token()).await
}

#[tokio::test]
async fn test_scripted_session_sees_ordered_calls() {
    let factory = ScriptedFactory::default();
    let ctx = context(25, &factory);

    let run = train(&ctx, &GracefulShutdown::new()).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.episodes.len(), 6);

    let steps: Vec<u32> = run.episodes.iter().map(|e| e.steps).collect();
    assert_eq!(steps, vec![10, 10, 5, 10, 10, 5]);
    assert_eq!(run.episodes[2].termination, Termination::EndOfData);
    assert_eq!(run.episodes[0].termination, Termination::EpisodeLength);

    let calls = factory.calls();
    assert_eq!(calls.first(), Some(&Call::Open(None)));
    assert_eq!(calls.last(), Some(&Call::Close));

    // Every infer is answered by feedback for the same step before the next infer
    let exchanges: Vec<&Call> = calls
        .iter()
        .filter(|c| matches!(c, Call::Infer { .. } | Call::Feedback { .. }))
        .collect();
    assert_eq!(exchanges.len(), 2 * 50);
    for pair in exchanges.chunks(2) {
        match (pair[0], pair[1]) {
            (Call::Infer { step: a, .. }, Call::Feedback { step: b, .. }) => assert_eq!(a, b),
            other => panic!("unexpected call order: {:?}", other),
        }
    }

    // The first epoch observes records 0..25 in order
    let cursors: Vec<usize> = calls
        .iter()
        .filter_map(|c| match c {
            Call::Infer { cursor, .. } => Some(*cursor),
            _ => None,
        })
        .take(25)
        .collect();
    assert_eq!(cursors, (0..25).collect::<Vec<_>>());

    let checkpoints = calls.iter().filter(|c| **c == Call::Checkpoint).count();
    assert_eq!(checkpoints, 2);
}

#[tokio::test]
async fn test_resumed_run_matches_uninterrupted_run() {
    let baseline_factory = ScriptedFactory::default();
    let baseline_ctx = context(40, &baseline_factory);
    let baseline = train(&baseline_ctx, &GracefulShutdown::new()).await.unwrap();
    assert_eq!(baseline.status, RunStatus::Completed);

    let factory = ScriptedFactory::default();
    let ctx = context(40, &factory);
    let shutdown = Arc::new(GracefulShutdown::new());
    // Stop requested mid-way through the second episode
    factory.stop_after(12, shutdown.clone());

    let stopped = train(&ctx, &shutdown).await.unwrap();
    assert_eq!(stopped.status, RunStatus::Stopped);
    assert_eq!(stopped.progress, Coordinates::new(0, 2));
    assert_eq!(stopped.episodes.len(), 2);
    let checkpoint = stopped.checkpoint.clone().unwrap();
    assert_eq!(checkpoint.coordinates, Coordinates::new(0, 2));

    let resumed = train(&ctx, &GracefulShutdown::new()).await.unwrap();
    assert_eq!(resumed.id, stopped.id);
    assert_eq!(resumed.status, RunStatus::Completed);
    assert!(factory
        .calls()
        .contains(&Call::Open(Some(Coordinates::new(0, 2)))));

    let walk = |run: &spiced::Run| -> Vec<(Coordinates, usize, u32)> {
        run.episodes
            .iter()
            .map(|e| (e.coordinates, e.start_cursor, e.steps))
            .collect()
    };
    assert_eq!(walk(&resumed), walk(&baseline));
    assert_eq!(resumed.total_reward(), baseline.total_reward());
}

#[tokio::test]
async fn test_exhausted_timeouts_fail_run_and_keep_checkpoint() {
    let factory = ScriptedFactory::default();
    let ctx = context(25, &factory);
    // Epoch 0 is 25 steps; the trainer stops answering at step 5 of epoch 1
    factory.time_out_after(30);

    let run = train(&ctx, &GracefulShutdown::new()).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.progress, Coordinates::new(1, 0));
    assert_eq!(run.episodes.len(), 3);

    let failure = run.failure.clone().unwrap();
    assert_eq!(failure.code, "timeout");
    assert_eq!(failure.coordinates, Coordinates::new(1, 0));

    let checkpoint = run.checkpoint.clone().unwrap();
    assert_eq!(checkpoint.coordinates, Coordinates::new(1, 0));
    assert_eq!(ctx.checkpoints.list(&run.id), vec![checkpoint.path.clone()]);
    assert!(ctx.checkpoints.load(&checkpoint.path).is_ok());
}

#[tokio::test]
async fn test_incompatible_checkpoint_fails_before_any_episode() {
    let factory = ScriptedFactory::default();
    let ctx = context(40, &factory);
    let shutdown = Arc::new(GracefulShutdown::new());
    factory.stop_after(5, shutdown.clone());

    let stopped = train(&ctx, &shutdown).await.unwrap();
    assert_eq!(stopped.status, RunStatus::Stopped);
    let checkpoint = stopped.checkpoint.clone().unwrap();

    // Rewrite the recorded shape so it no longer fits the pod
    let meta_path = checkpoint.path.join(spiced::persistence::META_FILE);
    let mut meta: Value = serde_json::from_slice(&std::fs::read(&meta_path).unwrap()).unwrap();
    meta["shape"]["actions"] = Value::from(5);
    std::fs::write(&meta_path, serde_json::to_vec(&meta).unwrap()).unwrap();

    let calls_before = factory.calls().len();
    let err = train(&ctx, &GracefulShutdown::new()).await.err().unwrap();
    assert!(matches!(err, SpiceError::CheckpointIncompatible(_)));
    assert_eq!(factory.calls().len(), calls_before);

    let saved = ctx.registry.load(&stopped.id).await.unwrap().unwrap();
    assert_eq!(saved.status, RunStatus::Failed);
    assert_eq!(saved.episodes.len(), stopped.episodes.len());
    assert_eq!(saved.failure.unwrap().code, "checkpoint_incompatible");
}

fn write_daemon_files(root: &Path, lines: &[String]) {
    std::fs::create_dir_all(root.join("pods")).unwrap();
    std::fs::create_dir_all(root.join("data")).unwrap();
    std::fs::write(
        root.join("pods").join("btc.toml"),
        POD.replace("\"scripted\"", "\"random\""),
    )
    .unwrap();
    std::fs::write(root.join("data").join("btcusd.jsonl"), lines.join("\n")).unwrap();
}

fn jsonl_lines(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| {
            format!(
                r#"{{"time": {}, "close": {}, "volume": 3.5}}"#,
                1_700_000_000 + i * 60,
                100.0 + (i % 4) as f64
            )
        })
        .collect()
}

fn daemon_config(root: &Path) -> DaemonConfig {
    let mut config = DaemonConfig::rooted(root);
    config.trainer.algorithms = vec![];
    config
}

#[tokio::test]
async fn test_daemon_trains_from_files_and_persists_run() {
    let root = scratch_dir("daemon");
    write_daemon_files(&root, &jsonl_lines(25));
    let daemon = Daemon::new(daemon_config(&root));

    let started = daemon.train_pod("btc", StartOptions::default()).await.unwrap();
    let run = daemon.wait("btc").await.unwrap().unwrap();
    assert_eq!(run.id, started.id);
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.episodes.len(), 6);

    // A fresh registry over the same directory reads back the identical record
    let registry = FileRunRegistry::new(root.join("runs"));
    let reloaded = registry.load(&run.id).await.unwrap().unwrap();
    assert_eq!(reloaded, run);

    let exported = daemon
        .export_model("btc", &root.join("export"))
        .await
        .unwrap();
    assert!(exported.join(spiced::persistence::META_FILE).is_file());

    // Training a completed pod again starts a new run
    daemon.train_pod("btc", StartOptions::default()).await.unwrap();
    let second = daemon.wait("btc").await.unwrap().unwrap();
    assert_ne!(second.id, run.id);
    assert_eq!(daemon.list_runs().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_corrupt_record_pauses_run() {
    let root = scratch_dir("corrupt");
    let mut lines = jsonl_lines(30);
    lines[14] = r#"{"time": 1700000840, "close": "n/a", "volume": 3.5}"#.to_string();
    write_daemon_files(&root, &lines);
    let daemon = Daemon::new(daemon_config(&root));

    daemon.train_pod("btc", StartOptions::default()).await.unwrap();
    let run = daemon.wait("btc").await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Paused);
    assert_eq!(run.failure.as_ref().unwrap().code, "corrupt_data");

    // A paused run is only picked up again on explicit request
    let err = daemon
        .train_pod("btc", StartOptions::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, SpiceError::InvalidStateTransition { .. }));

    std::fs::write(root.join("data").join("btcusd.jsonl"), jsonl_lines(30).join("\n")).unwrap();
    daemon
        .train_pod(
            "btc",
            StartOptions {
                resume_paused: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let resumed = daemon.wait("btc").await.unwrap().unwrap();
    assert_eq!(resumed.id, run.id);
    assert_eq!(resumed.status, RunStatus::Completed);
}
