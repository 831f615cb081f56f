//! Trainer subprocess transport
//!
//! Talks to the external trainer over JSON lines on the child's stdin and
//! stdout. Every request carries an id; responses to requests that already
//! timed out are discarded when they eventually arrive.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{Action, Feedback, SessionFactory, SessionSpec, TrainerSession};
use crate::config::TrainerConfig;
use crate::dataset::Window;
use crate::error::{Result, SpiceError};
use crate::persistence::CheckpointRef;
use crate::pod::ModelShape;

/// Requests understood by the trainer process
#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    Open {
        run_id: &'a str,
        algorithm: &'a str,
        shape: ModelShape,
        actions: &'a [String],
        hyperparameters: &'a BTreeMap<String, serde_json::Value>,
        training_goal: Option<&'a str>,
        seed: u64,
        checkpoint: Option<&'a Path>,
        call_timeout_ms: u64,
    },
    Infer {
        step: u64,
        observation: &'a [Vec<f64>],
    },
    /// Resent unchanged after a timeout; trainers apply each `step` once
    Feedback {
        step: u64,
        action: usize,
        reward: f64,
        next_observation: Option<&'a [Vec<f64>]>,
        done: bool,
    },
    Checkpoint {
        dir: &'a Path,
    },
    Close,
}

impl Request<'_> {
    fn name(&self) -> &'static str {
        match self {
            Request::Open { .. } => "open",
            Request::Infer { .. } => "infer",
            Request::Feedback { .. } => "feedback",
            Request::Checkpoint { .. } => "checkpoint",
            Request::Close => "close",
        }
    }
}

#[derive(Debug, Serialize)]
struct Envelope<'a> {
    id: u64,
    #[serde(flatten)]
    request: Request<'a>,
}

#[derive(Debug, Deserialize)]
struct Response {
    id: u64,
    ok: bool,
    #[serde(default)]
    action: Option<usize>,
    #[serde(default)]
    call_timeout_ms: Option<u64>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl Response {
    fn into_result(self, operation: &str) -> Result<Response> {
        if self.ok {
            return Ok(self);
        }
        let message = self
            .error
            .clone()
            .unwrap_or_else(|| format!("{} failed", operation));
        Err(match self.code.as_deref() {
            Some("algorithm_unavailable") => SpiceError::AlgorithmUnavailable(message),
            Some("checkpoint_incompatible") => SpiceError::CheckpointIncompatible(message),
            _ => SpiceError::Protocol(format!("{}: {}", operation, message)),
        })
    }
}

struct Channel {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
}

/// Session backed by a trainer subprocess
pub struct ProcessSession {
    algorithm: String,
    actions: usize,
    channel: Mutex<Channel>,
    call_timeout: Duration,
    slow_call_timeout: Duration,
    closed: bool,
}

impl ProcessSession {
    /// Spawn the trainer and open a session on it
    pub async fn spawn(
        config: &TrainerConfig,
        spec: &SessionSpec,
        checkpoint: Option<&CheckpointRef>,
    ) -> Result<Self> {
        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            SpiceError::AlgorithmUnavailable(format!(
                "{}: cannot start trainer '{}': {}",
                spec.algorithm, config.command, e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpiceError::Internal("trainer stdin not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpiceError::Internal("trainer stdout not piped".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let run_id = spec.run_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(run_id = %run_id, "trainer: {}", line);
                }
            });
        }

        let mut session = Self {
            algorithm: spec.algorithm.clone(),
            actions: spec.shape.actions,
            channel: Mutex::new(Channel {
                child,
                stdin,
                stdout: BufReader::new(stdout).lines(),
                next_id: 1,
            }),
            call_timeout: Duration::from_millis(config.call_timeout_ms),
            slow_call_timeout: Duration::from_millis(config.slow_call_timeout_ms),
            closed: false,
        };

        let response = session
            .call(
                Request::Open {
                    run_id: &spec.run_id,
                    algorithm: &spec.algorithm,
                    shape: spec.shape,
                    actions: &spec.action_names,
                    hyperparameters: &spec.hyperparameters,
                    training_goal: spec.training_goal.as_deref(),
                    seed: spec.seed,
                    checkpoint: checkpoint.map(|c| c.path.as_path()),
                    call_timeout_ms: config.call_timeout_ms,
                },
                session.slow_call_timeout,
            )
            .await?;

        // The trainer may ask for a longer per-step budget, bounded by the slow timeout.
        if let Some(requested) = response.call_timeout_ms {
            let negotiated = Duration::from_millis(requested).min(session.slow_call_timeout);
            if negotiated != session.call_timeout {
                info!(
                    "Trainer negotiated call timeout {}ms (configured {}ms)",
                    negotiated.as_millis(),
                    session.call_timeout.as_millis()
                );
                session.call_timeout = negotiated;
            }
        }

        Ok(session)
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    async fn call(&self, request: Request<'_>, limit: Duration) -> Result<Response> {
        if self.closed {
            return Err(SpiceError::SessionLost("session is closed".to_string()));
        }

        let operation = request.name();
        let mut channel = self.channel.lock().await;
        let id = channel.next_id;
        channel.next_id += 1;

        let mut line = serde_json::to_vec(&Envelope { id, request })?;
        line.push(b'\n');

        let started = Instant::now();
        let exchange = async {
            channel
                .stdin
                .write_all(&line)
                .await
                .map_err(|e| SpiceError::SessionLost(format!("write {}: {}", operation, e)))?;
            channel
                .stdin
                .flush()
                .await
                .map_err(|e| SpiceError::SessionLost(format!("flush {}: {}", operation, e)))?;

            loop {
                let next = channel
                    .stdout
                    .next_line()
                    .await
                    .map_err(|e| SpiceError::SessionLost(format!("read {}: {}", operation, e)))?;
                let Some(text) = next else {
                    return Err(SpiceError::SessionLost(format!(
                        "trainer exited during {}",
                        operation
                    )));
                };

                let response: Response = serde_json::from_str(&text).map_err(|e| {
                    SpiceError::Protocol(format!("{}: malformed response '{}': {}", operation, text, e))
                })?;
                if response.id == id {
                    return Ok(response);
                }
                debug!("Discarding stale trainer response {} (waiting for {})", response.id, id);
            }
        };

        match timeout(limit, exchange).await {
            Ok(result) => result?.into_result(operation),
            Err(_) => Err(SpiceError::Timeout {
                operation: operation.to_string(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }
}

#[async_trait]
impl TrainerSession for ProcessSession {
    async fn infer(&mut self, step: u64, observation: &Window) -> Result<Action> {
        let response = self
            .call(
                Request::Infer {
                    step,
                    observation: &observation.rows,
                },
                self.call_timeout,
            )
            .await?;

        let index = response
            .action
            .ok_or_else(|| SpiceError::Protocol("infer response without action".to_string()))?;
        if index >= self.actions {
            return Err(SpiceError::Protocol(format!(
                "trainer chose action {} of {}",
                index, self.actions
            )));
        }
        Ok(Action { index })
    }

    async fn feedback(&mut self, feedback: &Feedback) -> Result<()> {
        self.call(
            Request::Feedback {
                step: feedback.step,
                action: feedback.action.index,
                reward: feedback.reward,
                next_observation: feedback.next_observation.as_ref().map(|w| w.rows.as_slice()),
                done: feedback.done,
            },
            self.call_timeout,
        )
        .await?;
        Ok(())
    }

    async fn checkpoint(&mut self, dest: &Path) -> Result<()> {
        self.call(Request::Checkpoint { dir: dest }, self.slow_call_timeout)
            .await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }

        if let Err(e) = self.call(Request::Close, self.call_timeout).await {
            warn!("Trainer did not acknowledge close: {}", e);
        }
        self.closed = true;

        let mut channel = self.channel.lock().await;
        match timeout(self.call_timeout, channel.child.wait()).await {
            Ok(Ok(status)) => debug!("Trainer exited with {}", status),
            _ => {
                warn!("Trainer did not exit after close, killing");
                channel.child.kill().await?;
            }
        }
        Ok(())
    }
}

/// Opens sessions on freshly spawned trainer processes
pub struct ProcessSessionFactory {
    config: TrainerConfig,
}

impl ProcessSessionFactory {
    pub fn new(config: TrainerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionFactory for ProcessSessionFactory {
    async fn open(
        &self,
        spec: &SessionSpec,
        checkpoint: Option<&CheckpointRef>,
    ) -> Result<Box<dyn TrainerSession>> {
        let session = ProcessSession::spawn(&self.config, spec, checkpoint).await?;
        Ok(Box::new(session))
    }
}
