//! Trainer Session Protocol
//!
//! A session is the daemon's handle on one algorithm instance and the model
//! state it accumulates. The contract is the same whichever algorithm backs
//! it:
//!
//! - `infer` asks for an action for one observation
//! - `feedback` reports the outcome of that action; it must arrive before the
//!   next `infer` on the same session. A timed-out feedback is resent with
//!   the same `step`, so backends apply each step at most once
//! - `checkpoint` writes a durable snapshot, only between episodes
//! - `close` releases the backend and may be called more than once
//!
//! Taking `&mut self` on every call keeps a session to one in-flight request.

pub mod process;
pub mod random;
pub mod registry;

pub use process::{ProcessSession, ProcessSessionFactory};
pub use random::{RandomSession, RandomSessionFactory};
pub use registry::AlgorithmRegistry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::dataset::Window;
use crate::error::Result;
use crate::persistence::CheckpointRef;
use crate::pod::{ModelShape, Pod};

/// Discrete action chosen by the trainer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub index: usize,
}

/// Everything a backend needs to open a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSpec {
    pub run_id: String,
    pub algorithm: String,
    pub shape: ModelShape,
    pub action_names: Vec<String>,
    pub hyperparameters: BTreeMap<String, serde_json::Value>,
    pub training_goal: Option<String>,
    pub seed: u64,
}

impl SessionSpec {
    pub fn for_pod(run_id: &str, pod: &Pod) -> Self {
        Self {
            run_id: run_id.to_string(),
            algorithm: pod.algorithm.clone(),
            shape: pod.shape(),
            action_names: pod.action_names(),
            hyperparameters: pod.hyperparameters.clone(),
            training_goal: pod.training_goal.clone(),
            seed: pod.dataset.seed,
        }
    }
}

/// Outcome of one step, reported back to the trainer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub step: u64,
    pub action: Action,
    pub reward: f64,
    /// `None` when the dataset ran out
    pub next_observation: Option<Window>,
    pub done: bool,
}

/// Stateful handle on one algorithm instance
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrainerSession: Send {
    /// Request an action for an observation
    async fn infer(&mut self, step: u64, observation: &Window) -> Result<Action>;

    /// Report the outcome of the last inferred action
    ///
    /// A repeat for a step that was already applied is a resend and must
    /// succeed without learning from it twice.
    async fn feedback(&mut self, feedback: &Feedback) -> Result<()>;

    /// Write the model state into `dest`
    async fn checkpoint(&mut self, dest: &Path) -> Result<()>;

    /// Release resources; idempotent
    async fn close(&mut self) -> Result<()>;
}

/// Opens sessions for one algorithm backend
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(
        &self,
        spec: &SessionSpec,
        checkpoint: Option<&CheckpointRef>,
    ) -> Result<Box<dyn TrainerSession>>;
}
