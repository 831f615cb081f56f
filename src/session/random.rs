//! In-process baseline policy
//!
//! Picks actions uniformly at random from a seeded generator. It learns
//! nothing, but it honours the full session contract, which makes it useful
//! for smoke-testing pods without a trainer process.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{Action, Feedback, SessionFactory, SessionSpec, TrainerSession};
use crate::dataset::Window;
use crate::error::{Result, SpiceError};
use crate::persistence::CheckpointRef;

const STATE_FILE: &str = "random_policy.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PolicyState {
    seed: u64,
    steps: u64,
    total_reward: f64,
}

/// Seeded uniform-random policy
pub struct RandomSession {
    actions: usize,
    rng: StdRng,
    state: PolicyState,
    awaiting_feedback: Option<u64>,
    /// Last step whose feedback was applied
    applied: Option<u64>,
    closed: bool,
}

impl RandomSession {
    pub fn new(seed: u64, actions: usize) -> Self {
        Self::restore(
            PolicyState {
                seed,
                steps: 0,
                total_reward: 0.0,
            },
            actions,
        )
    }

    fn restore(state: PolicyState, actions: usize) -> Self {
        // Reseeding from the step count keeps a resumed policy on the same stream.
        let rng = StdRng::seed_from_u64(state.seed.wrapping_add(state.steps));
        Self {
            actions: actions.max(1),
            rng,
            state,
            awaiting_feedback: None,
            applied: None,
            closed: false,
        }
    }

    /// Steps learned from so far, including restored ones
    pub fn steps(&self) -> u64 {
        self.state.steps
    }

    pub fn total_reward(&self) -> f64 {
        self.state.total_reward
    }
}

#[async_trait]
impl TrainerSession for RandomSession {
    async fn infer(&mut self, step: u64, _observation: &Window) -> Result<Action> {
        if self.closed {
            return Err(SpiceError::SessionLost("session is closed".to_string()));
        }
        // Re-asking for the same step is a retry, not a new step.
        if let Some(pending) = self.awaiting_feedback.filter(|&p| p != step) {
            return Err(SpiceError::Protocol(format!(
                "infer for step {} before feedback for step {}",
                step, pending
            )));
        }
        self.awaiting_feedback = Some(step);
        Ok(Action {
            index: self.rng.gen_range(0..self.actions),
        })
    }

    async fn feedback(&mut self, feedback: &Feedback) -> Result<()> {
        match self.awaiting_feedback {
            Some(step) if step == feedback.step => {
                self.awaiting_feedback = None;
                self.applied = Some(step);
                self.state.steps += 1;
                self.state.total_reward += feedback.reward;
                Ok(())
            }
            // Resend of a step already learned from
            None if self.applied == Some(feedback.step) => Ok(()),
            other => Err(SpiceError::Protocol(format!(
                "feedback for step {} while awaiting {:?}",
                feedback.step, other
            ))),
        }
    }

    async fn checkpoint(&mut self, dest: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dest).await?;
        let bytes = serde_json::to_vec_pretty(&self.state)?;
        tokio::fs::write(dest.join(STATE_FILE), bytes).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Factory for [`RandomSession`]
pub struct RandomSessionFactory;

#[async_trait]
impl SessionFactory for RandomSessionFactory {
    async fn open(
        &self,
        spec: &SessionSpec,
        checkpoint: Option<&CheckpointRef>,
    ) -> Result<Box<dyn TrainerSession>> {
        let session = match checkpoint {
            Some(checkpoint) => {
                let path = checkpoint.path.join(STATE_FILE);
                let bytes = tokio::fs::read(&path).await.map_err(|e| {
                    SpiceError::InvalidCheckpoint(format!("{}: {}", path.display(), e))
                })?;
                let state: PolicyState = serde_json::from_slice(&bytes).map_err(|e| {
                    SpiceError::InvalidCheckpoint(format!("{}: {}", path.display(), e))
                })?;
                RandomSession::restore(state, spec.shape.actions)
            }
            None => RandomSession::new(spec.seed, spec.shape.actions),
        };
        Ok(Box::new(session))
    }
}
