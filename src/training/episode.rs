//! Episode State Machine
//!
//! Drives one episode from its planned start cursor:
//!
//! ```text
//! Idle ──start──▶ Stepping ──(length | end of data | reward signal)──▶ Terminated
//!   │                │
//!   └────────────────┴──(session error | retries exhausted | corrupt data)──▶ Aborted
//! ```
//!
//! Each step submits the current window, scores the chosen action against
//! the following window and reports the outcome before the next `infer`.
//! The last step of an episode peeks its next window instead of consuming
//! it, since that window belongs to the next episode.

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use super::retry::{with_retry, RetryPolicy};
use super::reward::{RewardContext, RewardFunction};
use crate::dataset::WindowProvider;
use crate::error::{Result, SpiceError};
use crate::persistence::{Coordinates, EpisodeRecord, Termination};
use crate::pod::ActionSpec;
use crate::session::{Feedback, TrainerSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeState {
    Idle,
    Stepping,
    Terminated,
    Aborted,
}

impl std::fmt::Display for EpisodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EpisodeState::Idle => write!(f, "idle"),
            EpisodeState::Stepping => write!(f, "stepping"),
            EpisodeState::Terminated => write!(f, "terminated"),
            EpisodeState::Aborted => write!(f, "aborted"),
        }
    }
}

/// One emitted transition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpisodeStep {
    pub step: u64,
    /// Cursor of the observation the action was chosen for
    pub cursor: usize,
    pub action: usize,
    pub reward: f64,
    pub done: bool,
}

#[derive(Debug)]
pub enum EpisodeOutcome {
    Terminated {
        record: EpisodeRecord,
        transitions: Vec<EpisodeStep>,
    },
    Aborted {
        coordinates: Coordinates,
        steps: u32,
        cumulative_reward: f64,
        error: SpiceError,
    },
}

/// Collaborators an episode borrows for its duration
pub struct EpisodeContext<'a> {
    pub provider: &'a mut WindowProvider,
    pub session: &'a mut dyn TrainerSession,
    pub reward: &'a mut dyn RewardFunction,
    pub actions: &'a [ActionSpec],
    pub retry: RetryPolicy,
}

pub struct Episode {
    coordinates: Coordinates,
    start_cursor: usize,
    length: u32,
    state: EpisodeState,
    steps: u32,
    cumulative_reward: f64,
    transitions: Vec<EpisodeStep>,
}

impl Episode {
    pub fn new(coordinates: Coordinates, start_cursor: usize, length: u32) -> Self {
        Self {
            coordinates,
            start_cursor,
            length: length.max(1),
            state: EpisodeState::Idle,
            steps: 0,
            cumulative_reward: 0.0,
            transitions: Vec::new(),
        }
    }

    pub fn state(&self) -> EpisodeState {
        self.state
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }

    pub fn cumulative_reward(&self) -> f64 {
        self.cumulative_reward
    }

    fn transition(&mut self, to: EpisodeState) -> Result<()> {
        use EpisodeState::*;
        let allowed = matches!(
            (self.state, to),
            (Idle, Stepping) | (Stepping, Terminated) | (Idle, Aborted) | (Stepping, Aborted)
        );
        if !allowed {
            return Err(SpiceError::InvalidStateTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        self.state = to;
        Ok(())
    }

    /// Run the episode to termination or abort
    ///
    /// Only a second run of the same episode is an error; every fault during
    /// stepping is reported as [`EpisodeOutcome::Aborted`].
    pub async fn run(&mut self, mut ctx: EpisodeContext<'_>) -> Result<EpisodeOutcome> {
        self.transition(EpisodeState::Stepping)?;
        debug!(
            epoch = self.coordinates.epoch,
            episode = self.coordinates.episode,
            "Episode starting at cursor {}",
            self.start_cursor
        );

        match self.drive(&mut ctx).await {
            Ok(termination) => {
                self.transition(EpisodeState::Terminated)?;
                let record = EpisodeRecord {
                    coordinates: self.coordinates,
                    start_cursor: self.start_cursor,
                    steps: self.steps,
                    cumulative_reward: self.cumulative_reward,
                    termination,
                    finished_at: Utc::now(),
                };
                Ok(EpisodeOutcome::Terminated {
                    record,
                    transitions: std::mem::take(&mut self.transitions),
                })
            }
            Err(error) => {
                self.transition(EpisodeState::Aborted)?;
                warn!(
                    epoch = self.coordinates.epoch,
                    episode = self.coordinates.episode,
                    "Episode aborted after {} steps: {}",
                    self.steps,
                    error
                );
                Ok(EpisodeOutcome::Aborted {
                    coordinates: self.coordinates,
                    steps: self.steps,
                    cumulative_reward: self.cumulative_reward,
                    error,
                })
            }
        }
    }

    async fn drive(&mut self, ctx: &mut EpisodeContext<'_>) -> Result<Termination> {
        let retry = ctx.retry;
        ctx.provider.seek(self.start_cursor);
        ctx.reward.reset();

        let mut current = match with_retry!(retry, "read window", ctx.provider.next_window())? {
            Some(window) => window,
            None => return Ok(Termination::EndOfData),
        };

        loop {
            let step = u64::from(self.steps);
            let action = with_retry!(retry, "infer", ctx.session.infer(step, &current))?;
            let spec = ctx.actions.get(action.index).ok_or_else(|| {
                SpiceError::Protocol(format!(
                    "action index {} out of range ({} actions)",
                    action.index,
                    ctx.actions.len()
                ))
            })?;

            let last = self.steps + 1 >= self.length;
            let next = if last {
                with_retry!(retry, "peek window", ctx.provider.peek_window())?
            } else {
                with_retry!(retry, "read window", ctx.provider.next_window())?
            };

            let outcome = ctx.reward.compute(&RewardContext {
                step,
                action: spec,
                observation: &current,
                next_observation: next.as_ref(),
            })?;

            let termination = match (outcome.terminate, next.is_some()) {
                (Some(reason), _) => Some(Termination::Signal { reason }),
                (None, false) => Some(Termination::EndOfData),
                (None, true) if last => Some(Termination::EpisodeLength),
                _ => None,
            };

            let feedback = Feedback {
                step,
                action,
                reward: outcome.reward,
                next_observation: next,
                done: termination.is_some(),
            };
            with_retry!(retry, "feedback", ctx.session.feedback(&feedback))?;

            self.steps += 1;
            self.cumulative_reward += outcome.reward;
            self.transitions.push(EpisodeStep {
                step,
                cursor: current.cursor,
                action: action.index,
                reward: outcome.reward,
                done: feedback.done,
            });

            if let Some(termination) = termination {
                return Ok(termination);
            }
            let Some(window) = feedback.next_observation else {
                return Ok(Termination::EndOfData);
            };
            current = window;
        }
    }
}
