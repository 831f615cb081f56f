//! Training: episodes, rewards, retry and the run orchestrator
//!
//! - `episode`: state machine for one bounded trial against the dataset
//! - `reward`: pluggable step scoring with optional early termination
//! - `retry`: bounded exponential backoff per fault class
//! - `orchestrator`: a pod's lifecycle from validation to completion

pub mod episode;
pub mod orchestrator;
pub mod retry;
pub mod reward;

pub use episode::{Episode, EpisodeContext, EpisodeOutcome, EpisodeState, EpisodeStep};
pub use orchestrator::{Orchestrator, PreparedRun, StartOptions, TrainingContext};
pub use retry::{RetryPolicies, RetryPolicy};
pub use reward::{RewardContext, RewardFunction, RewardOutcome};
