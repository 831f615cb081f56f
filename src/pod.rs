//! Pod definitions
//!
//! A pod is the declarative description of one training task: which dataset
//! to replay, which algorithm learns, how rewards are computed and how much
//! training to do. Pods are read from TOML and never mutated by the core.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use crate::error::{Result, SpiceError};

/// Declarative training task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    /// Pod name, unique per daemon
    pub name: String,
    /// Algorithm identifier (vpg, dql, sacd, random, ...)
    pub algorithm: String,
    /// Reward function identifier
    pub reward: String,
    /// Maximum steps per episode
    pub episode_length: u32,
    /// Number of epochs in the training budget
    #[serde(default = "default_epochs")]
    pub epochs: u32,
    /// Episodes per epoch; defaults to as many as the dataset holds
    #[serde(default)]
    pub episodes_per_epoch: Option<u32>,
    /// Discrete action space
    pub actions: Vec<ActionSpec>,
    /// Dataset and windowing
    pub dataset: DatasetSpec,
    /// Opaque hyperparameters forwarded to the trainer
    #[serde(default)]
    pub hyperparameters: BTreeMap<String, serde_json::Value>,
    /// Parameters for the reward function
    #[serde(default)]
    pub reward_params: BTreeMap<String, f64>,
    /// Free-form training goal, forwarded to the trainer
    #[serde(default)]
    pub training_goal: Option<String>,
}

fn default_epochs() -> u32 {
    1
}

/// One discrete action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub name: String,
    /// Market exposure taken by this action (1 long, -1 short, 0 flat)
    #[serde(default)]
    pub position: f64,
}

/// How episodes are laid over the dataset within an epoch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeOrder {
    /// Episode k covers chunk k
    #[default]
    Sequential,
    /// Chunks are permuted per epoch from the dataset seed
    Shuffled,
}

/// Dataset reference and observation layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSpec {
    /// Dataset file, relative to the daemon's data directory
    pub source: String,
    /// Columns that make up one observation row
    pub fields: Vec<String>,
    /// Rows per observation window
    #[serde(default = "default_window")]
    pub window: usize,
    /// Seed for episode ordering
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub order: EpisodeOrder,
}

fn default_window() -> usize {
    1
}

impl Pod {
    /// Parse a pod from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load a pod from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&text)
    }

    /// Check the pod is internally consistent
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            errors.push("name must be non-empty ASCII letters, digits, '-' or '_'".to_string());
        }
        if self.algorithm.trim().is_empty() {
            errors.push("algorithm must not be empty".to_string());
        }
        if self.episode_length == 0 {
            errors.push("episode_length must be greater than 0".to_string());
        }
        if self.epochs == 0 {
            errors.push("epochs must be greater than 0".to_string());
        }
        if self.episodes_per_epoch == Some(0) {
            errors.push("episodes_per_epoch must be greater than 0".to_string());
        }
        if self.actions.is_empty() {
            errors.push("missing actions".to_string());
        }
        let mut seen = HashSet::new();
        for action in &self.actions {
            if !seen.insert(action.name.as_str()) {
                errors.push(format!("duplicate action '{}'", action.name));
            }
            if !action.position.is_finite() {
                errors.push(format!("action '{}' has a non-finite position", action.name));
            }
        }
        if self.dataset.fields.is_empty() {
            errors.push("missing fields".to_string());
        }
        if self.dataset.window == 0 {
            errors.push("dataset.window must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(SpiceError::InvalidPod(format!(
                "{}: {}",
                self.name,
                errors.join("; ")
            )))
        }
    }

    /// Stable identity of this definition, used to match runs on resume
    pub fn fingerprint(&self) -> String {
        // Field order is fixed by the struct and maps are BTreeMaps.
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&canonical))
    }

    /// Shape of the observation/action space the trainer must agree on
    pub fn shape(&self) -> ModelShape {
        ModelShape {
            window: self.dataset.window,
            fields: self.dataset.fields.len(),
            actions: self.actions.len(),
        }
    }

    pub fn action_names(&self) -> Vec<String> {
        self.actions.iter().map(|a| a.name.clone()).collect()
    }
}

/// Input/output dimensions of a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelShape {
    /// Rows per observation
    pub window: usize,
    /// Columns per row
    pub fields: usize,
    /// Number of discrete actions
    pub actions: usize,
}

impl std::fmt::Display for ModelShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{} -> {}", self.window, self.fields, self.actions)
    }
}
