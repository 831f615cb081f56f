//! Algorithm registry
//!
//! Algorithms are data: an identifier mapped to the factory that opens
//! sessions for it. New backends register here instead of extending a type
//! hierarchy.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::{ProcessSessionFactory, RandomSessionFactory, SessionFactory, SessionSpec, TrainerSession};
use crate::config::TrainerConfig;
use crate::error::{Result, SpiceError};
use crate::persistence::CheckpointRef;

/// Identifier of the in-process baseline policy
pub const RANDOM_ALGORITHM: &str = "random";

#[derive(Default, Clone)]
pub struct AlgorithmRegistry {
    factories: HashMap<String, Arc<dyn SessionFactory>>,
}

impl AlgorithmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// External trainer algorithms from config, plus the random baseline
    pub fn from_config(config: &TrainerConfig) -> Self {
        let mut registry = Self::new();
        let process: Arc<dyn SessionFactory> = Arc::new(ProcessSessionFactory::new(config.clone()));
        for algorithm in &config.algorithms {
            registry.register(algorithm, process.clone());
        }
        registry.register(RANDOM_ALGORITHM, Arc::new(RandomSessionFactory));
        registry
    }

    pub fn register(&mut self, algorithm: &str, factory: Arc<dyn SessionFactory>) {
        self.factories.insert(algorithm.to_string(), factory);
    }

    pub fn is_known(&self, algorithm: &str) -> bool {
        self.factories.contains_key(algorithm)
    }

    pub fn algorithms(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Open a session, rejecting checkpoints that do not fit the session
    pub async fn open(
        &self,
        spec: &SessionSpec,
        checkpoint: Option<&CheckpointRef>,
    ) -> Result<Box<dyn TrainerSession>> {
        let factory = self
            .factories
            .get(&spec.algorithm)
            .ok_or_else(|| SpiceError::AlgorithmUnavailable(spec.algorithm.clone()))?;

        if let Some(checkpoint) = checkpoint {
            check_compatible(spec, checkpoint)?;
        }

        let session = factory.open(spec, checkpoint).await?;
        info!(
            run_id = %spec.run_id,
            algorithm = %spec.algorithm,
            resumed = checkpoint.is_some(),
            "Opened trainer session"
        );
        Ok(session)
    }
}

/// A checkpoint fits a session when algorithm and shape both match
pub fn check_compatible(spec: &SessionSpec, checkpoint: &CheckpointRef) -> Result<()> {
    if checkpoint.algorithm != spec.algorithm {
        return Err(SpiceError::CheckpointIncompatible(format!(
            "checkpoint {} was written by '{}', session runs '{}'",
            checkpoint.id, checkpoint.algorithm, spec.algorithm
        )));
    }
    if checkpoint.shape != spec.shape {
        return Err(SpiceError::CheckpointIncompatible(format!(
            "checkpoint {} has shape {}, session expects {}",
            checkpoint.id, checkpoint.shape, spec.shape
        )));
    }
    Ok(())
}
