//! Persistence Layer for Run State and Checkpoints
//!
//! - Run registry: durable, atomically written progress records
//! - Checkpoint store: content-addressed model snapshots with metadata

pub mod checkpoint;
pub mod run_registry;

pub use checkpoint::{blocking, CheckpointMeta, CheckpointRef, CheckpointStore, META_FILE};
pub use run_registry::{
    Coordinates, EpisodeRecord, FileRunRegistry, MemoryRunRegistry, Run, RunFailure,
    RunRegistry, RunStatus, Termination,
};
