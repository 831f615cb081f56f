pub mod api;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod daemon;
pub mod dataset;
pub mod error;
pub mod persistence;
pub mod pod;
pub mod services;
pub mod session;
pub mod training;

pub use config::DaemonConfig;
pub use coordination::{GracefulShutdown, ShutdownSignal, ShutdownToken};
pub use daemon::{Daemon, DataAppend, DataRow, Inference, RunView};
pub use dataset::{Connector, DatasetCatalog, MemoryConnector, Record, WindowProvider};
pub use error::{FaultClass, Result, SpiceError};
pub use persistence::{
    CheckpointRef, CheckpointStore, Coordinates, FileRunRegistry, MemoryRunRegistry, Run,
    RunRegistry, RunStatus,
};
pub use pod::Pod;
pub use services::{ComponentHealth, HealthResponse, HealthStatus};
pub use session::{AlgorithmRegistry, SessionFactory, TrainerSession};
pub use training::{Orchestrator, StartOptions, TrainingContext};
