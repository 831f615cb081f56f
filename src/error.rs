use thiserror::Error;

/// Main error type for the training daemon
#[derive(Error, Debug)]
pub enum SpiceError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Pod parse error: {0}")]
    PodParse(#[from] toml::de::Error),

    #[error("Invalid pod: {0}")]
    InvalidPod(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Not enough data for training: {available} records, window needs {required}")]
    NotEnoughData { available: usize, required: usize },

    #[error("Algorithm unavailable: {0}")]
    AlgorithmUnavailable(String),

    #[error("Checkpoint incompatible: {0}")]
    CheckpointIncompatible(String),

    // Transient faults
    #[error("Trainer call timed out: {operation} after {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Connector I/O error: {0}")]
    ConnectorIo(String),

    // Data corruption
    #[error("Corrupt data: {0}")]
    CorruptData(String),

    #[error("Reward function failed: {0}")]
    RewardFunction(String),

    #[error("Invalid checkpoint: {0}")]
    InvalidCheckpoint(String),

    // Trainer session errors
    #[error("Trainer session lost: {0}")]
    SessionLost(String),

    #[error("Trainer protocol error: {0}")]
    Protocol(String),

    // Registry errors
    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    // Control surface errors
    #[error("Pod already training: {0}")]
    AlreadyTraining(String),

    #[error("Pod not found: {0}")]
    PodNotFound(String),

    #[error("Pod has no trained model: {0}")]
    NotTrained(String),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),


    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for SpiceError
pub type Result<T> = std::result::Result<T, SpiceError>;

/// How the orchestrator treats a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultClass {
    /// Bad pod, schema or checkpoint; the run never starts
    Configuration,
    /// Timeouts and flaky I/O; retried with backoff
    Transient,
    /// Malformed windows or reward failures; the run is paused
    DataCorruption,
    /// Run record could not be written
    Registry,
    /// Anything else; the run fails
    Fatal,
}

impl std::fmt::Display for FaultClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultClass::Configuration => write!(f, "configuration"),
            FaultClass::Transient => write!(f, "transient"),
            FaultClass::DataCorruption => write!(f, "data_corruption"),
            FaultClass::Registry => write!(f, "registry"),
            FaultClass::Fatal => write!(f, "fatal"),
        }
    }
}

impl SpiceError {
    /// Classify this error for retry and run-status decisions
    pub fn fault_class(&self) -> FaultClass {
        match self {
            SpiceError::Config(_)
            | SpiceError::PodParse(_)
            | SpiceError::InvalidPod(_)
            | SpiceError::SchemaMismatch(_)
            | SpiceError::InvalidData(_)
            | SpiceError::NotEnoughData { .. }
            | SpiceError::AlgorithmUnavailable(_)
            | SpiceError::CheckpointIncompatible(_) => FaultClass::Configuration,
            SpiceError::Timeout { .. } | SpiceError::ConnectorIo(_) => FaultClass::Transient,
            SpiceError::CorruptData(_)
            | SpiceError::RewardFunction(_)
            | SpiceError::InvalidCheckpoint(_) => FaultClass::DataCorruption,
            SpiceError::Registry(_) => FaultClass::Registry,
            _ => FaultClass::Fatal,
        }
    }

    /// Whether a retry could succeed
    pub fn is_transient(&self) -> bool {
        self.fault_class() == FaultClass::Transient
    }

    /// Short machine-readable code, used in API responses
    pub fn code(&self) -> &'static str {
        match self {
            SpiceError::Config(_) => "config_error",
            SpiceError::PodParse(_) => "pod_parse_error",
            SpiceError::InvalidPod(_) => "invalid_pod",
            SpiceError::SchemaMismatch(_) => "schema_mismatch",
            SpiceError::InvalidData(_) => "invalid_data",
            SpiceError::NotEnoughData { .. } => "not_enough_data_for_training",
            SpiceError::AlgorithmUnavailable(_) => "algorithm_unavailable",
            SpiceError::CheckpointIncompatible(_) => "checkpoint_incompatible",
            SpiceError::Timeout { .. } => "timeout",
            SpiceError::ConnectorIo(_) => "connector_io",
            SpiceError::CorruptData(_) => "corrupt_data",
            SpiceError::RewardFunction(_) => "reward_function_error",
            SpiceError::InvalidCheckpoint(_) => "invalid_checkpoint",
            SpiceError::SessionLost(_) => "session_lost",
            SpiceError::Protocol(_) => "protocol_error",
            SpiceError::Registry(_) => "registry_error",
            SpiceError::RunNotFound(_) => "run_not_found",
            SpiceError::AlreadyTraining(_) => "already_training",
            SpiceError::PodNotFound(_) => "pod_not_found",
            SpiceError::NotTrained(_) => "pod_not_trained",
            SpiceError::InvalidStateTransition { .. } => "invalid_state_transition",
            SpiceError::Json(_) => "json_error",
            SpiceError::Io(_) => "io_error",
            SpiceError::Internal(_) => "internal_error",
            SpiceError::Other(_) => "error",
        }
    }
}
