use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::daemon::DataRow;
use crate::persistence::{Coordinates, RunStatus};

// ============================================================================
// Request Types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct TrainRequest {
    /// Resume a run that was paused on corrupt data
    #[serde(default)]
    pub resume_paused: bool,
}

#[derive(Debug, Deserialize)]
pub struct ExportRequest {
    pub dest: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct ImportRequest {
    pub source: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct AddDataRequest {
    pub rows: Vec<DataRow>,
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainResponse {
    pub run_id: String,
    pub pod: String,
    pub status: RunStatus,
    /// Where the run starts; non-zero when resuming
    pub progress: Coordinates,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopResponse {
    pub run_id: String,
    pub stopping: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportResponse {
    pub path: PathBuf,
}

/// Error body; `result` carries the machine-readable code
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: bool,
    pub result: String,
    pub message: String,
}
