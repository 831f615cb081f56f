pub mod runs;
pub mod system;

pub use runs::*;
pub use system::*;

use axum::{http::StatusCode, response::IntoResponse, Json};

use crate::api::types::ErrorResponse;
use crate::error::{FaultClass, SpiceError};

/// Daemon error rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub SpiceError);

impl From<SpiceError> for ApiError {
    fn from(error: SpiceError) -> Self {
        Self(error)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            SpiceError::PodNotFound(_) | SpiceError::RunNotFound(_) | SpiceError::NotTrained(_) => {
                StatusCode::NOT_FOUND
            }
            SpiceError::AlreadyTraining(_) | SpiceError::InvalidStateTransition { .. } => {
                StatusCode::CONFLICT
            }
            e if e.fault_class() == FaultClass::Configuration => StatusCode::BAD_REQUEST,
            SpiceError::InvalidCheckpoint(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let body = ErrorResponse {
            error: true,
            result: self.0.code().to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
