//! Dataset access for training
//!
//! - Connectors yield time-ordered records from some source
//! - The window provider turns a connector into seekable observation windows
//! - The catalog resolves a pod's dataset reference to a connector

pub mod connector;
pub mod window;

pub use connector::{Bar, Connector, JsonlConnector, MemoryConnector, Record, OHLCV_SCHEMA};
pub use window::{Window, WindowProvider};

use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::error::{Result, SpiceError};

/// Resolves dataset references to connectors
///
/// Registered connectors take precedence; anything else is looked up as a
/// JSON-lines file under the data directory. Each call returns a fresh handle
/// so runs never share cursors.
pub struct DatasetCatalog {
    data_dir: PathBuf,
    registered: DashMap<String, Arc<dyn Connector>>,
}

impl DatasetCatalog {
    pub fn new<P: Into<PathBuf>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.into(),
            registered: DashMap::new(),
        }
    }

    /// Register an in-process connector under a source name
    pub fn register(&self, source: &str, connector: Arc<dyn Connector>) {
        debug!("Registered dataset connector: {}", source);
        self.registered.insert(source.to_string(), connector);
    }

    /// Resolve a source to a connector; unreachable sources are pod errors
    pub async fn resolve(&self, source: &str) -> Result<Arc<dyn Connector>> {
        if let Some(connector) = self.registered.get(source) {
            return Ok(connector.value().clone());
        }
        let path = self.file_path(source)?;
        let connector = JsonlConnector::open(&path).await?;
        Ok(Arc::new(connector))
    }

    /// Where a file-backed source lives under the data directory
    pub fn file_path(&self, source: &str) -> Result<PathBuf> {
        if self.registered.contains_key(source) {
            return Err(SpiceError::InvalidData(format!(
                "dataset '{}' is not file-backed",
                source
            )));
        }
        let path = self.data_dir.join(source);
        if !path.starts_with(&self.data_dir) || source.contains("..") {
            return Err(SpiceError::InvalidPod(format!(
                "dataset source '{}' escapes the data directory",
                source
            )));
        }
        Ok(path)
    }
}
