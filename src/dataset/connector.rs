//! Connector capability
//!
//! Connectors are the boundary to raw market data. The training core only
//! needs a time-ordered, seekable source of fixed-schema records; fetching
//! from exchanges lives outside this crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Result, SpiceError};

/// Column names for OHLCV bars
pub const OHLCV_SCHEMA: [&str; 5] = ["open", "high", "low", "close", "volume"];

/// One row of a dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Unix seconds
    pub time: i64,
    /// Values in schema order
    pub values: Vec<f64>,
}

/// A single OHLCV bar
#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn to_record(&self) -> Record {
        Record {
            time: self.open_time.timestamp(),
            values: vec![self.open, self.high, self.low, self.close, self.volume],
        }
    }
}

/// Time-ordered, seekable source of records
#[async_trait]
pub trait Connector: Send + Sync {
    /// Human-readable source name
    fn name(&self) -> &str;

    /// Column names, in the order of `Record::values`
    fn schema(&self) -> &[String];

    /// Total number of records
    async fn len(&self) -> Result<usize>;

    /// Read up to `limit` records starting at `offset`
    async fn read(&self, offset: usize, limit: usize) -> Result<Vec<Record>>;
}

/// Connector over records held in memory
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    name: String,
    schema: Vec<String>,
    records: Vec<Record>,
}

impl MemoryConnector {
    pub fn new(name: &str, schema: Vec<String>, records: Vec<Record>) -> Self {
        Self {
            name: name.to_string(),
            schema,
            records,
        }
    }

    /// Build from OHLCV bars
    pub fn from_bars(name: &str, bars: &[Bar]) -> Self {
        Self::new(
            name,
            OHLCV_SCHEMA.iter().map(|c| c.to_string()).collect(),
            bars.iter().map(Bar::to_record).collect(),
        )
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> &[String] {
        &self.schema
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.records.len())
    }

    async fn read(&self, offset: usize, limit: usize) -> Result<Vec<Record>> {
        let start = offset.min(self.records.len());
        let end = offset.saturating_add(limit).min(self.records.len());
        Ok(self.records[start..end].to_vec())
    }
}

/// Connector over a JSON-lines file
///
/// Each non-empty line is an object with a `time` key (unix seconds) and one
/// numeric key per column. The schema is taken from the first line; lines are
/// parsed lazily so a malformed line only fails the window that touches it.
#[derive(Debug)]
pub struct JsonlConnector {
    name: String,
    path: PathBuf,
    schema: Vec<String>,
    lines: Vec<String>,
}

impl JsonlConnector {
    /// Open a dataset file and read its schema
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let text = tokio::fs::read_to_string(&path).await.map_err(|e| {
            SpiceError::InvalidPod(format!("dataset {} unreachable: {}", path.display(), e))
        })?;

        let lines: Vec<String> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        let schema = match lines.first() {
            Some(first) => {
                let object: serde_json::Map<String, serde_json::Value> =
                    serde_json::from_str(first).map_err(|e| {
                        SpiceError::SchemaMismatch(format!(
                            "{}: first line is not an object: {}",
                            path.display(),
                            e
                        ))
                    })?;
                if !object.contains_key("time") {
                    return Err(SpiceError::SchemaMismatch(format!(
                        "{}: missing 'time' column",
                        path.display()
                    )));
                }
                object.keys().filter(|k| *k != "time").cloned().collect()
            }
            None => Vec::new(),
        };

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dataset".to_string());

        debug!(
            "Opened dataset {} ({} records, columns: {:?})",
            path.display(),
            lines.len(),
            schema
        );

        Ok(Self {
            name,
            path,
            schema,
            lines,
        })
    }

    fn parse_line(&self, index: usize, line: &str) -> Result<Record> {
        let corrupt = |reason: String| {
            SpiceError::CorruptData(format!("{} line {}: {}", self.path.display(), index + 1, reason))
        };

        let object: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(line).map_err(|e| corrupt(e.to_string()))?;

        let time = object
            .get("time")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| corrupt("missing or non-integer time".to_string()))?;

        let values = self
            .schema
            .iter()
            .map(|column| {
                object
                    .get(column)
                    .and_then(|v| v.as_f64())
                    .ok_or_else(|| corrupt(format!("missing or non-numeric '{}'", column)))
            })
            .collect::<Result<Vec<f64>>>()?;

        Ok(Record { time, values })
    }
}

#[async_trait]
impl Connector for JsonlConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> &[String] {
        &self.schema
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.lines.len())
    }

    async fn read(&self, offset: usize, limit: usize) -> Result<Vec<Record>> {
        self.lines
            .iter()
            .enumerate()
            .skip(offset)
            .take(limit)
            .map(|(i, line)| self.parse_line(i, line))
            .collect()
    }
}
