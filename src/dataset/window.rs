//! Dataset Window Provider
//!
//! Presents a connector as a replayable sequence of fixed-size observation
//! windows. The window at cursor `c` covers records `[c, c + rows)`; every
//! `next_window` call advances the cursor by one record. Schema and length are
//! checked when the provider opens, so a bad pod never reaches an episode.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::connector::{Connector, Record};
use crate::error::{Result, SpiceError};
use crate::pod::{DatasetSpec, EpisodeOrder};

/// Records fetched from the connector per read
const DEFAULT_PAGE_SIZE: usize = 256;

/// One observation: `rows × fields` values at a cursor position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Window {
    /// Index of the first record in the window
    pub cursor: usize,
    /// Timestamps of each row (unix seconds)
    pub times: Vec<i64>,
    /// Row-major feature values, restricted to the pod's fields
    pub rows: Vec<Vec<f64>>,
}

impl Window {
    /// Most recent value of a column
    pub fn latest(&self, field: usize) -> Option<f64> {
        self.rows.last().and_then(|row| row.get(field).copied())
    }

    /// Flattened row-major features
    pub fn flatten(&self) -> Vec<f64> {
        self.rows.iter().flatten().copied().collect()
    }

    /// Index of the last record in the window
    pub fn end(&self) -> usize {
        self.cursor + self.rows.len().saturating_sub(1)
    }
}

/// Replayable, seekable sequence of windows over one connector
pub struct WindowProvider {
    connector: Arc<dyn Connector>,
    /// Positions of the pod's fields in the connector schema
    columns: Vec<usize>,
    rows: usize,
    records: usize,
    cursor: usize,
    seed: u64,
    order: EpisodeOrder,
    page_size: usize,
    page_start: usize,
    page: Vec<Record>,
}

impl std::fmt::Debug for WindowProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowProvider")
            .field("connector", &self.connector.name())
            .field("rows", &self.rows)
            .field("records", &self.records)
            .field("cursor", &self.cursor)
            .finish()
    }
}

impl WindowProvider {
    /// Open a provider, validating the dataset against the pod's layout
    pub async fn open(connector: Arc<dyn Connector>, spec: &DatasetSpec) -> Result<Self> {
        let schema = connector.schema();
        let mut columns = Vec::with_capacity(spec.fields.len());
        let mut missing = Vec::new();
        for field in &spec.fields {
            match schema.iter().position(|c| c == field) {
                Some(idx) => columns.push(idx),
                None => missing.push(field.clone()),
            }
        }
        if !missing.is_empty() {
            return Err(SpiceError::SchemaMismatch(format!(
                "{}: fields {:?} not in dataset columns {:?}",
                connector.name(),
                missing,
                schema
            )));
        }

        let records = connector.len().await?;
        if records < spec.window {
            return Err(SpiceError::NotEnoughData {
                available: records,
                required: spec.window,
            });
        }

        debug!(
            "Window provider over {}: {} records, {} rows x {} fields",
            connector.name(),
            records,
            spec.window,
            columns.len()
        );

        Ok(Self {
            connector,
            columns,
            rows: spec.window,
            records,
            cursor: 0,
            seed: spec.seed,
            order: spec.order,
            page_size: DEFAULT_PAGE_SIZE,
            page_start: 0,
            page: Vec::new(),
        })
    }

    /// Override the connector read size
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Number of distinct windows in the dataset
    pub fn window_count(&self) -> usize {
        self.records + 1 - self.rows
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Move the cursor; positions past the end yield end-of-data
    pub fn seek(&mut self, position: usize) {
        self.cursor = position.min(self.window_count());
    }

    /// Rewind to the first window
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Window at the cursor, advancing it; `None` at end of data
    pub async fn next_window(&mut self) -> Result<Option<Window>> {
        let window = self.peek_window().await?;
        if window.is_some() {
            self.cursor += 1;
        }
        Ok(window)
    }

    /// Window at the cursor without advancing
    pub async fn peek_window(&mut self) -> Result<Option<Window>> {
        if self.cursor >= self.window_count() {
            return Ok(None);
        }
        self.window_at(self.cursor).await.map(Some)
    }

    async fn window_at(&mut self, position: usize) -> Result<Window> {
        let end = position + self.rows;
        if position < self.page_start || end > self.page_start + self.page.len() {
            self.load_page(position).await?;
        }

        let offset = position - self.page_start;
        let slice = &self.page[offset..offset + self.rows];

        let mut times = Vec::with_capacity(self.rows);
        let mut rows = Vec::with_capacity(self.rows);
        for (i, record) in slice.iter().enumerate() {
            let row = self
                .columns
                .iter()
                .map(|&c| record.values[c])
                .collect::<Vec<f64>>();
            if let Some(bad) = row.iter().position(|v| !v.is_finite()) {
                return Err(SpiceError::CorruptData(format!(
                    "{}: record {} has non-finite value in column {}",
                    self.connector.name(),
                    position + i,
                    bad
                )));
            }
            times.push(record.time);
            rows.push(row);
        }

        Ok(Window {
            cursor: position,
            times,
            rows,
        })
    }

    async fn load_page(&mut self, position: usize) -> Result<()> {
        // Include the previous record so ordering is checked across pages.
        let start = position.saturating_sub(1);
        let limit = self.page_size.max(self.rows + 1);
        let page = self.connector.read(start, limit).await?;

        if page.len() < position - start + self.rows {
            return Err(SpiceError::CorruptData(format!(
                "{}: short read at record {} ({} of {} records)",
                self.connector.name(),
                start,
                page.len(),
                limit
            )));
        }

        let width = self.connector.schema().len();
        for (i, record) in page.iter().enumerate() {
            if record.values.len() != width {
                return Err(SpiceError::CorruptData(format!(
                    "{}: record {} has {} values, schema has {}",
                    self.connector.name(),
                    start + i,
                    record.values.len(),
                    width
                )));
            }
        }
        for (i, pair) in page.windows(2).enumerate() {
            if pair[1].time <= pair[0].time {
                return Err(SpiceError::CorruptData(format!(
                    "{}: record {} is not after record {} ({} <= {})",
                    self.connector.name(),
                    start + i + 1,
                    start + i,
                    pair[1].time,
                    pair[0].time
                )));
            }
        }

        self.page_start = start;
        self.page = page;
        Ok(())
    }

    /// Start cursors of each episode in an epoch
    ///
    /// Windows are split into consecutive chunks of `episode_length`. The same
    /// seed and epoch always produce the same plan, so a resumed run can find
    /// where any episode begins.
    pub fn episode_plan(
        &self,
        epoch: u32,
        episode_length: u32,
        episodes_per_epoch: Option<u32>,
    ) -> Vec<usize> {
        let length = episode_length.max(1) as usize;
        let mut chunks: Vec<usize> = (0..self.window_count()).step_by(length).collect();

        if self.order == EpisodeOrder::Shuffled {
            let mut rng = StdRng::seed_from_u64(epoch_seed(self.seed, epoch));
            chunks.shuffle(&mut rng);
        }

        match episodes_per_epoch {
            Some(n) => (0..n as usize).map(|i| chunks[i % chunks.len()]).collect(),
            None => chunks,
        }
    }
}

fn epoch_seed(seed: u64, epoch: u32) -> u64 {
    seed ^ (u64::from(epoch).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}
