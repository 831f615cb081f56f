//! Checkpoint Store
//!
//! Checkpoints are directories of opaque, algorithm-specific files written by
//! the trainer, plus a `meta.json` the daemon writes last. A checkpoint is
//! addressed by the SHA-256 digest of its payload, so a directory whose files
//! do not match its metadata is detected on load.
//!
//! Layout: `<root>/<run_id>/e<epoch>-ep<episode>-<digest prefix>/`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::run_registry::Coordinates;
use crate::error::{Result, SpiceError};
use crate::pod::ModelShape;

/// Metadata file name inside each checkpoint directory
pub const META_FILE: &str = "meta.json";

/// Reference to a committed checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRef {
    /// Hex SHA-256 digest of the payload
    pub id: String,
    pub path: PathBuf,
    pub algorithm: String,
    /// Run position the weights correspond to
    pub coordinates: Coordinates,
    pub shape: ModelShape,
    pub created_at: DateTime<Utc>,
}

/// Contents of `meta.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub digest: String,
    pub algorithm: String,
    pub run_id: String,
    pub coordinates: Coordinates,
    pub shape: ModelShape,
    pub created_at: DateTime<Utc>,
}

impl CheckpointMeta {
    fn into_ref(self, path: PathBuf) -> CheckpointRef {
        CheckpointRef {
            id: self.digest,
            path,
            algorithm: self.algorithm,
            coordinates: self.coordinates,
            shape: self.shape,
            created_at: self.created_at,
        }
    }
}

/// Directory-backed checkpoint storage
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
    /// Committed checkpoints kept per run
    max_per_run: usize,
}

impl CheckpointStore {
    pub fn new<P: AsRef<Path>>(root: P, max_per_run: usize) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            max_per_run: max_per_run.max(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    /// Fresh empty directory for the trainer to write into
    pub fn staging_dir(&self, run_id: &str, coordinates: Coordinates) -> Result<PathBuf> {
        let dir = self.run_dir(run_id).join(format!(
            ".staging-e{:04}-ep{:06}-{}",
            coordinates.epoch,
            coordinates.episode,
            uuid::Uuid::new_v4().simple()
        ));
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Seal a staged checkpoint: digest it, write metadata, move it into place
    ///
    /// Existing checkpoints are never overwritten.
    pub fn commit(
        &self,
        staging: &Path,
        run_id: &str,
        algorithm: &str,
        coordinates: Coordinates,
        shape: ModelShape,
    ) -> Result<CheckpointRef> {
        let digest = payload_digest(staging)?;
        let meta = CheckpointMeta {
            digest: digest.clone(),
            algorithm: algorithm.to_string(),
            run_id: run_id.to_string(),
            coordinates,
            shape,
            created_at: Utc::now(),
        };
        write_meta(staging, &meta)?;

        let mut target = self.run_dir(run_id).join(format!(
            "e{:04}-ep{:06}-{}",
            coordinates.epoch,
            coordinates.episode,
            &digest[..12]
        ));
        if target.exists() {
            // Same coordinates and payload already committed, e.g. after a replayed epoch.
            target = target.with_extension(uuid::Uuid::new_v4().simple().to_string());
        }
        fs::rename(staging, &target)?;

        let short = &digest[..12];
        info!(
            run_id = %run_id,
            checkpoint = %short,
            "Committed checkpoint at {} to {:?}",
            coordinates,
            target
        );

        Ok(meta.into_ref(target))
    }

    /// Throw away a staged checkpoint that was not committed
    pub fn discard(&self, staging: &Path) {
        if let Err(e) = fs::remove_dir_all(staging) {
            warn!("Failed to remove staging dir {:?}: {}", staging, e);
        }
    }

    /// Read and verify a checkpoint directory
    pub fn load(&self, path: &Path) -> Result<CheckpointRef> {
        let meta = read_meta(path)?;
        let digest = payload_digest(path)?;
        if digest != meta.digest {
            return Err(SpiceError::InvalidCheckpoint(format!(
                "{}: payload digest {} does not match metadata {}",
                path.display(),
                &digest[..12],
                &meta.digest[..meta.digest.len().min(12)]
            )));
        }
        Ok(meta.into_ref(path.to_path_buf()))
    }

    /// Copy a checkpoint out of the store
    pub fn export(&self, checkpoint: &CheckpointRef, dest: &Path) -> Result<PathBuf> {
        self.load(&checkpoint.path)?;
        copy_dir(&checkpoint.path, dest)?;
        info!("Exported checkpoint {} to {:?}", &checkpoint.id[..12.min(checkpoint.id.len())], dest);
        Ok(dest.to_path_buf())
    }

    /// Bring an exported checkpoint into the store as the seed of a run
    ///
    /// The imported checkpoint is re-addressed to coordinates zero of the new
    /// run, since its original run position means nothing there.
    pub fn import(&self, source: &Path, run_id: &str) -> Result<CheckpointRef> {
        if !source.join(META_FILE).exists() {
            return Err(SpiceError::InvalidCheckpoint(format!(
                "unable to load model metadata at {}",
                source.display()
            )));
        }
        let original = self.load(source)?;

        let staging = self.staging_dir(run_id, Coordinates::default())?;
        let copied = copy_dir(source, &staging).and_then(|_| {
            let _ = fs::remove_file(staging.join(META_FILE));
            self.commit(
                &staging,
                run_id,
                &original.algorithm,
                Coordinates::default(),
                original.shape,
            )
        });
        if copied.is_err() {
            self.discard(&staging);
        }
        copied
    }

    /// Committed checkpoints of a run, oldest first
    pub fn list(&self, run_id: &str) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = match fs::read_dir(self.run_dir(run_id)) {
            Ok(entries) => entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .filter(|p| {
                    p.file_name()
                        .map(|n| !n.to_string_lossy().starts_with('.'))
                        .unwrap_or(false)
                })
                .collect(),
            Err(_) => Vec::new(),
        };
        dirs.sort();
        dirs
    }

    /// Remove old checkpoints beyond the retention limit, never `keep`
    pub fn prune(&self, run_id: &str, keep: &Path) {
        let checkpoints = self.list(run_id);
        if checkpoints.len() <= self.max_per_run {
            return;
        }

        let excess = checkpoints.len() - self.max_per_run;
        for path in checkpoints.into_iter().filter(|p| p != keep).take(excess) {
            if let Err(e) = fs::remove_dir_all(&path) {
                warn!("Failed to remove old checkpoint {:?}: {}", path, e);
            } else {
                info!("Removed old checkpoint: {:?}", path);
            }
        }
    }
}

/// Run checkpoint file work on the blocking pool
pub async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| SpiceError::Internal(format!("checkpoint task failed: {}", e)))?
}

fn read_meta(dir: &Path) -> Result<CheckpointMeta> {
    let path = dir.join(META_FILE);
    let bytes = fs::read(&path)
        .map_err(|e| SpiceError::InvalidCheckpoint(format!("{}: {}", path.display(), e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| SpiceError::InvalidCheckpoint(format!("{}: {}", path.display(), e)))
}

fn write_meta(dir: &Path, meta: &CheckpointMeta) -> Result<()> {
    let tmp = dir.join(format!(".{}.tmp", META_FILE));
    fs::write(&tmp, serde_json::to_vec_pretty(meta)?)?;
    fs::rename(&tmp, dir.join(META_FILE))?;
    Ok(())
}

/// Digest over every payload file, by relative path then contents
fn payload_digest(dir: &Path) -> Result<String> {
    let mut files = Vec::new();
    collect_files(dir, dir, &mut files)?;
    files.sort();

    let mut hasher = Sha256::new();
    for relative in files {
        if relative == Path::new(META_FILE) {
            continue;
        }
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(fs::read(dir.join(&relative))?);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else if let Ok(relative) = path.strip_prefix(root) {
            let hidden = relative
                .file_name()
                .map(|n| n.to_string_lossy().starts_with('.'))
                .unwrap_or(false);
            if !hidden {
                out.push(relative.to_path_buf());
            }
        }
    }
    Ok(())
}

fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let path = entry.path();
        let target = to.join(entry.file_name());
        if path.is_dir() {
            copy_dir(&path, &target)?;
        } else {
            fs::copy(&path, &target)?;
        }
    }
    Ok(())
}
