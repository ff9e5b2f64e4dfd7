//! Decree-qualified checkpoint files on stable storage.
//!
//! ## Disk Layout
//!
//! ```text
//! {data_dir}/
//!   dump.db          # canonical engine image (owned by the engine config)
//!   engine.conf      # engine-readable config, rewritten at each start
//!   checkpoint.42    # snapshot of engine state as of decree 42
//!   checkpoint.57
//! ```
//!
//! There is no separate metadata file: the durable decree marker is inferred
//! from checkpoint file existence. A new checkpoint is installed by renaming
//! the engine's freshly saved image to its decree-qualified name, so a crash
//! mid-checkpoint leaves the prior checkpoint intact and the new one absent.
//! On startup the marker is re-derived by scanning for the highest-numbered
//! checkpoint file present.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::ledger::Decree;

/// One durable snapshot: a decree and the file holding engine state as of
/// that decree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRecord {
    /// Decree the snapshot corresponds to.
    pub decree: Decree,
    /// Location of the snapshot file.
    pub path: PathBuf,
}

/// Naming, installation, and recovery of checkpoint files in one replica
/// data directory.
///
/// The store holds no mutable state; callers serialize its filesystem
/// operations under the replica's exclusivity domain.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    data_dir: PathBuf,
}

impl CheckpointStore {
    /// Creates a store over `data_dir`. The directory is created by the
    /// replica at start, not here.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Returns the checkpoint file path for `decree`.
    #[must_use]
    pub fn checkpoint_path(&self, decree: Decree) -> PathBuf {
        self.data_dir.join(format!("checkpoint.{decree}"))
    }

    /// Returns the record for `decree` without checking file existence.
    #[must_use]
    pub fn record(&self, decree: Decree) -> CheckpointRecord {
        CheckpointRecord {
            decree,
            path: self.checkpoint_path(decree),
        }
    }

    /// Returns whether the checkpoint file for `decree` is present.
    #[must_use]
    pub fn exists(&self, decree: Decree) -> bool {
        self.checkpoint_path(decree).exists()
    }

    /// Atomically installs `source` as the checkpoint file for `decree`.
    ///
    /// The rename either fully succeeds or leaves the previous on-disk state
    /// untouched; the caller advances the durable marker only afterwards.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error; nothing is mutated on failure.
    pub fn install(&self, source: &Path, decree: Decree) -> std::io::Result<CheckpointRecord> {
        let path = self.checkpoint_path(decree);
        std::fs::rename(source, &path)?;
        sync_dir(&self.data_dir)?;
        debug!(decree, path = %path.display(), "checkpoint file installed");
        Ok(CheckpointRecord { decree, path })
    }

    /// Scans the data directory for the highest-numbered checkpoint file.
    ///
    /// This is the startup recovery path: the durable marker must be
    /// re-derived from what actually survived on disk, not trusted from any
    /// in-memory value.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error. A missing data directory is an
    /// empty scan, not an error.
    pub fn latest_on_disk(&self) -> std::io::Result<Option<CheckpointRecord>> {
        if !self.data_dir.exists() {
            return Ok(None);
        }

        let mut latest: Option<Decree> = None;
        for entry in std::fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            if !entry.path().is_file() {
                continue;
            }
            if let Some(decree) = entry
                .file_name()
                .to_str()
                .and_then(parse_checkpoint_decree)
            {
                latest = Some(latest.map_or(decree, |d| d.max(decree)));
            }
        }
        Ok(latest.map(|decree| self.record(decree)))
    }

    /// Deletes all but the newest `keep` checkpoint files, never touching
    /// the file for `durable`. Returns the number removed.
    ///
    /// Retention policy lives outside the core; this is the mechanism only.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error from the directory scan; individual
    /// deletions are best-effort.
    pub fn prune(&self, keep: usize, durable: Decree) -> std::io::Result<usize> {
        let mut decrees: Vec<Decree> = Vec::new();
        if !self.data_dir.exists() {
            return Ok(0);
        }
        for entry in std::fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            if let Some(d) = entry
                .file_name()
                .to_str()
                .and_then(parse_checkpoint_decree)
            {
                decrees.push(d);
            }
        }
        decrees.sort_unstable();

        if decrees.len() <= keep {
            return Ok(0);
        }
        let cutoff = decrees.len() - keep;
        let mut removed = 0;
        for &d in &decrees[..cutoff] {
            if d == durable {
                continue;
            }
            if std::fs::remove_file(self.checkpoint_path(d)).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Parses a decree from a file name like `checkpoint.42`.
fn parse_checkpoint_decree(name: &str) -> Option<Decree> {
    name.strip_prefix("checkpoint.").and_then(|s| s.parse().ok())
}

/// Fsync a directory so a rename is durable before the marker that depends
/// on it advances.
#[allow(clippy::unnecessary_wraps)] // no-op outside Unix
fn sync_dir(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let f = std::fs::File::open(path)?;
        f.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}
