//! The serialized checkpoint/learn/dispatch core.
//!
//! One [`Replica`] fronts one backing engine. A single mutex over the
//! engine handle and the decree ledger is the exclusivity domain: command
//! dispatch, checkpoint, learn apply (both modes), lifecycle, and committed
//! marker updates all contend for it, so at most one such operation runs at
//! a time. The backing engine does not tolerate concurrent sessions, and
//! checkpoint and learn both require a stable view of engine state.
//!
//! ## Checkpoint Protocol
//!
//! 1. `durable == committed` → verify the existing file and return its
//!    record (idempotent).
//! 2. Ask the engine to persist its state to the canonical image file.
//! 3. Atomically rename the image to its decree-qualified checkpoint name.
//!    A crash between 2 and 3 loses the new checkpoint, never the old one.
//! 4. Advance the durable marker.
//!
//! ## Learn Protocol
//!
//! Full learn: stop the engine, install the snapshot as the new checkpoint
//! and image, restart from it, reassign both markers to the baseline.
//! Copy: install the snapshot under its decree name and advance the durable
//! marker; the running engine is never touched.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;
use quay_engine::{Engine, EngineError};
use tracing::{debug, error, info, warn};

use crate::command::{BatchRequest, Command};
use crate::ledger::{Decree, DecreeLedger, LedgerError};
use crate::learn::{LearnError, LearnMode};
use crate::metrics::{CounterSnapshot, ReplicaCounters};
use crate::store::{CheckpointRecord, CheckpointStore};

/// Configuration for one replica.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Directory holding the engine image and checkpoint files. Must match
    /// the engine's configured data directory.
    pub data_dir: PathBuf,
    /// File name of the canonical engine image, relative to `data_dir`.
    /// Must match the engine's configured image file name.
    pub image_filename: String,
    /// Command that makes the engine persist its state to the image file.
    pub persist_command: Vec<u8>,
}

impl ReplicaConfig {
    /// Creates a configuration with the default image file name (`dump.db`)
    /// and persist command (`SAVE`).
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            image_filename: "dump.db".to_string(),
            persist_command: b"SAVE".to_vec(),
        }
    }

    /// Returns the path of the canonical engine image file.
    #[must_use]
    pub fn image_path(&self) -> PathBuf {
        self.data_dir.join(&self.image_filename)
    }
}

/// Serving status of the replica.
///
/// `Checkpointing` and `Learning` bracket their operations and are mutually
/// exclusive with each other and with command dispatch; copy-mode learn
/// does not change serving status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServingStatus {
    /// Not serving; no engine session.
    Stopped,
    /// Serving commands.
    Running,
    /// A checkpoint is being materialized.
    Checkpointing,
    /// A learn transfer is being installed; the engine is unavailable.
    Learning,
}

impl ServingStatus {
    fn as_u8(self) -> u8 {
        match self {
            Self::Stopped => 0,
            Self::Running => 1,
            Self::Checkpointing => 2,
            Self::Learning => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Running,
            2 => Self::Checkpointing,
            3 => Self::Learning,
            _ => Self::Stopped,
        }
    }
}

impl std::fmt::Display for ServingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "Stopped"),
            Self::Running => write!(f, "Running"),
            Self::Checkpointing => write!(f, "Checkpointing"),
            Self::Learning => write!(f, "Learning"),
        }
    }
}

/// Errors from materializing a checkpoint.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// The ledger claims a durable checkpoint whose file is gone. Fatal:
    /// the durable baseline can no longer be verified.
    #[error("checkpoint file for decree {decree} is missing: {}", path.display())]
    MissingFile {
        /// Decree the ledger reports as durable.
        decree: Decree,
        /// Expected file location.
        path: PathBuf,
    },

    /// The engine failed while persisting its state. Nothing was mutated;
    /// the caller may retry.
    #[error("engine failed to persist its state: {0}")]
    EngineFailure(#[source] EngineError),

    /// The saved image could not be renamed to its checkpoint name.
    /// Nothing was mutated; the caller may retry.
    #[error("could not install checkpoint file: {0}")]
    PersistFailure(#[source] std::io::Error),

    /// The ledger rejected the durable advance. Fatal: under the
    /// serialization discipline this indicates on-disk state and markers
    /// have diverged.
    #[error("ledger rejected durable advance: {0}")]
    LedgerRejected(#[source] LedgerError),
}

impl CheckpointError {
    /// Whether this failure is unrecoverable for the hosting process.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::MissingFile { .. } | Self::LedgerRejected(_))
    }
}

/// Errors from command dispatch.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The engine connection failed. For a batch, `completed` holds the
    /// ordered results of the commands that were applied before the
    /// failure; their side effects are not rolled back.
    #[error("engine unavailable: {source}")]
    EngineUnavailable {
        /// Replies from commands applied before the failure.
        completed: Vec<Vec<u8>>,
        /// The underlying engine failure.
        source: EngineError,
    },
}

struct ReplicaInner {
    engine: Box<dyn Engine>,
    ledger: DecreeLedger,
}

/// One replica: a backing engine, its decree ledger, and the operations
/// serialized over them.
///
/// All public operations block the caller; none are internally
/// asynchronous. Checkpoint and learn run to completion once started.
pub struct Replica {
    config: ReplicaConfig,
    store: CheckpointStore,
    inner: Mutex<ReplicaInner>,
    // Mirror of the serving status, updated under the lock, so observers
    // can see Checkpointing/Learning without contending for the domain.
    status: AtomicU8,
    counters: ReplicaCounters,
}

impl Replica {
    /// Creates a stopped replica over `engine`.
    #[must_use]
    pub fn new(config: ReplicaConfig, engine: Box<dyn Engine>) -> Self {
        let store = CheckpointStore::new(config.data_dir.clone());
        Self {
            config,
            store,
            inner: Mutex::new(ReplicaInner {
                engine,
                ledger: DecreeLedger::new(),
            }),
            status: AtomicU8::new(ServingStatus::Stopped.as_u8()),
            counters: ReplicaCounters::new(),
        }
    }

    /// Starts the replica, recovering the durable marker from disk.
    ///
    /// The highest-numbered checkpoint file present seeds both decree
    /// markers, and the engine starts from a copy of that checkpoint. With
    /// no checkpoint on disk the engine starts fresh and the markers are
    /// zero. The durable marker is never trusted from memory across a
    /// restart.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Io`] if the recovery scan or image copy
    /// fails, or [`crate::Error::Engine`] if the engine does not start.
    pub fn start(&self) -> crate::Result<()> {
        let mut inner = self.inner.lock();
        std::fs::create_dir_all(&self.config.data_dir)?;

        match self.store.latest_on_disk()? {
            Some(record) => {
                let image = self.config.image_path();
                std::fs::copy(&record.path, &image)?;
                inner.engine.start(Some(&image))?;
                inner.ledger = DecreeLedger::recover(record.decree);
                info!(decree = record.decree, "replica recovered from checkpoint");
            }
            None => {
                inner.engine.start(None)?;
                inner.ledger = DecreeLedger::new();
                info!("replica started fresh");
            }
        }
        self.set_status(ServingStatus::Running);
        Ok(())
    }

    /// Stops the replica. Idempotent, never fails.
    ///
    /// With `cleanup` set, the replica's data directory is removed as well;
    /// removal failures are logged and ignored.
    pub fn stop(&self, cleanup: bool) {
        let mut inner = self.inner.lock();
        inner.engine.stop();
        self.set_status(ServingStatus::Stopped);

        if cleanup {
            if let Err(e) = std::fs::remove_dir_all(&self.config.data_dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(error = %e, "failed to remove replica data directory");
                }
            }
        }
        info!(cleanup, "replica stopped");
    }

    /// Returns the serving status without contending for the domain.
    #[must_use]
    pub fn status(&self) -> ServingStatus {
        ServingStatus::from_u8(self.status.load(Ordering::Relaxed))
    }

    /// Returns the highest locally committed decree.
    #[must_use]
    pub fn committed_decree(&self) -> Decree {
        self.inner.lock().ledger.committed()
    }

    /// Returns the highest decree with a checkpoint on stable storage.
    #[must_use]
    pub fn durable_decree(&self) -> Decree {
        self.inner.lock().ledger.durable()
    }

    /// Updates the committed marker on behalf of the replication
    /// collaborator.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::CommittedRegression`] if `to` moves backward.
    pub fn set_committed(&self, to: Decree) -> Result<(), LedgerError> {
        self.inner.lock().ledger.set_committed(to)
    }

    /// Takes a snapshot of the dispatch and transition counters.
    #[must_use]
    pub fn metrics(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Materializes a checkpoint of current engine state.
    ///
    /// Idempotent when no commits have landed since the last checkpoint.
    /// Runs under the exclusivity domain: no command is applied while the
    /// snapshot is captured, so the checkpoint's decree always equals the
    /// committed decree at the moment the domain was held.
    ///
    /// # Errors
    ///
    /// Recoverable: [`CheckpointError::EngineFailure`],
    /// [`CheckpointError::PersistFailure`] — nothing was mutated, retry is
    /// safe. Fatal: [`CheckpointError::MissingFile`],
    /// [`CheckpointError::LedgerRejected`].
    pub fn checkpoint(&self) -> Result<CheckpointRecord, CheckpointError> {
        let mut inner = self.inner.lock();
        let prev = self.swap_status(ServingStatus::Checkpointing);
        let result = self.checkpoint_locked(&mut inner);
        self.set_status(prev);

        if let Err(e) = &result {
            if e.is_fatal() {
                error!(error = %e, "fatal checkpoint failure");
            }
        }
        result
    }

    fn checkpoint_locked(
        &self,
        inner: &mut ReplicaInner,
    ) -> Result<CheckpointRecord, CheckpointError> {
        let committed = inner.ledger.committed();
        let durable = inner.ledger.durable();

        if durable == committed {
            let record = self.store.record(durable);
            if durable > 0 && !record.path.exists() {
                return Err(CheckpointError::MissingFile {
                    decree: durable,
                    path: record.path,
                });
            }
            debug!(decree = durable, "checkpoint already current");
            return Ok(record);
        }

        inner
            .engine
            .execute(&self.config.persist_command)
            .map_err(CheckpointError::EngineFailure)?;

        let record = self
            .store
            .install(&self.config.image_path(), committed)
            .map_err(CheckpointError::PersistFailure)?;

        inner
            .ledger
            .advance_durable(committed)
            .map_err(CheckpointError::LedgerRejected)?;

        self.counters.checkpoints.fetch_add(1, Ordering::Relaxed);
        info!(decree = committed, "checkpoint complete");
        Ok(record)
    }

    /// Returns the record of the current durable checkpoint, for the
    /// collaborator's learn-transfer path.
    ///
    /// `None` when nothing is durable yet (decree 0).
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::MissingFile`] if the ledger reports a
    /// durable decree whose file is gone.
    pub fn current_checkpoint(&self) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let inner = self.inner.lock();
        let durable = inner.ledger.durable();
        if durable == 0 {
            return Ok(None);
        }
        let record = self.store.record(durable);
        if !record.path.exists() {
            return Err(CheckpointError::MissingFile {
                decree: durable,
                path: record.path,
            });
        }
        Ok(Some(record))
    }

    /// Installs a peer-supplied snapshot.
    ///
    /// See [`LearnMode`] for the two modes and their validation rules. Not
    /// cancellable mid-flight; a full learn leaves the engine unavailable
    /// for its duration, and any full-learn failure leaves the replica
    /// stopped (the engine was torn down and did not come back).
    ///
    /// # Errors
    ///
    /// Recoverable: [`LearnError::StaleDecree`] (checked before any
    /// mutation), [`LearnError::PersistFailure`]. Fatal:
    /// [`LearnError::EngineRestartFailed`], [`LearnError::LedgerRejected`].
    pub fn apply_learn(&self, snapshot: &Path, mode: LearnMode) -> Result<(), LearnError> {
        let mut inner = self.inner.lock();
        let result = match mode {
            LearnMode::Copy { target } => self.apply_copy(&mut inner, snapshot, target),
            LearnMode::Learn { baseline } => {
                self.set_status(ServingStatus::Learning);
                let result = self.apply_full(&mut inner, snapshot, baseline);
                self.set_status(match result {
                    Ok(()) => ServingStatus::Running,
                    Err(_) => ServingStatus::Stopped,
                });
                result
            }
        };

        if let Err(e) = &result {
            if e.is_fatal() {
                error!(error = %e, %mode, "fatal learn failure");
            }
        }
        result
    }

    fn apply_copy(
        &self,
        inner: &mut ReplicaInner,
        snapshot: &Path,
        target: Decree,
    ) -> Result<(), LearnError> {
        let durable = inner.ledger.durable();
        if target <= durable {
            return Err(LearnError::StaleDecree { target, durable });
        }

        self.store
            .install(snapshot, target)
            .map_err(LearnError::PersistFailure)?;
        inner
            .ledger
            .advance_durable(target)
            .map_err(LearnError::LedgerRejected)?;

        self.counters.learns.fetch_add(1, Ordering::Relaxed);
        info!(decree = target, "copy-mode checkpoint installed");
        Ok(())
    }

    fn apply_full(
        &self,
        inner: &mut ReplicaInner,
        snapshot: &Path,
        baseline: Decree,
    ) -> Result<(), LearnError> {
        inner.engine.stop();

        let image = self.config.image_path();
        if baseline > 0 {
            // Keep a decree-qualified copy so the durable marker stays
            // backed by a checkpoint file, then stage the image from it.
            let record = self
                .store
                .install(snapshot, baseline)
                .map_err(LearnError::PersistFailure)?;
            std::fs::copy(&record.path, &image).map_err(LearnError::PersistFailure)?;
        } else {
            std::fs::rename(snapshot, &image).map_err(LearnError::PersistFailure)?;
        }

        inner
            .engine
            .start(Some(&image))
            .map_err(LearnError::EngineRestartFailed)?;
        inner.ledger.reset_baseline(baseline);

        self.counters.learns.fetch_add(1, Ordering::Relaxed);
        info!(decree = baseline, "learn applied, serving resumed from transferred snapshot");
        Ok(())
    }

    /// Dispatches one command to the engine.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::EngineUnavailable`] on connection-level
    /// failure. Engine-level rejections are ordinary replies.
    pub fn execute(&self, command: &Command) -> Result<Vec<u8>, DispatchError> {
        let mut inner = self.inner.lock();
        match inner.engine.execute(&command.payload) {
            Ok(reply) => {
                self.count_command(command);
                Ok(reply)
            }
            Err(source) => Err(DispatchError::EngineUnavailable {
                completed: Vec::new(),
                source,
            }),
        }
    }

    /// Dispatches a batch, executing its commands strictly in order under
    /// one acquisition of the exclusivity domain.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::EngineUnavailable`] if the connection fails
    /// mid-batch, carrying the ordered results of the commands already
    /// applied; their side effects are not rolled back.
    pub fn execute_batch(&self, batch: &BatchRequest) -> Result<Vec<Vec<u8>>, DispatchError> {
        let mut inner = self.inner.lock();
        let mut completed = Vec::with_capacity(batch.commands().len());

        for command in batch.commands() {
            match inner.engine.execute(&command.payload) {
                Ok(reply) => {
                    self.count_command(command);
                    completed.push(reply);
                }
                Err(source) => {
                    warn!(
                        applied = completed.len(),
                        total = batch.commands().len(),
                        error = %source,
                        "batch aborted by engine failure"
                    );
                    return Err(DispatchError::EngineUnavailable { completed, source });
                }
            }
        }

        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        Ok(completed)
    }

    /// Deletes all but the newest `keep` checkpoint files, never the one
    /// backing the current durable decree.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error from the directory scan.
    pub fn prune_checkpoints(&self, keep: usize) -> std::io::Result<usize> {
        let inner = self.inner.lock();
        self.store.prune(keep, inner.ledger.durable())
    }

    fn count_command(&self, command: &Command) {
        if command.is_write {
            self.counters.writes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.reads.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn set_status(&self, status: ServingStatus) {
        self.status.store(status.as_u8(), Ordering::Relaxed);
    }

    fn swap_status(&self, status: ServingStatus) -> ServingStatus {
        ServingStatus::from_u8(self.status.swap(status.as_u8(), Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quay_engine::testing::InMemoryEngine;

    fn make_replica(dir: &Path) -> Replica {
        let config = ReplicaConfig::new(dir);
        let engine = InMemoryEngine::new(config.image_path());
        Replica::new(config, Box::new(engine))
    }

    #[test]
    fn test_new_replica_is_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let replica = make_replica(dir.path());
        assert_eq!(replica.status(), ServingStatus::Stopped);
        assert_eq!(replica.committed_decree(), 0);
        assert_eq!(replica.durable_decree(), 0);
    }

    #[test]
    fn test_checkpoint_without_engine_is_engine_failure() {
        let dir = tempfile::tempdir().unwrap();
        let replica = make_replica(dir.path());
        replica.set_committed(1).unwrap();

        let err = replica.checkpoint().unwrap_err();
        assert!(matches!(err, CheckpointError::EngineFailure(_)));
        assert!(!err.is_fatal());
        // The failed attempt did not mutate the ledger.
        assert_eq!(replica.durable_decree(), 0);
        assert_eq!(replica.status(), ServingStatus::Stopped);
    }

    #[test]
    fn test_stop_twice_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let replica = make_replica(dir.path());
        replica.start().unwrap();
        replica.stop(false);
        replica.stop(false);
        assert_eq!(replica.status(), ServingStatus::Stopped);
    }

    #[test]
    fn test_stop_with_cleanup_removes_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("replica");
        let config = ReplicaConfig::new(&data_dir);
        let engine = InMemoryEngine::new(config.image_path());
        let replica = Replica::new(config, Box::new(engine));

        replica.start().unwrap();
        assert!(data_dir.exists());
        replica.stop(true);
        assert!(!data_dir.exists());
    }

    #[test]
    fn test_missing_durable_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let replica = make_replica(dir.path());
        replica.start().unwrap();

        replica.set_committed(1).unwrap();
        replica.execute(&Command::write("SET k v")).unwrap();
        let record = replica.checkpoint().unwrap();

        std::fs::remove_file(&record.path).unwrap();
        let err = replica.checkpoint().unwrap_err();
        assert!(matches!(err, CheckpointError::MissingFile { decree: 1, .. }));
        assert!(err.is_fatal());
    }
}
