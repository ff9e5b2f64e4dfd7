//! Learn-transfer modes and their validation rules.

use quay_engine::EngineError;

use crate::ledger::{Decree, LedgerError};

/// How a peer-supplied snapshot is installed.
///
/// Each mode carries its own validated decree parameter rather than sharing
/// a flag-plus-argument pair, so a mode cannot silently bypass the other's
/// validation rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LearnMode {
    /// The replica is behind and must resume serving from the transferred
    /// snapshot. The peer's snapshot is authoritative: `baseline` may equal
    /// or precede the current markers, and both markers are reassigned to
    /// it. The engine is unavailable for the duration.
    Learn {
        /// New baseline decree for both markers.
        baseline: Decree,
    },

    /// The replica is only archiving or relaying the checkpoint, not
    /// resuming from it. Requires `target` to exceed the current durable
    /// decree; the running engine is not touched.
    Copy {
        /// Decree the checkpoint file is installed under.
        target: Decree,
    },
}

impl std::fmt::Display for LearnMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Learn { baseline } => write!(f, "Learn(baseline {baseline})"),
            Self::Copy { target } => write!(f, "Copy(target {target})"),
        }
    }
}

/// Errors from applying a learn transfer.
#[derive(Debug, thiserror::Error)]
pub enum LearnError {
    /// Copy-mode target is not newer than what is already durable.
    #[error("copy-mode checkpoint decree {target} is not newer than durable decree {durable}")]
    StaleDecree {
        /// Decree offered by the peer.
        target: Decree,
        /// Current durable decree.
        durable: Decree,
    },

    /// The engine failed to restart from the transferred snapshot. Fatal:
    /// the replica can serve nothing without an engine.
    #[error("engine failed to restart from transferred snapshot: {0}")]
    EngineRestartFailed(#[source] EngineError),

    /// The transferred snapshot could not be moved into place. Nothing was
    /// mutated; the caller may retry the whole operation.
    #[error("could not install transferred snapshot: {0}")]
    PersistFailure(#[source] std::io::Error),

    /// The ledger rejected the copy-mode advance. Fatal: the durable
    /// baseline can no longer be verified against committed progress.
    #[error("ledger rejected copy-mode advance: {0}")]
    LedgerRejected(#[source] LedgerError),
}

impl LearnError {
    /// Whether this failure is unrecoverable for the hosting process.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::EngineRestartFailed(_) | Self::LedgerRejected(_)
        )
    }
}
