//! Decree markers and their ordering invariant.
//!
//! A decree is a 64-bit, monotonically non-decreasing sequence number
//! marking a point in committed replication history. Each replica tracks
//! two markers: the highest decree the replication layer has committed
//! locally, and the highest decree for which a checkpoint file is known to
//! exist on stable storage. Outside of a learn transition,
//! `durable <= committed` always holds.

/// A point in the committed operation sequence.
pub type Decree = u64;

/// Errors from decree marker updates.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// The durable marker would not move forward.
    #[error("durable decree {to} would not advance past {durable}")]
    NonMonotonic {
        /// Requested durable decree.
        to: Decree,
        /// Current durable decree.
        durable: Decree,
    },

    /// The durable marker would overtake the committed marker.
    #[error("durable decree {to} would exceed committed decree {committed}")]
    ExceedsCommitted {
        /// Requested durable decree.
        to: Decree,
        /// Current committed decree.
        committed: Decree,
    },

    /// The committed marker would move backward.
    #[error("committed decree {to} would regress below {committed}")]
    CommittedRegression {
        /// Requested committed decree.
        to: Decree,
        /// Current committed decree.
        committed: Decree,
    },
}

/// The replica's committed and durable progress markers.
///
/// The committed marker is owned by the external replication collaborator;
/// the durable marker is mutated only by checkpoint and learn operations.
/// A rejected update never has side effects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecreeLedger {
    committed: Decree,
    durable: Decree,
}

impl DecreeLedger {
    /// Creates a ledger with both markers at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a ledger recovered from an on-disk scan: both markers start
    /// at the durable decree derived from the highest checkpoint file found.
    #[must_use]
    pub fn recover(durable: Decree) -> Self {
        Self {
            committed: durable,
            durable,
        }
    }

    /// Returns the highest locally committed decree.
    #[must_use]
    pub fn committed(&self) -> Decree {
        self.committed
    }

    /// Returns the highest decree with a checkpoint on stable storage.
    #[must_use]
    pub fn durable(&self) -> Decree {
        self.durable
    }

    /// Advances the durable marker.
    ///
    /// The caller must have made the checkpoint file for `to` durable on
    /// disk before calling this; the file is renamed into place first, then
    /// the marker advances.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NonMonotonic`] if `to <= durable()`, or
    /// [`LedgerError::ExceedsCommitted`] if `to > committed()`.
    pub fn advance_durable(&mut self, to: Decree) -> Result<(), LedgerError> {
        if to <= self.durable {
            return Err(LedgerError::NonMonotonic {
                to,
                durable: self.durable,
            });
        }
        if to > self.committed {
            return Err(LedgerError::ExceedsCommitted {
                to,
                committed: self.committed,
            });
        }
        self.durable = to;
        Ok(())
    }

    /// Updates the committed marker. Invoked only on behalf of the external
    /// replication collaborator.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::CommittedRegression`] if `to < committed()`.
    pub fn set_committed(&mut self, to: Decree) -> Result<(), LedgerError> {
        if to < self.committed {
            return Err(LedgerError::CommittedRegression {
                to,
                committed: self.committed,
            });
        }
        self.committed = to;
        Ok(())
    }

    /// Assigns both markers to `to`, establishing a new baseline.
    ///
    /// Only a learn transfer may do this: the peer's snapshot is
    /// authoritative, so the baseline may legitimately equal or precede the
    /// previous markers.
    pub fn reset_baseline(&mut self, to: Decree) {
        self.committed = to;
        self.durable = to;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_ledger_starts_at_zero() {
        let ledger = DecreeLedger::new();
        assert_eq!(ledger.committed(), 0);
        assert_eq!(ledger.durable(), 0);
    }

    #[test]
    fn test_advance_durable_up_to_committed() {
        let mut ledger = DecreeLedger::new();
        ledger.set_committed(5).unwrap();
        ledger.advance_durable(3).unwrap();
        ledger.advance_durable(5).unwrap();
        assert_eq!(ledger.durable(), 5);
    }

    #[test]
    fn test_advance_durable_rejects_non_monotonic() {
        let mut ledger = DecreeLedger::new();
        ledger.set_committed(5).unwrap();
        ledger.advance_durable(4).unwrap();

        let err = ledger.advance_durable(4).unwrap_err();
        assert_eq!(err, LedgerError::NonMonotonic { to: 4, durable: 4 });
        // Rejection has no side effects.
        assert_eq!(ledger.durable(), 4);
        assert_eq!(ledger.committed(), 5);
    }

    #[test]
    fn test_advance_durable_rejects_past_committed() {
        let mut ledger = DecreeLedger::new();
        ledger.set_committed(2).unwrap();

        let err = ledger.advance_durable(3).unwrap_err();
        assert_eq!(err, LedgerError::ExceedsCommitted { to: 3, committed: 2 });
        assert_eq!(ledger.durable(), 0);
    }

    #[test]
    fn test_set_committed_rejects_regression() {
        let mut ledger = DecreeLedger::new();
        ledger.set_committed(10).unwrap();
        ledger.set_committed(10).unwrap();

        let err = ledger.set_committed(9).unwrap_err();
        assert_eq!(
            err,
            LedgerError::CommittedRegression { to: 9, committed: 10 }
        );
        assert_eq!(ledger.committed(), 10);
    }

    #[test]
    fn test_invariant_holds_across_mixed_sequences() {
        let mut ledger = DecreeLedger::new();
        for (commit, durable) in [(3, 1), (7, 3), (7, 7), (12, 9)] {
            ledger.set_committed(commit).unwrap();
            ledger.advance_durable(durable).unwrap();
            assert!(ledger.durable() <= ledger.committed());
        }
    }

    #[test]
    fn test_reset_baseline_may_move_backward() {
        let mut ledger = DecreeLedger::new();
        ledger.set_committed(10).unwrap();
        ledger.advance_durable(10).unwrap();

        ledger.reset_baseline(4);
        assert_eq!(ledger.committed(), 4);
        assert_eq!(ledger.durable(), 4);
    }

    #[test]
    fn test_recover_seeds_both_markers() {
        let ledger = DecreeLedger::recover(17);
        assert_eq!(ledger.committed(), 17);
        assert_eq!(ledger.durable(), 17);
    }
}
