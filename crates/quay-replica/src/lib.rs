//! # QuayDB Replica Core
//!
//! The decree-ordered checkpoint/learn state machine and the serialized
//! command-dispatch path that fronts one backing key-value engine.
//!
//! A replica participates in primary/backup replication by producing
//! durable, decree-named checkpoints of engine state and by consuming learn
//! transfers that bring a lagging or restarting replica up to date. The
//! consensus layer that decides *when* to checkpoint or learn lives outside
//! this crate; it calls [`Replica::checkpoint`] and [`Replica::apply_learn`]
//! and interprets their results.
//!
//! Consistency rests on two rules:
//!
//! 1. One exclusivity domain. Dispatch, checkpoint, learn, and lifecycle
//!    all serialize on a single lock, so no command is applied while a
//!    snapshot is captured or installed.
//! 2. File before marker. A checkpoint file reaches its decree-qualified
//!    name atomically before the durable marker advances, and a restart
//!    re-derives the marker by scanning the files that actually survived.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod command;
pub mod ledger;
pub mod learn;
pub mod metrics;
pub mod replica;
pub mod store;

pub use command::{BatchRequest, Command, InvalidBatch};
pub use ledger::{Decree, DecreeLedger, LedgerError};
pub use learn::{LearnError, LearnMode};
pub use metrics::{CounterSnapshot, ReplicaCounters};
pub use replica::{CheckpointError, DispatchError, Replica, ReplicaConfig, ServingStatus};
pub use store::{CheckpointRecord, CheckpointStore};

/// Result type for replica operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Aggregate error for callers that drive the whole replica lifecycle.
///
/// Individual operations return their own error types; this exists for
/// hosting code that funnels them into one place.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Engine lifecycle or connection error.
    #[error("engine error: {0}")]
    Engine(#[from] quay_engine::EngineError),

    /// Decree marker update rejected.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Checkpoint materialization failed.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Learn transfer failed.
    #[error("learn error: {0}")]
    Learn(#[from] LearnError),

    /// Command dispatch failed.
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Filesystem error during recovery or lifecycle.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
