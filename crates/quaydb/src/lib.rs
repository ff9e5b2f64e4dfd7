//! # QuayDB
//!
//! A replicated-service adapter that fronts an external, stateful key-value
//! engine: client commands are serialized into the engine, and the replica
//! participates in primary/backup replication by producing durable,
//! decree-named checkpoints and consuming learn transfers.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use quaydb::{Command, EngineConfig, LearnMode, ProcessEngine, Replica, ReplicaConfig};
//!
//! fn main() -> quaydb::Result<()> {
//!     let engine = ProcessEngine::new(EngineConfig::new(
//!         "/usr/local/bin/kv-engine",
//!         "/var/lib/quay/replica-0",
//!     ));
//!     let replica = Replica::new(
//!         ReplicaConfig::new("/var/lib/quay/replica-0"),
//!         Box::new(engine),
//!     );
//!
//!     // Recovers the durable decree from the checkpoints on disk.
//!     replica.start()?;
//!
//!     let reply = replica.execute(&Command::write("SET greeting hello"))?;
//!     assert_eq!(reply, b"OK");
//!
//!     // The replication layer drives commits and checkpoints.
//!     replica.set_committed(1)?;
//!     let checkpoint = replica.checkpoint()?;
//!     println!("durable at decree {}", checkpoint.decree);
//!
//!     replica.stop(false);
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

// Re-export the replica core
pub use quay_replica::*;

// Re-export the engine handle
pub use quay_engine::{Engine, EngineConfig, EngineError, EngineState, ProcessEngine};
