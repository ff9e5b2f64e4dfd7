//! # QuayDB Engine Handle
//!
//! Lifecycle and synchronous command channel for one backing-engine instance.
//!
//! The backing engine is a disposable, restartable black box: a separate
//! process that owns a single database image file and answers one command at
//! a time over a loopback socket. This crate isolates all process-lifecycle
//! fragility behind the narrow [`Engine`] trait so the replica core above it
//! never has to reason about engine internals.
//!
//! - [`Engine`]: start / stop / execute contract
//! - [`ProcessEngine`]: spawns and drives a real engine process
//! - [`testing::InMemoryEngine`]: in-process engine for tests
//!
//! The caller is responsible for exclusivity. `execute` performs no internal
//! queuing; concurrent use of one engine from multiple threads must be
//! serialized above this crate.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod engine;
pub mod process;
pub mod testing;
pub mod wire;

pub use config::EngineConfig;
pub use engine::{Engine, EngineError, EngineState};
pub use process::ProcessEngine;
