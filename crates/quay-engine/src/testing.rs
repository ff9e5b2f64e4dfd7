//! Testing utilities for code built on the [`Engine`] trait.
//!
//! Provides [`InMemoryEngine`], an in-process engine with the same
//! lifecycle and save semantics as a real backing process: a `HashMap`
//! database, a tiny text command set, and a JSON image file written on
//! `SAVE` and reloaded on start. A shared [`FaultHandle`] injects
//! connection loss and start refusal after the engine has been handed off
//! to the code under test.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use crate::engine::{Engine, EngineError, EngineState};

#[derive(Debug, Default)]
struct FaultPlan {
    // Remaining commands before a simulated connection drop; -1 = disabled.
    commands_until_failure: AtomicI64,
    refuse_next_start: AtomicBool,
}

/// Shared control over an [`InMemoryEngine`]'s injected faults.
///
/// Clones observe the same plan, so faults can be armed after the engine
/// has been boxed and moved into the code under test. Faults persist across
/// engine restarts until cleared.
#[derive(Debug, Clone)]
pub struct FaultHandle(Arc<FaultPlan>);

impl FaultHandle {
    fn new() -> Self {
        let plan = FaultPlan {
            commands_until_failure: AtomicI64::new(-1),
            refuse_next_start: AtomicBool::new(false),
        };
        Self(Arc::new(plan))
    }

    /// After `n` further commands, every `execute` fails as if the
    /// connection dropped, until the engine is restarted and the fault
    /// cleared.
    pub fn fail_after(&self, n: u64) {
        #[allow(clippy::cast_possible_wrap)]
        self.0
            .commands_until_failure
            .store(n as i64, Ordering::Relaxed);
    }

    /// Makes the next `start` call fail, as a crashed-on-boot engine would.
    pub fn refuse_next_start(&self) {
        self.0.refuse_next_start.store(true, Ordering::Relaxed);
    }

    /// Disarms all pending faults.
    pub fn clear(&self) {
        self.0.commands_until_failure.store(-1, Ordering::Relaxed);
        self.0.refuse_next_start.store(false, Ordering::Relaxed);
    }
}

/// In-process engine for tests.
///
/// Commands are UTF-8 text: `SET key value`, `GET key`, `DEL key`, `PING`,
/// and `SAVE`. `SAVE` serializes the database as JSON to the configured
/// image path; `start(Some(path))` loads that format back. Engine-level
/// rejections (unknown commands, wrong arity) are ordinary `ERR ...`
/// replies, mirroring how a real engine reports them in-band.
pub struct InMemoryEngine {
    image_path: PathBuf,
    db: HashMap<String, String>,
    state: EngineState,
    faults: FaultHandle,
}

impl InMemoryEngine {
    /// Creates a stopped in-memory engine saving to `image_path`.
    pub fn new(image_path: impl Into<PathBuf>) -> Self {
        Self {
            image_path: image_path.into(),
            db: HashMap::new(),
            state: EngineState::Stopped,
            faults: FaultHandle::new(),
        }
    }

    /// Returns a handle for injecting faults into this engine.
    #[must_use]
    pub fn fault_handle(&self) -> FaultHandle {
        self.faults.clone()
    }

    /// Returns the number of keys currently stored.
    #[must_use]
    pub fn keys(&self) -> usize {
        self.db.len()
    }

    fn run_command(&mut self, text: &str) -> Vec<u8> {
        let mut parts = text.splitn(3, ' ');
        let op = parts.next().unwrap_or("");
        match op {
            "PING" => b"PONG".to_vec(),
            "SET" => match (parts.next(), parts.next()) {
                (Some(key), Some(value)) => {
                    self.db.insert(key.to_string(), value.to_string());
                    b"OK".to_vec()
                }
                _ => b"ERR wrong number of arguments for SET".to_vec(),
            },
            "GET" => match parts.next() {
                Some(key) => self
                    .db
                    .get(key)
                    .map_or_else(|| b"(nil)".to_vec(), |v| v.clone().into_bytes()),
                None => b"ERR wrong number of arguments for GET".to_vec(),
            },
            "DEL" => match parts.next() {
                Some(key) => {
                    if self.db.remove(key).is_some() {
                        b"1".to_vec()
                    } else {
                        b"0".to_vec()
                    }
                }
                None => b"ERR wrong number of arguments for DEL".to_vec(),
            },
            "SAVE" => match serde_json::to_string(&self.db) {
                Ok(json) => match std::fs::write(&self.image_path, json) {
                    Ok(()) => b"OK".to_vec(),
                    Err(e) => format!("ERR save failed: {e}").into_bytes(),
                },
                Err(e) => format!("ERR save failed: {e}").into_bytes(),
            },
            other => format!("ERR unknown command '{other}'").into_bytes(),
        }
    }
}

impl Engine for InMemoryEngine {
    fn start(&mut self, snapshot: Option<&Path>) -> Result<(), EngineError> {
        self.stop();
        if self.faults.0.refuse_next_start.swap(false, Ordering::Relaxed) {
            return Err(EngineError::LaunchFailed(
                "engine start refused (injected fault)".to_string(),
            ));
        }

        self.db = match snapshot {
            Some(path) if path.exists() => {
                let json = std::fs::read_to_string(path)
                    .map_err(|e| EngineError::LaunchFailed(e.to_string()))?;
                serde_json::from_str(&json)
                    .map_err(|e| EngineError::LaunchFailed(format!("corrupt image: {e}")))?
            }
            _ => HashMap::new(),
        };
        self.state = EngineState::Running;
        Ok(())
    }

    fn stop(&mut self) {
        // Process memory is gone after a stop; only the image file survives.
        self.db.clear();
        self.state = EngineState::Stopped;
    }

    fn execute(&mut self, command: &[u8]) -> Result<Vec<u8>, EngineError> {
        if self.state != EngineState::Running {
            return Err(EngineError::Disconnected("engine is not running".to_string()));
        }

        let remaining = self.faults.0.commands_until_failure.load(Ordering::Relaxed);
        if remaining == 0 {
            self.state = EngineState::Stopped;
            return Err(EngineError::Disconnected(
                "connection reset (injected fault)".to_string(),
            ));
        }
        if remaining > 0 {
            self.faults
                .0
                .commands_until_failure
                .store(remaining - 1, Ordering::Relaxed);
        }

        let Ok(text) = std::str::from_utf8(command) else {
            return Ok(b"ERR invalid utf-8 command".to_vec());
        };
        Ok(self.run_command(text.trim_end()))
    }

    fn state(&self) -> EngineState {
        self.state
    }
}
