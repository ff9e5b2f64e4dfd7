//! The [`Engine`] contract shared by process-backed and in-memory engines.

use std::path::Path;
use std::time::Duration;

/// State of the engine session resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No process or connection exists.
    Stopped,
    /// The process has been launched; the connection is not yet established.
    Starting,
    /// The engine is reachable and accepting commands.
    Running,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "Stopped"),
            Self::Starting => write!(f, "Starting"),
            Self::Running => write!(f, "Running"),
        }
    }
}

/// Errors from engine lifecycle and command execution.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine process could not be spawned.
    #[error("failed to launch engine process: {0}")]
    LaunchFailed(String),

    /// No connection could be established within the retry window.
    #[error("could not connect to engine on port {port} after {attempts} attempts")]
    ConnectFailed {
        /// Port the engine was configured to listen on.
        port: u16,
        /// Number of connection attempts made.
        attempts: u32,
    },

    /// A single request/reply exchange exceeded the configured timeout.
    #[error("engine request timed out after {0:?}")]
    Timeout(Duration),

    /// The connection to the engine is gone or was never established.
    #[error("engine connection lost: {0}")]
    Disconnected(String),
}

/// Lifecycle and command contract for one backing-engine instance.
///
/// An implementation owns its session exclusively; the session is destroyed
/// and recreated wholesale on restart, never partially reused. `execute`
/// blocks for the reply and performs no internal queuing or retry.
pub trait Engine: Send {
    /// Starts the engine, tearing down any existing session first.
    ///
    /// With `snapshot` set, the engine loads that file as its initial
    /// database image; with `None` it starts from an empty image.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::LaunchFailed`] if the process cannot be
    /// spawned, or [`EngineError::ConnectFailed`] if no connection is
    /// established within the bounded retry window.
    fn start(&mut self, snapshot: Option<&Path>) -> Result<(), EngineError>;

    /// Stops the engine. Idempotent; terminate-best-effort, never fails.
    fn stop(&mut self);

    /// Sends one command and blocks for the reply.
    ///
    /// Engine-level rejections (malformed commands, unknown operations) are
    /// ordinary replies, not errors; only transport-level failures surface
    /// here.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Timeout`] if the reply does not arrive within
    /// the configured window, or [`EngineError::Disconnected`] if the
    /// session is gone or the connection fails mid-exchange.
    fn execute(&mut self, command: &[u8]) -> Result<Vec<u8>, EngineError>;

    /// Returns the current session state.
    fn state(&self) -> EngineState;
}
