//! Configuration for a backing-engine instance.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for one backing-engine process.
///
/// The engine owns a single database image file inside `data_dir`; saving
/// engine state always targets that file, and restarts load from it. The
/// connect window bounds how long [`crate::ProcessEngine::start`] waits for
/// the freshly spawned process to accept a connection.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path to the engine executable.
    pub binary: PathBuf,
    /// Directory holding the engine's image and config files.
    pub data_dir: PathBuf,
    /// File name of the canonical database image, relative to `data_dir`.
    pub image_filename: String,
    /// Maximum connection attempts after spawning the process.
    pub connect_attempts: u32,
    /// Delay between connection attempts.
    pub connect_backoff: Duration,
    /// Read/write timeout for a single `execute` exchange.
    pub request_timeout: Duration,
}

impl EngineConfig {
    /// Creates a configuration with default timeouts and the default
    /// image file name (`dump.db`).
    pub fn new(binary: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            data_dir: data_dir.into(),
            image_filename: "dump.db".to_string(),
            connect_attempts: 20,
            connect_backoff: Duration::from_millis(50),
            request_timeout: Duration::from_secs(5),
        }
    }

    /// Returns the path of the canonical database image file.
    #[must_use]
    pub fn image_path(&self) -> PathBuf {
        self.data_dir.join(&self.image_filename)
    }

    /// Returns the path of the engine-readable config file written at start.
    #[must_use]
    pub fn conf_path(&self) -> PathBuf {
        self.data_dir.join("engine.conf")
    }

    /// Returns the data directory.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}
