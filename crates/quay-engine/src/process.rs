//! Process-backed engine implementation.
//!
//! [`ProcessEngine`] launches the configured engine executable, hands it a
//! generated config file naming its data directory, image file, and listen
//! port, then drives it over a loopback socket. The child process is held
//! behind a drop guard so every exit path, including panics and early error
//! returns, terminates and reaps it.

use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::process::{Child, Command, Stdio};

use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::engine::{Engine, EngineError, EngineState};
use crate::wire::{read_frame, write_frame};

/// Kills and reaps the child process on drop.
struct ChildGuard {
    child: Child,
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Err(e) = self.child.kill() {
            debug!(error = %e, "engine process already gone");
        }
        if let Err(e) = self.child.wait() {
            warn!(error = %e, "failed to reap engine process");
        }
    }
}

/// One live engine session: process handle plus its command connection.
///
/// Destroyed and recreated wholesale on restart; no partial-state reuse.
struct EngineSession {
    conn: TcpStream,
    port: u16,
    // Held only for its Drop; killing the process closes the socket too.
    _child: ChildGuard,
}

/// An engine running as a separate process, reachable over loopback.
pub struct ProcessEngine {
    config: EngineConfig,
    session: Option<EngineSession>,
    state: EngineState,
}

impl ProcessEngine {
    /// Creates a process engine in the `Stopped` state.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            session: None,
            state: EngineState::Stopped,
        }
    }

    /// Returns the configuration this engine was created with.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the port of the live session, if any.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.session.as_ref().map(|s| s.port)
    }

    fn launch(&self, port: u16) -> Result<Child, EngineError> {
        let conf_path = write_engine_conf(&self.config, port)
            .map_err(|e| EngineError::LaunchFailed(e.to_string()))?;

        Command::new(&self.config.binary)
            .arg(&conf_path)
            .current_dir(&self.config.data_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                EngineError::LaunchFailed(format!(
                    "{}: {e}",
                    self.config.binary.display()
                ))
            })
    }

    fn connect(&self, port: u16) -> Result<TcpStream, EngineError> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        for attempt in 1..=self.config.connect_attempts {
            match TcpStream::connect(addr) {
                Ok(conn) => {
                    conn.set_nodelay(true)
                        .and_then(|()| conn.set_read_timeout(Some(self.config.request_timeout)))
                        .and_then(|()| conn.set_write_timeout(Some(self.config.request_timeout)))
                        .map_err(|e| EngineError::Disconnected(e.to_string()))?;
                    debug!(port, attempt, "connected to engine");
                    return Ok(conn);
                }
                Err(e) => {
                    debug!(port, attempt, error = %e, "engine not accepting yet");
                    std::thread::sleep(self.config.connect_backoff);
                }
            }
        }
        Err(EngineError::ConnectFailed {
            port,
            attempts: self.config.connect_attempts,
        })
    }
}

impl Engine for ProcessEngine {
    fn start(&mut self, snapshot: Option<&Path>) -> Result<(), EngineError> {
        self.stop();
        self.state = EngineState::Starting;

        let result = (|| {
            std::fs::create_dir_all(&self.config.data_dir)
                .map_err(|e| EngineError::LaunchFailed(e.to_string()))?;

            let image = self.config.image_path();
            match snapshot {
                Some(path) if path != image => {
                    std::fs::copy(path, &image)
                        .map_err(|e| EngineError::LaunchFailed(e.to_string()))?;
                }
                Some(_) => {}
                None => {
                    // Fresh instance: the engine loads whatever image file is
                    // present, so a stale one must be gone before launch.
                    if let Err(e) = std::fs::remove_file(&image) {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            return Err(EngineError::LaunchFailed(e.to_string()));
                        }
                    }
                }
            }

            let port = ephemeral_port().map_err(|e| EngineError::LaunchFailed(e.to_string()))?;
            let child = ChildGuard {
                child: self.launch(port)?,
            };
            let conn = self.connect(port)?;
            Ok(EngineSession {
                conn,
                port,
                _child: child,
            })
        })();

        match result {
            Ok(session) => {
                info!(port = session.port, "engine started");
                self.session = Some(session);
                self.state = EngineState::Running;
                Ok(())
            }
            Err(e) => {
                self.state = EngineState::Stopped;
                Err(e)
            }
        }
    }

    fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            info!(port = session.port, "stopping engine");
        }
        self.state = EngineState::Stopped;
    }

    fn execute(&mut self, command: &[u8]) -> Result<Vec<u8>, EngineError> {
        let timeout = self.config.request_timeout;
        let Some(session) = self.session.as_mut() else {
            return Err(EngineError::Disconnected("engine is not running".to_string()));
        };

        let exchange = write_frame(&mut session.conn, command)
            .and_then(|()| read_frame(&mut session.conn));

        match exchange {
            Ok(reply) => Ok(reply),
            Err(e) => {
                // A half-completed exchange leaves the reply stream
                // unsynchronized; tear the session down rather than risk
                // pairing later replies with the wrong requests.
                self.session = None;
                self.state = EngineState::Stopped;
                match e.kind() {
                    std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                        Err(EngineError::Timeout(timeout))
                    }
                    _ => Err(EngineError::Disconnected(e.to_string())),
                }
            }
        }
    }

    fn state(&self) -> EngineState {
        self.state
    }
}

/// Writes the engine-readable config file and returns its path.
fn write_engine_conf(config: &EngineConfig, port: u16) -> std::io::Result<std::path::PathBuf> {
    let conf_path = config.conf_path();
    let mut f = std::fs::File::create(&conf_path)?;
    writeln!(f, "dbfilename {}", config.image_filename)?;
    writeln!(f, "dir {}", config.data_dir.display())?;
    writeln!(f, "port {port}")?;
    f.sync_all()?;
    Ok(conf_path)
}

/// Asks the OS for a currently free loopback port.
///
/// The port is released again before the engine binds it, so a concurrent
/// process could steal it; the connect retry window absorbs the resulting
/// failed launch the same way it absorbs a slow engine start.
fn ephemeral_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fast_config(binary: &str, data_dir: &Path) -> EngineConfig {
        let mut config = EngineConfig::new(binary, data_dir);
        config.connect_attempts = 3;
        config.connect_backoff = Duration::from_millis(10);
        config
    }

    #[test]
    fn test_execute_without_session_is_disconnected() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = ProcessEngine::new(fast_config("/bin/true", dir.path()));
        let err = engine.execute(b"PING").unwrap_err();
        assert!(matches!(err, EngineError::Disconnected(_)));
    }

    #[test]
    fn test_start_with_missing_binary_is_launch_failed() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = ProcessEngine::new(fast_config(
            "/nonexistent/quay-engine-binary",
            dir.path(),
        ));
        let err = engine.start(None).unwrap_err();
        assert!(matches!(err, EngineError::LaunchFailed(_)));
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[test]
    fn test_start_with_non_listening_binary_is_connect_failed() {
        let dir = tempfile::tempdir().unwrap();
        // /bin/true exits immediately and never listens.
        let mut engine = ProcessEngine::new(fast_config("/bin/true", dir.path()));
        let err = engine.start(None).unwrap_err();
        assert!(matches!(err, EngineError::ConnectFailed { attempts: 3, .. }));
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = ProcessEngine::new(fast_config("/bin/true", dir.path()));
        engine.stop();
        engine.stop();
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[test]
    fn test_engine_conf_contents() {
        let dir = tempfile::tempdir().unwrap();
        let config = fast_config("/bin/true", dir.path());
        let conf_path = write_engine_conf(&config, 12345).unwrap();

        let contents = std::fs::read_to_string(conf_path).unwrap();
        assert!(contents.contains("dbfilename dump.db"));
        assert!(contents.contains("port 12345"));
    }
}
