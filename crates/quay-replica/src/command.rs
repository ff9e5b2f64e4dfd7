//! Client command and batch request types.

/// An opaque client command: a byte-string payload for the engine plus a
/// read/write flag.
///
/// The flag affects only dispatch bookkeeping; read and write paths invoke
/// the same synchronous engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Raw command bytes, already decoded from the wire.
    pub payload: Vec<u8>,
    /// Whether this command is counted as a write.
    pub is_write: bool,
}

impl Command {
    /// Creates a read command.
    pub fn read(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            is_write: false,
        }
    }

    /// Creates a write command.
    pub fn write(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            is_write: true,
        }
    }
}

/// A batch was constructed with no commands.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("batch request must contain at least one command")]
pub struct InvalidBatch;

/// An ordered, non-empty sequence of commands executed strictly in sequence.
///
/// Batches carry no transactional semantics: a connection-level failure
/// aborts the remainder, and side effects of already-applied commands are
/// not rolled back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRequest {
    commands: Vec<Command>,
}

impl BatchRequest {
    /// Creates a batch from `commands`.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidBatch`] if `commands` is empty; non-emptiness is
    /// enforced here so dispatch never has to re-check it.
    pub fn new(commands: Vec<Command>) -> Result<Self, InvalidBatch> {
        if commands.is_empty() {
            return Err(InvalidBatch);
        }
        Ok(Self { commands })
    }

    /// Returns the commands in execution order.
    #[must_use]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }
}
