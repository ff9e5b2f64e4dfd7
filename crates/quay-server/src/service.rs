//! Wire glue between client connections and the replica dispatcher.
//!
//! Requests and responses are length-prefixed frames (the same framing the
//! engine channel uses). A request payload is one op byte followed by the
//! op-specific body:
//!
//! ```text
//! 0x01 READ         <command bytes>
//! 0x02 WRITE        <command bytes>
//! 0x03 BATCH_READ   u32 count, then count x (u32 len, command bytes)
//! 0x04 BATCH_WRITE  u32 count, then count x (u32 len, command bytes)
//! ```
//!
//! A response payload is one status byte followed by the body: `0x00` OK
//! (single reply bytes, or `u32 count` + items for a batch), `0x01` error
//! (message), `0x02` partial batch (`u32 count` + items applied before the
//! failure, then the message).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use quay_replica::{
    BatchRequest, Command, DispatchError, InvalidBatch, LedgerError, Replica,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

const OP_READ: u8 = 0x01;
const OP_WRITE: u8 = 0x02;
const OP_BATCH_READ: u8 = 0x03;
const OP_BATCH_WRITE: u8 = 0x04;

const STATUS_OK: u8 = 0x00;
const STATUS_ERR: u8 = 0x01;
const STATUS_PARTIAL: u8 = 0x02;

/// A decoded client request.
#[derive(Debug)]
pub enum Request {
    /// One command.
    Single(Command),
    /// An ordered batch of commands.
    Batch(BatchRequest),
}

/// Errors from decoding a request frame.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The frame ended before the announced contents.
    #[error("request frame is truncated")]
    Truncated,

    /// The frame carried bytes past the announced contents.
    #[error("request frame has trailing bytes")]
    TrailingBytes,

    /// Unrecognized op byte.
    #[error("unknown request op {0:#04x}")]
    UnknownOp(u8),

    /// A batch request with no commands.
    #[error(transparent)]
    EmptyBatch(#[from] InvalidBatch),
}

/// Decodes one request frame payload.
pub fn decode_request(frame: &[u8]) -> Result<Request, ProtocolError> {
    let (&op, body) = frame.split_first().ok_or(ProtocolError::Truncated)?;
    match op {
        OP_READ => Ok(Request::Single(Command::read(body))),
        OP_WRITE => Ok(Request::Single(Command::write(body))),
        OP_BATCH_READ | OP_BATCH_WRITE => {
            let is_write = op == OP_BATCH_WRITE;
            let commands = decode_items(body)?
                .into_iter()
                .map(|payload| {
                    if is_write {
                        Command::write(payload)
                    } else {
                        Command::read(payload)
                    }
                })
                .collect();
            Ok(Request::Batch(BatchRequest::new(commands)?))
        }
        other => Err(ProtocolError::UnknownOp(other)),
    }
}

fn decode_items(body: &[u8]) -> Result<Vec<Vec<u8>>, ProtocolError> {
    let (count, mut rest) = split_u32(body)?;
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (len, after_len) = split_u32(rest)?;
        let len = len as usize;
        if after_len.len() < len {
            return Err(ProtocolError::Truncated);
        }
        items.push(after_len[..len].to_vec());
        rest = &after_len[len..];
    }
    if !rest.is_empty() {
        return Err(ProtocolError::TrailingBytes);
    }
    Ok(items)
}

fn split_u32(bytes: &[u8]) -> Result<(u32, &[u8]), ProtocolError> {
    if bytes.len() < 4 {
        return Err(ProtocolError::Truncated);
    }
    let (head, rest) = bytes.split_at(4);
    Ok((u32::from_be_bytes(head.try_into().expect("4 bytes")), rest))
}

fn encode_reply(reply: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + reply.len());
    out.push(STATUS_OK);
    out.extend_from_slice(reply);
    out
}

fn encode_items(out: &mut Vec<u8>, items: &[Vec<u8>]) {
    out.extend_from_slice(&u32::try_from(items.len()).unwrap_or(u32::MAX).to_be_bytes());
    for item in items {
        out.extend_from_slice(&u32::try_from(item.len()).unwrap_or(u32::MAX).to_be_bytes());
        out.extend_from_slice(item);
    }
}

fn encode_batch_reply(replies: &[Vec<u8>]) -> Vec<u8> {
    let mut out = vec![STATUS_OK];
    encode_items(&mut out, replies);
    out
}

fn encode_error(message: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + message.len());
    out.push(STATUS_ERR);
    out.extend_from_slice(message.as_bytes());
    out
}

fn encode_partial(completed: &[Vec<u8>], message: &str) -> Vec<u8> {
    let mut out = vec![STATUS_PARTIAL];
    encode_items(&mut out, completed);
    out.extend_from_slice(message.as_bytes());
    out
}

/// Standalone-mode decree assignment.
///
/// Without a consensus layer, the server itself is the replication
/// collaborator: each applied write is one decree. Concurrent writers may
/// race their marker updates; a regression just means another writer
/// already advanced past us.
pub struct DecreeCounter {
    next: AtomicU64,
}

impl DecreeCounter {
    /// Creates a counter continuing from `committed`.
    pub fn new(committed: u64) -> Self {
        Self {
            next: AtomicU64::new(committed),
        }
    }

    fn advance(&self, replica: &Replica, writes: u64) {
        if writes == 0 {
            return;
        }
        let decree = self.next.fetch_add(writes, Ordering::Relaxed) + writes;
        match replica.set_committed(decree) {
            Ok(()) | Err(LedgerError::CommittedRegression { .. }) => {}
            Err(e) => warn!(error = %e, "committed marker update failed"),
        }
    }
}

/// Runs one decoded request against the replica and encodes the response.
pub fn run_request(replica: &Replica, decrees: &DecreeCounter, request: &Request) -> Vec<u8> {
    match request {
        Request::Single(command) => match replica.execute(command) {
            Ok(reply) => {
                decrees.advance(replica, u64::from(command.is_write));
                encode_reply(&reply)
            }
            Err(e) => encode_error(&e.to_string()),
        },
        Request::Batch(batch) => match replica.execute_batch(batch) {
            Ok(replies) => {
                let writes = batch.commands().iter().filter(|c| c.is_write).count() as u64;
                decrees.advance(replica, writes);
                encode_batch_reply(&replies)
            }
            Err(DispatchError::EngineUnavailable { completed, source }) => {
                // Applied commands took effect; their decrees are owed even
                // though the batch as a whole failed.
                let writes = batch
                    .commands()
                    .iter()
                    .take(completed.len())
                    .filter(|c| c.is_write)
                    .count() as u64;
                decrees.advance(replica, writes);
                encode_partial(&completed, &source.to_string())
            }
        },
    }
}

async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > quay_engine::wire::MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds maximum"),
        ));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

async fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> std::io::Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame too large"))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await
}

/// Serves one client connection until it closes or fails.
pub async fn serve_connection(
    replica: Arc<Replica>,
    decrees: Arc<DecreeCounter>,
    mut stream: TcpStream,
) {
    loop {
        let frame = match read_frame(&mut stream).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                debug!(error = %e, "client connection failed");
                return;
            }
        };

        let response = match decode_request(&frame) {
            Ok(request) => {
                let replica = Arc::clone(&replica);
                let decrees = Arc::clone(&decrees);
                let handled = tokio::task::spawn_blocking(move || {
                    run_request(&replica, &decrees, &request)
                })
                .await;
                match handled {
                    Ok(response) => response,
                    Err(e) => encode_error(&format!("request handler failed: {e}")),
                }
            }
            Err(e) => encode_error(&e.to_string()),
        };

        if let Err(e) = write_frame(&mut stream, &response).await {
            debug!(error = %e, "client connection failed");
            return;
        }
    }
}
