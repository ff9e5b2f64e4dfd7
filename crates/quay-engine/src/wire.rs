//! Length-prefixed framing for the engine command channel.
//!
//! Both directions carry `u32` big-endian length + payload. Commands and
//! replies are opaque byte strings; this module never inspects payloads.

use std::io::{Read, Write};

/// Upper bound on a single frame payload. Frames above this are treated as
/// stream corruption rather than allocated.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Writes one length-prefixed frame.
///
/// # Errors
///
/// Returns any underlying I/O error; `InvalidInput` if the payload exceeds
/// [`MAX_FRAME_LEN`].
pub fn write_frame(w: &mut impl Write, payload: &[u8]) -> std::io::Result<()> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds maximum", payload.len()),
        ));
    }
    #[allow(clippy::cast_possible_truncation)] // bounded by MAX_FRAME_LEN above
    let len = payload.len() as u32;
    w.write_all(&len.to_be_bytes())?;
    w.write_all(payload)?;
    w.flush()
}

/// Reads one length-prefixed frame, blocking until complete.
///
/// # Errors
///
/// Returns any underlying I/O error; `InvalidData` if the length prefix
/// exceeds [`MAX_FRAME_LEN`].
pub fn read_frame(r: &mut impl Read) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds maximum"),
        ));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    Ok(payload)
}
