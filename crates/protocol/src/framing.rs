//! Native-messaging frame codec.
//!
//! # Frame Format
//!
//! Each message on the host channel consists of:
//! - 4 bytes: payload length, unsigned, host byte order (the browser writes
//!   the prefix with the platform's native endianness)
//! - N bytes: UTF-8 JSON payload
//!
//! # Termination
//!
//! A clean EOF before the length prefix, or a zero-length prefix, signals
//! that the host has closed the channel and the reader must stop. A stream
//! that ends *inside* a frame body is an error: the partial bytes are
//! discarded, never surfaced as a shorter message.

use std::io::{Read, Write};

use crate::error::{ProtocolError, Result};

/// Maximum frame size accepted on the host channel (4 MiB).
///
/// The cap is applied before the body is read so an adversarial length
/// prefix cannot grow buffers unbounded.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Size of the length prefix in bytes.
pub const FRAME_PREFIX_SIZE: usize = 4;

/// Read one framed message from `reader`.
///
/// Returns `Ok(None)` when the channel has terminated cleanly (EOF before a
/// full length prefix, or a zero-length frame). Returns an error when the
/// advertised length exceeds `max` or the stream ends mid-body.
pub fn read_frame<R: Read>(reader: &mut R, max: usize) -> Result<Option<Vec<u8>>> {
    let mut prefix = [0u8; FRAME_PREFIX_SIZE];
    if !read_exact_or_eof(reader, &mut prefix)? {
        return Ok(None);
    }

    let length = u32::from_ne_bytes(prefix) as usize;
    if length == 0 {
        return Ok(None);
    }
    if length > max {
        return Err(ProtocolError::FrameTooLarge { size: length, max });
    }

    let mut body = vec![0u8; length];
    let mut filled = 0;
    while filled < length {
        let n = reader.read(&mut body[filled..])?;
        if n == 0 {
            return Err(ProtocolError::TruncatedFrame {
                expected: length,
                got: filled,
            });
        }
        filled += n;
    }

    Ok(Some(body))
}

/// Write one framed message to `writer`: length prefix, body, flush.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    writer.write_all(&(payload.len() as u32).to_ne_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Fill `buf` completely, or report a clean EOF if the stream ends before
/// the first byte. EOF after at least one byte of `buf` is an I/O error.
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream ended inside length prefix",
            )));
        }
        filled += n;
    }
    Ok(true)
}
