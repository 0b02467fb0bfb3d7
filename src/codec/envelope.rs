//! Record envelope format.
//!
//! Every record stored in a block file is wrapped as:
//! - Version (1 byte): always [`ENVELOPE_VERSION`]
//! - Width (1 byte): pointer width in bytes, one of 1, 2, 4, 8
//! - Start (width bytes, LE): offset of the payload inside the envelope
//! - End (width bytes, LE): offset one past the payload
//! - Payload (end - start bytes)
//!
//! The width is the smallest one able to hold `end`.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};

/// Current envelope version.
pub const ENVELOPE_VERSION: u8 = 1;

const WIDTHS: [u8; 4] = [1, 2, 4, 8];

/// Lightweight description of an encoded envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader {
    /// Envelope version byte
    pub version: u8,
    /// Payload start, relative to the envelope
    pub start_offset: u64,
    /// Payload end, relative to the envelope
    pub end_offset: u64,
}

/// A decoded envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Envelope version byte
    pub version: u8,
    /// Payload start, relative to the envelope
    pub start_offset: u64,
    /// Payload end, relative to the envelope
    pub end_offset: u64,
    /// Payload bytes
    pub data: Vec<u8>,
}

#[inline]
fn header_len(width: u8) -> u64 {
    2 + 2 * width as u64
}

fn fits(value: u64, width: u8) -> bool {
    width >= 8 || value < (1u64 << (8 * width as u32))
}

/// Picks the smallest width whose header plus payload still addresses.
fn choose_width(payload_len: u64) -> u8 {
    for width in WIDTHS {
        if fits(header_len(width) + payload_len, width) {
            return width;
        }
    }
    8
}

/// Wraps `payload` in an envelope.
pub fn encode(payload: &[u8]) -> (Vec<u8>, EnvelopeHeader) {
    let width = choose_width(payload.len() as u64);
    let start = header_len(width);
    let end = start + payload.len() as u64;

    let mut buf = BytesMut::with_capacity(end as usize);
    buf.put_u8(ENVELOPE_VERSION);
    buf.put_u8(width);
    buf.put_uint_le(start, width as usize);
    buf.put_uint_le(end, width as usize);
    buf.put_slice(payload);

    let header = EnvelopeHeader { version: ENVELOPE_VERSION, start_offset: start, end_offset: end };
    (buf.to_vec(), header)
}

/// Unwraps an envelope.
///
/// Trailing bytes after the declared end are ignored.
pub fn decode(mut buf: &[u8]) -> Result<Envelope> {
    if buf.len() < 2 {
        return Err(Error::corruption(format!("Envelope too short: {} bytes", buf.len())));
    }
    let version = buf.get_u8();
    let width = buf.get_u8();
    if !WIDTHS.contains(&width) {
        return Err(Error::corruption(format!("Invalid pointer width: {}", width)));
    }
    if buf.len() < 2 * width as usize {
        return Err(Error::corruption("Truncated envelope header"));
    }
    let start_offset = buf.get_uint_le(width as usize);
    let end_offset = buf.get_uint_le(width as usize);
    if end_offset < start_offset {
        return Err(Error::corruption(format!(
            "Envelope end {} before start {}",
            end_offset, start_offset
        )));
    }

    let len = (end_offset - start_offset) as usize;
    if buf.len() < len {
        return Err(Error::corruption(format!(
            "Incomplete envelope: expected {} payload bytes, got {}",
            len,
            buf.len()
        )));
    }

    Ok(Envelope { version, start_offset, end_offset, data: buf[..len].to_vec() })
}
