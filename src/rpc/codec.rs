//! Payload codec: cursor-based encode/decode over fixed buffers.
//!
//! Values are written back to back with postcard's compact format:
//! ```text
//! u8 / bool      1 byte
//! u16..u64       varint (7 bits per byte, LSB first)
//! i32 / i64      zig-zag varint
//! str / bytes    varint length ‖ raw bytes
//! list / map     varint count ‖ elements (pairs for maps)
//! nullable       0x00 (null) | 0x01 ‖ value
//! ```
//!
//! Both cursors are transactional per value: a failed call leaves
//! `written()` / `position()` exactly where it was, so a caller may retry
//! with a smaller value or report the failure without cleanup.
//!
//! Decoded strings and byte strings borrow from the input buffer. They stay
//! valid for as long as the receive buffer they were decoded from.
//!
//! A decoder can be [invalidated](Decoder::invalidate) by code that finds
//! the input unusable halfway through; every later decode then fails with
//! the same error, so a chain of `?` stops at the first check.

use serde::{Deserialize, Serialize};

pub use crate::error::CodecError;

impl From<postcard::Error> for CodecError {
    fn from(e: postcard::Error) -> Self {
        match e {
            postcard::Error::SerializeBufferFull => Self::BufferFull,
            postcard::Error::DeserializeUnexpectedEnd => Self::Truncated,
            postcard::Error::DeserializeBadUtf8 => Self::InvalidUtf8,
            _ => Self::Malformed,
        }
    }
}

// ── Encoder ───────────────────────────────────────────────────

/// Append-only writer over a caller-sized buffer.
pub struct Encoder<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Encoder<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes written so far.
    pub fn written(&self) -> usize {
        self.pos
    }

    /// Bytes still available.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Encode any serde value in postcard format.
    pub fn encode<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CodecError> {
        let used = postcard::to_slice(value, &mut self.buf[self.pos..])?.len();
        self.pos += used;
        Ok(())
    }

    pub fn encode_u8(&mut self, v: u8) -> Result<(), CodecError> {
        self.encode(&v)
    }

    pub fn encode_u16(&mut self, v: u16) -> Result<(), CodecError> {
        self.encode(&v)
    }

    pub fn encode_u32(&mut self, v: u32) -> Result<(), CodecError> {
        self.encode(&v)
    }

    pub fn encode_u64(&mut self, v: u64) -> Result<(), CodecError> {
        self.encode(&v)
    }

    pub fn encode_i32(&mut self, v: i32) -> Result<(), CodecError> {
        self.encode(&v)
    }

    pub fn encode_i64(&mut self, v: i64) -> Result<(), CodecError> {
        self.encode(&v)
    }

    pub fn encode_bool(&mut self, v: bool) -> Result<(), CodecError> {
        self.encode(&v)
    }

    pub fn encode_str(&mut self, s: &str) -> Result<(), CodecError> {
        self.encode_bytes(s.as_bytes())
    }

    pub fn encode_bytes(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        let len = u32::try_from(bytes.len()).map_err(|_| CodecError::BufferFull)?;
        let start = self.pos;
        self.encode_u32(len)?;
        if bytes.len() > self.remaining() {
            self.pos = start;
            return Err(CodecError::BufferFull);
        }
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }

    /// Absent nullable value. A present one is written as `Some(value)`.
    pub fn encode_null(&mut self) -> Result<(), CodecError> {
        self.encode(&Option::<()>::None)
    }

    /// Declare a list of `count` elements; the caller encodes them next.
    pub fn encode_list_start(&mut self, count: usize) -> Result<(), CodecError> {
        let count = u32::try_from(count).map_err(|_| CodecError::Malformed)?;
        self.encode_u32(count)
    }

    /// Declare a map of `count` key/value pairs.
    pub fn encode_map_start(&mut self, count: usize) -> Result<(), CodecError> {
        self.encode_list_start(count)
    }
}

// ── Decoder ───────────────────────────────────────────────────

/// Forward-only reader over a received payload.
#[derive(Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    invalid: Option<CodecError>,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0, invalid: None }
    }

    /// Mark the input unusable. Every later decode fails with `error`;
    /// the first error set sticks.
    pub fn invalidate(&mut self, error: CodecError) {
        if self.invalid.is_none() {
            self.invalid = Some(error);
        }
    }

    pub fn is_valid(&self) -> bool {
        self.invalid.is_none()
    }

    /// The error set by [`invalidate`](Self::invalidate), if any.
    pub fn error(&self) -> Option<CodecError> {
        self.invalid
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Decode any serde value in postcard format. Borrowed fields
    /// (`&str`, `&[u8]`) point into the input buffer.
    pub fn decode<T: Deserialize<'a>>(&mut self) -> Result<T, CodecError> {
        if let Some(e) = self.invalid {
            return Err(e);
        }
        let buf: &'a [u8] = self.buf;
        let input = &buf[self.pos..];
        let (value, rest) = postcard::take_from_bytes::<T>(input)?;
        self.pos += input.len() - rest.len();
        Ok(value)
    }

    pub fn decode_u8(&mut self) -> Result<u8, CodecError> {
        self.decode()
    }

    pub fn decode_u16(&mut self) -> Result<u16, CodecError> {
        self.decode()
    }

    pub fn decode_u32(&mut self) -> Result<u32, CodecError> {
        self.decode()
    }

    pub fn decode_u64(&mut self) -> Result<u64, CodecError> {
        self.decode()
    }

    pub fn decode_i32(&mut self) -> Result<i32, CodecError> {
        self.decode()
    }

    pub fn decode_i64(&mut self) -> Result<i64, CodecError> {
        self.decode()
    }

    pub fn decode_bool(&mut self) -> Result<bool, CodecError> {
        self.decode()
    }

    /// Zero-copy string view into the input.
    pub fn decode_str(&mut self) -> Result<&'a str, CodecError> {
        let start = self.pos;
        let bytes = self.decode_bytes()?;
        core::str::from_utf8(bytes).map_err(|_| {
            self.pos = start;
            CodecError::InvalidUtf8
        })
    }

    /// Zero-copy byte string view into the input.
    pub fn decode_bytes(&mut self) -> Result<&'a [u8], CodecError> {
        let start = self.pos;
        let len = self.decode_u32()? as usize;
        if len > self.remaining() {
            self.pos = start;
            return Err(CodecError::Truncated);
        }
        let buf: &'a [u8] = self.buf;
        let bytes = &buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Copy a byte string into `out`, returning its length.
    pub fn decode_bytes_into(&mut self, out: &mut [u8]) -> Result<usize, CodecError> {
        let start = self.pos;
        let bytes = self.decode_bytes()?;
        if bytes.len() > out.len() {
            self.pos = start;
            return Err(CodecError::BufferFull);
        }
        out[..bytes.len()].copy_from_slice(bytes);
        Ok(bytes.len())
    }

    /// Consume the tag of a nullable value. `true` means null; on `false`
    /// the value follows.
    pub fn decode_is_null(&mut self) -> Result<bool, CodecError> {
        let present: bool = self.decode()?;
        Ok(!present)
    }

    /// Step over one value of type `T` without keeping it.
    pub fn skip<T: Deserialize<'a>>(&mut self) -> Result<(), CodecError> {
        self.decode::<T>().map(drop)
    }

    /// Read a list header. Every element needs at least one byte, so a count
    /// beyond the remaining input is rejected up front.
    pub fn decode_list_start(&mut self) -> Result<usize, CodecError> {
        self.decode_count(1)
    }

    /// Read a map header (`count` key/value pairs, two bytes minimum each).
    pub fn decode_map_start(&mut self) -> Result<usize, CodecError> {
        self.decode_count(2)
    }

    fn decode_count(&mut self, min_item: usize) -> Result<usize, CodecError> {
        let start = self.pos;
        let count = self.decode_u32()? as usize;
        if count.saturating_mul(min_item) > self.remaining() {
            self.pos = start;
            return Err(CodecError::Truncated);
        }
        Ok(count)
    }
}
