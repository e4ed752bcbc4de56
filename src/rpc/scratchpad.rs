//! Per-message scratch allocator.
//!
//! Decoded values that must outlive a decode call in a different shape than
//! the wire form (NUL-terminated strings, mutable copies of byte strings)
//! are placed in the unused capacity of the receive buffer, past the last
//! byte of the frame:
//!
//! ```text
//! ┌────────┬─────────────────────┬──────────────────────────────┐
//! │ header │ payload (decoder)   │ scratch region (bump alloc)  │
//! └────────┴─────────────────────┴──────────────────────────────┘
//!                                ▲ split_at_mut: disjoint borrows
//! ```
//!
//! Allocations are bump-only and die with the buffer borrow; nothing is
//! freed individually.

use core::ffi::CStr;
use core::fmt;

use super::codec::{CodecError, Decoder};

/// Allocation granularity (and alignment of every returned block).
pub const SCRATCHPAD_ALIGN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScratchpadError {
    /// Not enough room left in the region.
    Exhausted,
    /// A string meant for a C-string copy contains a NUL byte.
    InteriorNul,
    Codec(CodecError),
}

impl fmt::Display for ScratchpadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted => write!(f, "scratchpad exhausted"),
            Self::InteriorNul => write!(f, "string contains NUL"),
            Self::Codec(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ScratchpadError {}

impl From<CodecError> for ScratchpadError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

impl From<ScratchpadError> for crate::error::Status {
    fn from(e: ScratchpadError) -> Self {
        match e {
            ScratchpadError::Exhausted => Self::NO_MEMORY,
            ScratchpadError::InteriorNul => Self::INVALID_ARGS,
            ScratchpadError::Codec(c) => c.into(),
        }
    }
}

/// Bump allocator over a borrowed region.
pub struct Scratchpad<'a> {
    free: &'a mut [u8],
    used: usize,
}

impl<'a> Scratchpad<'a> {
    /// Wrap `region`, skipping leading bytes so the first block is aligned.
    pub fn new(region: &'a mut [u8]) -> Self {
        let skip = region.as_ptr().align_offset(SCRATCHPAD_ALIGN).min(region.len());
        let (_, free) = region.split_at_mut(skip);
        Self { free, used: 0 }
    }

    /// An empty scratchpad; every allocation fails with `Exhausted`.
    pub fn empty() -> Self {
        Self { free: &mut [], used: 0 }
    }

    /// Bytes handed out so far, including alignment padding.
    pub fn used(&self) -> usize {
        self.used
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Reserve `size` bytes. On failure nothing is consumed.
    pub fn alloc(&mut self, size: usize) -> Result<&'a mut [u8], ScratchpadError> {
        let rounded = size
            .checked_next_multiple_of(SCRATCHPAD_ALIGN)
            .ok_or(ScratchpadError::Exhausted)?;
        if rounded > self.free.len() {
            return Err(ScratchpadError::Exhausted);
        }
        let region = core::mem::take(&mut self.free);
        let (block, rest) = region.split_at_mut(rounded);
        self.free = rest;
        self.used += rounded;
        Ok(&mut block[..size])
    }

    pub fn copy(&mut self, bytes: &[u8]) -> Result<&'a mut [u8], ScratchpadError> {
        let block = self.alloc(bytes.len())?;
        block.copy_from_slice(bytes);
        Ok(block)
    }

    /// NUL-terminated copy of `s`.
    pub fn cstr(&mut self, s: &str) -> Result<&'a CStr, ScratchpadError> {
        if s.as_bytes().contains(&0) {
            return Err(ScratchpadError::InteriorNul);
        }
        let block = self.alloc(s.len() + 1)?;
        block[..s.len()].copy_from_slice(s.as_bytes());
        block[s.len()] = 0;
        let block: &'a [u8] = block;
        CStr::from_bytes_with_nul(block).map_err(|_| ScratchpadError::InteriorNul)
    }

    /// Decode a byte string and return an owned, mutable copy of it.
    pub fn decode_bytes(&mut self, dec: &mut Decoder<'_>) -> Result<&'a mut [u8], ScratchpadError> {
        let mut ahead = dec.clone();
        let bytes = ahead.decode_bytes()?;
        let block = self.copy(bytes)?;
        *dec = ahead;
        Ok(block)
    }

    /// Decode a string into a NUL-terminated copy.
    pub fn decode_cstr(&mut self, dec: &mut Decoder<'_>) -> Result<&'a CStr, ScratchpadError> {
        let mut ahead = dec.clone();
        let s = ahead.decode_str()?;
        let c = self.cstr(s)?;
        *dec = ahead;
        Ok(c)
    }
}
