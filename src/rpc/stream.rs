//! Frames over a byte stream.
//!
//! Wire format:
//! ```text
//! ┌────────────┬───────────────────────────────┐
//! │ Length (4B)│ Frame: header ‖ payload (N B) │
//! │ LE u32     │                               │
//! └────────────┴───────────────────────────────┘
//! ```
//!
//! [`FrameDecoder`] accumulates incoming bytes and yields complete frames.
//! This handles partial reads: a single [`ByteChannel::read`] may return
//! part of the prefix, part of the frame, or several frames back to back.
//! Nothing arrives unless [`StreamTransport::poll`] is called; the owner
//! drives it from whatever loop services the underlying channel.

use core::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use log::{debug, warn};

use super::frame::HEADER_SIZE;
use super::transport::{BufferPool, MAX_FRAME_SIZE, Receiver, RxBuffer, Transport, TxBuffer};
use crate::error::TransportError;

/// Length prefix size (4-byte little-endian length).
pub const LEN_PREFIX_SIZE: usize = 4;

/// Bytes pulled from the channel per `poll` read.
const READ_CHUNK: usize = 256;

// ── Byte channel ──────────────────────────────────────────────

/// Byte-oriented channel: UART, socket, pipe.
pub trait ByteChannel: Send {
    type Error: core::fmt::Debug;

    /// Read up to `buf.len()` bytes. Returns 0 if nothing is available
    /// (non-blocking).
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;

    /// Write some of `data`, returning how many bytes were taken.
    fn write(&mut self, data: &[u8]) -> Result<usize, Self::Error>;

    fn flush(&mut self) -> Result<(), Self::Error>;
}

/// A channel that discards all writes and never reads. Useful as a sink
/// when no peer is attached.
pub struct NullChannel;

impl ByteChannel for NullChannel {
    type Error = ();

    fn read(&mut self, _buf: &mut [u8]) -> Result<usize, ()> {
        Ok(0)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, ()> {
        Ok(data.len())
    }

    fn flush(&mut self) -> Result<(), ()> {
        Ok(())
    }
}

// ── Frame decoder ─────────────────────────────────────────────

enum DecoderState {
    ReadingPrefix { collected: usize },
    ReadingFrame { expected: usize, collected: usize },
}

/// Streaming length-prefix decoder.
pub struct FrameDecoder {
    state: DecoderState,
    prefix: [u8; LEN_PREFIX_SIZE],
    frame: [u8; MAX_FRAME_SIZE],
    /// Prefixes rejected as zero or oversized.
    rejected: u32,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: DecoderState::ReadingPrefix { collected: 0 },
            prefix: [0; LEN_PREFIX_SIZE],
            frame: [0; MAX_FRAME_SIZE],
            rejected: 0,
        }
    }

    /// Feed bytes into the decoder.
    ///
    /// Returns how many bytes of `data` were consumed and, if a frame was
    /// completed, the frame. The frame slice is valid until the next call;
    /// unconsumed bytes must be fed again.
    pub fn feed(&mut self, data: &[u8]) -> (usize, Option<&[u8]>) {
        let mut offset = 0;

        while offset < data.len() {
            match &mut self.state {
                DecoderState::ReadingPrefix { collected } => {
                    let to_copy = (LEN_PREFIX_SIZE - *collected).min(data.len() - offset);
                    self.prefix[*collected..*collected + to_copy]
                        .copy_from_slice(&data[offset..offset + to_copy]);
                    *collected += to_copy;
                    offset += to_copy;

                    if *collected == LEN_PREFIX_SIZE {
                        let expected = u32::from_le_bytes(self.prefix) as usize;
                        if expected == 0 || expected > MAX_FRAME_SIZE {
                            // Invalid length: resynchronise on the next prefix.
                            self.rejected = self.rejected.saturating_add(1);
                            self.state = DecoderState::ReadingPrefix { collected: 0 };
                            continue;
                        }
                        self.state = DecoderState::ReadingFrame { expected, collected: 0 };
                    }
                }

                DecoderState::ReadingFrame { expected, collected } => {
                    let to_copy = (*expected - *collected).min(data.len() - offset);
                    self.frame[*collected..*collected + to_copy]
                        .copy_from_slice(&data[offset..offset + to_copy]);
                    *collected += to_copy;
                    offset += to_copy;

                    if *collected == *expected {
                        let len = *expected;
                        self.state = DecoderState::ReadingPrefix { collected: 0 };
                        return (offset, Some(&self.frame[..len]));
                    }
                }
            }
        }

        (offset, None)
    }

    /// Reset decoder state (e.g. after a channel reconnect).
    pub fn reset(&mut self) {
        self.state = DecoderState::ReadingPrefix { collected: 0 };
    }

    pub fn rejected(&self) -> u32 {
        self.rejected
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Write `[LE-u32 length][frame]` into `out`. Returns the bytes written, or
/// `None` if the frame is empty, oversized, or does not fit.
pub fn encode_frame(frame: &[u8], out: &mut [u8]) -> Option<usize> {
    let total = LEN_PREFIX_SIZE + frame.len();
    if frame.is_empty() || frame.len() > MAX_FRAME_SIZE || total > out.len() {
        return None;
    }
    out[..LEN_PREFIX_SIZE].copy_from_slice(&(frame.len() as u32).to_le_bytes());
    out[LEN_PREFIX_SIZE..total].copy_from_slice(frame);
    Some(total)
}

// ── Transport ─────────────────────────────────────────────────

/// A decoded frame, or what is left of one there was no buffer for.
enum Inbound {
    Frame(RxBuffer),
    Dropped { head: [u8; HEADER_SIZE], len: usize },
}

/// [`Transport`] over a [`ByteChannel`].
pub struct StreamTransport<C: ByteChannel> {
    channel: Mutex<C>,
    decoder: Mutex<FrameDecoder>,
    pool: Arc<BufferPool>,
    up: AtomicBool,
    receiver: BlockingMutex<CriticalSectionRawMutex, RefCell<Option<Weak<dyn Receiver>>>>,
}

impl<C: ByteChannel> StreamTransport<C> {
    pub fn new(channel: C, pool: Arc<BufferPool>) -> Self {
        Self {
            channel: Mutex::new(channel),
            decoder: Mutex::new(FrameDecoder::new()),
            pool,
            up: AtomicBool::new(true),
            receiver: BlockingMutex::new(RefCell::new(None)),
        }
    }

    fn receiver(&self) -> Option<Arc<dyn Receiver>> {
        self.receiver.lock(|r| r.borrow().as_ref().and_then(Weak::upgrade))
    }

    fn fail(&self) -> TransportError {
        if self.up.swap(false, Ordering::AcqRel) {
            warn!("STREAM: channel failed, link down");
            if let Some(r) = self.receiver() {
                r.on_link_down();
            }
        }
        TransportError::Io
    }

    /// Pull available bytes and deliver every complete frame. Returns the
    /// number of frames delivered.
    pub fn poll(&self) -> Result<usize, TransportError> {
        if !self.is_up() {
            return Err(TransportError::LinkDown);
        }
        let mut chunk = [0u8; READ_CHUNK];
        let n = {
            let mut channel = self.channel.lock().map_err(|_| TransportError::Io)?;
            match channel.read(&mut chunk) {
                Ok(n) => n,
                Err(e) => {
                    drop(channel);
                    warn!("STREAM: read failed: {:?}", e);
                    return Err(self.fail());
                }
            }
        };

        let mut offset = 0;
        let mut delivered = 0;
        while offset < n {
            let inbound = {
                let mut decoder = self.decoder.lock().map_err(|_| TransportError::Io)?;
                let (used, frame) = decoder.feed(&chunk[offset..n]);
                offset += used;
                match frame {
                    Some(bytes) => match self.pool.try_lease() {
                        Some(lease) => Some(Inbound::Frame(RxBuffer::from_slice(bytes, Some(lease))?)),
                        None => {
                            warn!("STREAM: no receive buffer, frame of {} bytes dropped", bytes.len());
                            let mut head = [0u8; HEADER_SIZE];
                            let len = bytes.len().min(HEADER_SIZE);
                            head[..len].copy_from_slice(&bytes[..len]);
                            Some(Inbound::Dropped { head, len })
                        }
                    },
                    None => None,
                }
            };
            let Some(inbound) = inbound else { continue };
            let Some(r) = self.receiver() else {
                debug!("STREAM: unbound, frame dropped");
                continue;
            };
            match inbound {
                Inbound::Frame(frame) => {
                    r.on_receive(frame);
                    delivered += 1;
                }
                Inbound::Dropped { head, len } => r.on_dropped(&head[..len], TransportError::NoBuffer),
            }
        }
        Ok(delivered)
    }

    /// Mark the link up again after the channel was re-established.
    pub fn reconnect(&self) {
        if let Ok(mut decoder) = self.decoder.lock() {
            decoder.reset();
        }
        self.up.store(true, Ordering::Release);
    }
}

impl<C: ByteChannel> Transport for StreamTransport<C> {
    fn bind(&self, receiver: Weak<dyn Receiver>) {
        self.receiver.lock(|r| *r.borrow_mut() = Some(receiver));
    }

    fn alloc_tx(&self, payload_capacity: usize) -> Result<TxBuffer, TransportError> {
        if !self.is_up() {
            return Err(TransportError::LinkDown);
        }
        let lease = self.pool.try_lease().ok_or(TransportError::NoBuffer)?;
        TxBuffer::new(payload_capacity, Some(lease))
    }

    fn send(&self, frame: TxBuffer) -> Result<(), TransportError> {
        if !self.is_up() {
            return Err(TransportError::LinkDown);
        }
        let mut out = [0u8; LEN_PREFIX_SIZE + MAX_FRAME_SIZE];
        let total = encode_frame(frame.frame(), &mut out).ok_or(TransportError::FrameTooLarge)?;
        drop(frame);

        let mut channel = self.channel.lock().map_err(|_| TransportError::Io)?;
        let mut written = 0;
        while written < total {
            match channel.write(&out[written..total]) {
                Ok(0) => {
                    drop(channel);
                    warn!("STREAM: channel accepted no bytes");
                    return Err(self.fail());
                }
                Ok(n) => written += n,
                Err(e) => {
                    drop(channel);
                    warn!("STREAM: write failed: {:?}", e);
                    return Err(self.fail());
                }
            }
        }
        if let Err(e) = channel.flush() {
            drop(channel);
            warn!("STREAM: flush failed: {:?}", e);
            return Err(self.fail());
        }
        Ok(())
    }

    fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }
}
