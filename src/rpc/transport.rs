//! Transport abstraction: whole frames between two endpoints.
//!
//! Concrete implementations:
//! - [`LoopbackTransport`](super::loopback::LoopbackTransport): two
//!   in-process ends, the stand-in for a shared-memory mailbox
//! - [`StreamTransport`](super::stream::StreamTransport): length-prefixed
//!   frames over any byte channel (UART, TCP, pipe)
//!
//! The endpoint is generic over `dyn Transport`, so adding a new medium
//! requires zero changes to the RPC logic. A transport guarantees whole
//! frames, in order, without truncation; it does not retry.
//!
//! Buffers are leased from a [`BufferPool`] shared by both ends of a link.
//! A lease is returned when its buffer is dropped, whichever side that is.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use super::codec::{Decoder, Encoder};
use super::frame::{HEADER_SIZE, Header};
use super::scratchpad::Scratchpad;
use crate::error::{ProtocolError, TransportError};

/// Largest frame (header included) any transport carries.
pub const MAX_FRAME_SIZE: usize = 1024;

// ── Buffer pool ───────────────────────────────────────────────

/// Bounded count of frame buffers in flight on one link.
#[derive(Debug)]
pub struct BufferPool {
    capacity: usize,
    in_use: AtomicUsize,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self { capacity, in_use: AtomicUsize::new(0) })
    }

    /// Take one buffer from the budget, or `None` if all are leased.
    pub fn try_lease(self: &Arc<Self>) -> Option<Lease> {
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .ok()
            .map(|_| Lease { pool: Arc::clone(self) })
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// One leased buffer slot; returned to the pool on drop.
#[derive(Debug)]
pub struct Lease {
    pool: Arc<BufferPool>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.pool.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

// ── Transmit buffer ───────────────────────────────────────────

/// Outgoing frame under construction. The header slot is reserved up front
/// and the payload may grow to exactly the capacity asked for.
pub struct TxBuffer {
    bytes: [u8; MAX_FRAME_SIZE],
    limit: usize,
    len: usize,
    lease: Option<Lease>,
}

impl TxBuffer {
    pub fn new(payload_capacity: usize, lease: Option<Lease>) -> Result<Self, TransportError> {
        let limit = HEADER_SIZE
            .checked_add(payload_capacity)
            .filter(|&l| l <= MAX_FRAME_SIZE)
            .ok_or(TransportError::FrameTooLarge)?;
        Ok(Self { bytes: [0; MAX_FRAME_SIZE], limit, len: HEADER_SIZE, lease })
    }

    pub fn payload_capacity(&self) -> usize {
        self.limit - HEADER_SIZE
    }

    pub fn payload_len(&self) -> usize {
        self.len - HEADER_SIZE
    }

    pub fn set_header(&mut self, header: Header) {
        let mut raw = [0u8; HEADER_SIZE];
        header.write(&mut raw);
        self.bytes[..HEADER_SIZE].copy_from_slice(&raw);
    }

    /// Append payload values. Nothing is committed if `f` fails.
    pub fn write_payload<E, F>(&mut self, f: F) -> Result<(), E>
    where
        F: FnOnce(&mut Encoder<'_>) -> Result<(), E>,
    {
        let mut enc = Encoder::new(&mut self.bytes[self.len..self.limit]);
        f(&mut enc)?;
        self.len += enc.written();
        Ok(())
    }

    /// Header plus written payload.
    pub fn frame(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// Hand the frame to the receiving side without copying out of the
    /// lease (the shared-memory case).
    pub fn into_rx(self) -> RxBuffer {
        RxBuffer { bytes: self.bytes, len: self.len, lease: self.lease }
    }
}

// ── Receive buffer ────────────────────────────────────────────

/// A received frame. Dropping (or [`release`](Self::release)) returns its
/// lease to the pool.
pub struct RxBuffer {
    bytes: [u8; MAX_FRAME_SIZE],
    len: usize,
    lease: Option<Lease>,
}

impl RxBuffer {
    /// Copy raw frame bytes read off a wire into a pooled buffer.
    pub fn from_slice(frame: &[u8], lease: Option<Lease>) -> Result<Self, TransportError> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge);
        }
        let mut bytes = [0u8; MAX_FRAME_SIZE];
        bytes[..frame.len()].copy_from_slice(frame);
        Ok(Self { bytes, len: frame.len(), lease })
    }

    pub fn frame(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn header(&self) -> Result<Header, ProtocolError> {
        Header::parse(self.frame())
    }

    pub fn is_pooled(&self) -> bool {
        self.lease.is_some()
    }

    /// Payload decoder plus a scratchpad over the spare capacity behind the
    /// frame. The two borrows are disjoint.
    pub fn split(&mut self) -> (Decoder<'_>, Scratchpad<'_>) {
        self.split_from(0)
    }

    /// Like [`split`](Self::split), with the decoder starting `offset`
    /// bytes into the payload.
    pub fn split_from(&mut self, offset: usize) -> (Decoder<'_>, Scratchpad<'_>) {
        let (frame, spare) = self.bytes.split_at_mut(self.len);
        let payload: &[u8] = frame.get(HEADER_SIZE + offset..).unwrap_or(&[]);
        (Decoder::new(payload), Scratchpad::new(spare))
    }

    pub fn release(self) {}
}

// ── Traits ────────────────────────────────────────────────────

/// Frame-oriented link to one peer.
pub trait Transport: Send + Sync {
    /// Install the upcall target for inbound frames. Called once by the
    /// endpoint before any traffic.
    fn bind(&self, receiver: Weak<dyn Receiver>);

    /// Obtain a buffer able to hold `payload_capacity` bytes after the
    /// header. Never blocks.
    fn alloc_tx(&self, payload_capacity: usize) -> Result<TxBuffer, TransportError>;

    /// Send one frame. Ownership of the buffer moves to the transport
    /// whether or not the send succeeds.
    fn send(&self, frame: TxBuffer) -> Result<(), TransportError>;

    fn is_up(&self) -> bool;
}

/// Inbound side of a transport, implemented by the endpoint.
pub trait Receiver: Send + Sync {
    fn on_receive(&self, frame: RxBuffer);

    /// A frame came off the wire but could not be delivered. `head` holds
    /// up to [`HEADER_SIZE`] leading bytes of it.
    fn on_dropped(&self, head: &[u8], error: TransportError);

    /// The link is gone; pending calls should fail.
    fn on_link_down(&self);
}
