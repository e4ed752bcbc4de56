//! In-process transport pair.
//!
//! Two ends share one [`BufferPool`] and a link flag. A frame sent on one end
//! is moved, lease and all, into the other end's inbox; a delivery thread per
//! end drains the inbox and upcalls the bound receiver, one frame at a time,
//! in send order.
//!
//! ```text
//!  end A                                         end B
//!  send ──▶ inbox(B) ──▶ [delivery B] ──▶ receiver B
//!  receiver A ◀── [delivery A] ◀── inbox(A) ◀── send
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use log::{debug, warn};

use super::transport::{BufferPool, Receiver, RxBuffer, Transport, TxBuffer};
use crate::error::TransportError;

/// Frames queued towards one end before `send` reports `QueueFull`.
pub const INBOX_DEPTH: usize = 16;

enum Delivery {
    Frame(RxBuffer),
    LinkDown,
    Stop,
}

type Inbox = Channel<CriticalSectionRawMutex, Delivery, INBOX_DEPTH>;

struct Link {
    up: AtomicBool,
    pool: Arc<BufferPool>,
}

/// One end of an in-process link.
pub struct LoopbackTransport {
    name: &'static str,
    link: Arc<Link>,
    inbox: Arc<Inbox>,
    peer_inbox: Arc<Inbox>,
    bound: AtomicBool,
}

impl LoopbackTransport {
    /// Create both ends of a link over `pool`.
    pub fn pair(pool: Arc<BufferPool>) -> (Self, Self) {
        let link = Arc::new(Link { up: AtomicBool::new(true), pool });
        let a_inbox = Arc::new(Inbox::new());
        let b_inbox = Arc::new(Inbox::new());
        let a = Self {
            name: "loop-a",
            link: Arc::clone(&link),
            inbox: Arc::clone(&a_inbox),
            peer_inbox: Arc::clone(&b_inbox),
            bound: AtomicBool::new(false),
        };
        let b = Self {
            name: "loop-b",
            link,
            inbox: b_inbox,
            peer_inbox: a_inbox,
            bound: AtomicBool::new(false),
        };
        (a, b)
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.link.pool
    }

    /// Bring the link up or down for both ends. Going down notifies both
    /// receivers after the frames already queued to them.
    pub fn set_link_up(&self, up: bool) {
        let was_up = self.link.up.swap(up, Ordering::AcqRel);
        if was_up && !up {
            warn!("LOOP[{}]: link down", self.name);
            for inbox in [&self.inbox, &self.peer_inbox] {
                if inbox.try_send(Delivery::LinkDown).is_err() {
                    warn!("LOOP[{}]: inbox full, link-down notice lost", self.name);
                }
            }
        }
    }

    /// Deliver raw bytes to this end's receiver as if they came off the
    /// wire. Frames need not be well formed.
    pub fn inject(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let lease = self.link.pool.try_lease().ok_or(TransportError::NoBuffer)?;
        let frame = RxBuffer::from_slice(bytes, Some(lease))?;
        self.inbox
            .try_send(Delivery::Frame(frame))
            .map_err(|_| TransportError::QueueFull)
    }
}

impl Transport for LoopbackTransport {
    fn bind(&self, receiver: Weak<dyn Receiver>) {
        if self.bound.swap(true, Ordering::AcqRel) {
            warn!("LOOP[{}]: already bound", self.name);
            return;
        }
        let inbox = Arc::clone(&self.inbox);
        let name = self.name;
        let spawned = std::thread::Builder::new()
            .name(format!("{name}-rx"))
            .spawn(move || deliver(name, &inbox, &receiver));
        if let Err(e) = spawned {
            warn!("LOOP[{}]: delivery thread failed to start: {}", name, e);
        }
    }

    fn alloc_tx(&self, payload_capacity: usize) -> Result<TxBuffer, TransportError> {
        if !self.is_up() {
            return Err(TransportError::LinkDown);
        }
        let lease = self.link.pool.try_lease().ok_or(TransportError::NoBuffer)?;
        TxBuffer::new(payload_capacity, Some(lease))
    }

    fn send(&self, frame: TxBuffer) -> Result<(), TransportError> {
        if !self.is_up() {
            return Err(TransportError::LinkDown);
        }
        self.peer_inbox
            .try_send(Delivery::Frame(frame.into_rx()))
            .map_err(|_| TransportError::QueueFull)
    }

    fn is_up(&self) -> bool {
        self.link.up.load(Ordering::Acquire)
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        // The delivery thread is detached; it exits once it sees this.
        if self.bound.load(Ordering::Acquire) && self.inbox.try_send(Delivery::Stop).is_err() {
            warn!("LOOP[{}]: inbox full at shutdown", self.name);
        }
    }
}

fn deliver(name: &str, inbox: &Inbox, receiver: &Weak<dyn Receiver>) {
    loop {
        match futures_lite::future::block_on(inbox.receive()) {
            Delivery::Frame(frame) => match receiver.upgrade() {
                Some(r) => r.on_receive(frame),
                None => debug!("LOOP[{}]: receiver gone, frame dropped", name),
            },
            Delivery::LinkDown => {
                if let Some(r) = receiver.upgrade() {
                    r.on_link_down();
                }
            }
            Delivery::Stop => break,
        }
    }
    debug!("LOOP[{}]: delivery thread stopped", name);
}
