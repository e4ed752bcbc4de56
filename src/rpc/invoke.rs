//! Client-side call bookkeeping.
//!
//! A link carries at most one outstanding call. The only exception is
//! nesting: the thread that owns the pending synchronous call keeps
//! dispatching commands that arrive while it waits, and handlers it runs may
//! issue further synchronous calls on the same link. Pending calls therefore
//! form a stack owned by a single thread.
//!
//! ```text
//!  thread T: call(A) ──▶ [A pending] ──▶ handler for peer's command
//!                                          └─▶ call(B) ──▶ [A, B pending]
//! ```
//!
//! Correlation ids are 16-bit and wrap. Zero is reserved for frames that
//! expect no reply; ids of timed-out calls are retired for a while so that a
//! late response can't be mistaken for the answer to a newer call.

use std::thread::ThreadId;
use std::time::Instant;

use heapless::{Deque, Vec};

use super::codec::Decoder;
use super::frame::{Header, NO_CORRELATION, PacketType};
use super::scratchpad::Scratchpad;
use super::transport::RxBuffer;
use crate::error::{CodecError, Error, ProtocolError, ResourceError, Status};

/// Hard limit on nested calls per link (`max_nesting` is clamped to it).
pub const MAX_NESTING: usize = 8;

/// Timed-out correlation ids held back from reuse.
pub const RETIRED_IDS: usize = 16;

/// Completion of an asynchronous call. Runs on the receive path; it must
/// not make synchronous calls on the same endpoint.
pub type Completion = Box<dyn FnOnce(Result<Reply, Error>) + Send>;

// ── Reply ─────────────────────────────────────────────────────

/// A received response: status first, results after.
pub struct Reply {
    header: Header,
    frame: RxBuffer,
    status: Status,
    /// Payload offset of the first result value.
    results: usize,
}

impl Reply {
    /// Interpret a response or error frame.
    pub(crate) fn from_frame(header: Header, mut frame: RxBuffer) -> Result<Self, Error> {
        let (status, results) = {
            let (mut dec, _) = frame.split();
            if header.packet == PacketType::Error {
                let code = dec.decode_u8().unwrap_or(0);
                return Err(ProtocolError::from_code(code, header.group, header.id).into());
            }
            let status = dec
                .decode_i32()
                .map_err(|_| Error::Protocol(ProtocolError::MalformedPayload))?;
            (Status(status), dec.position())
        };
        Ok(Self { header, frame, status, results })
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }

    pub fn header(&self) -> Header {
        self.header
    }

    /// Result values, positioned after the status.
    pub fn decoder(&mut self) -> Decoder<'_> {
        self.parts().0
    }

    /// Result decoder plus scratch space for values that need reshaping.
    pub fn parts(&mut self) -> (Decoder<'_>, Scratchpad<'_>) {
        self.frame.split_from(self.results)
    }

    /// Release the receive buffer early.
    pub fn release(self) {
        self.frame.release();
    }
}

impl core::fmt::Debug for Reply {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Reply")
            .field("header", &self.header)
            .field("status", &self.status)
            .field("len", &self.frame.len())
            .finish()
    }
}

/// Decode the results of an `OK` reply with `decode`; any other status is
/// handed to `decode` with an empty decoder.
pub(crate) fn decode_reply<T, D>(mut reply: Reply, decode: D) -> Result<T, Error>
where
    D: FnOnce(Status, &mut Decoder<'_>) -> Result<T, CodecError>,
{
    let status = reply.status();
    let mut dec = if status.is_ok() { reply.decoder() } else { Decoder::new(&[]) };
    Ok(decode(status, &mut dec)?)
}

// ── Pending calls ─────────────────────────────────────────────

pub(crate) enum Waiter {
    Sync { owner: ThreadId },
    Async { completion: Completion, deadline: Instant },
}

pub(crate) struct PendingCall {
    pub(crate) correlation: u16,
    pub(crate) group: u8,
    pub(crate) command: u8,
    pub(crate) waiter: Waiter,
    /// Filled by the receive path for synchronous waiters.
    pub(crate) reply: Option<Result<(Header, RxBuffer), Error>>,
}

/// An asynchronous call whose deadline passed.
pub(crate) struct Expired {
    pub(crate) correlation: u16,
    pub(crate) group: u8,
    pub(crate) command: u8,
    pub(crate) completion: Completion,
}

/// What the receive path should do with a reply frame.
pub(crate) enum Routed {
    /// Stored for a synchronous waiter; wake it.
    Stored,
    /// An asynchronous call completed; run this outside the lock.
    Complete(Completion, Header, RxBuffer),
    /// No pending call; `true` if the id was recently timed out.
    Unmatched { late: bool, frame: RxBuffer },
}

pub(crate) struct LinkState {
    pending: Vec<PendingCall, MAX_NESTING>,
    last_id: u16,
    retired: Deque<u16, RETIRED_IDS>,
    /// Thread running a handler for this link, and how deeply it nests.
    dispatcher: Option<(ThreadId, usize)>,
    /// Commands parked in the conversation for the blocked caller.
    parked: usize,
    /// Frames handed to the worker and not yet finished.
    queued: usize,
}

impl LinkState {
    pub(crate) const fn new() -> Self {
        Self {
            pending: Vec::new(),
            last_id: 0,
            retired: Deque::new(),
            dispatcher: None,
            parked: 0,
            queued: 0,
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub(crate) fn depth(&self) -> usize {
        self.pending.len()
    }

    /// A synchronous caller is blocked on this link and can take commands.
    pub(crate) fn has_sync_waiter(&self) -> bool {
        self.pending.iter().any(|c| matches!(c.waiter, Waiter::Sync { .. }))
    }

    fn sync_owner(&self) -> Option<ThreadId> {
        self.pending.iter().find_map(|c| match c.waiter {
            Waiter::Sync { owner } => Some(owner),
            Waiter::Async { .. } => None,
        })
    }

    /// Whether an inbound command should go to the blocked caller rather
    /// than the worker. Only if the caller can run it next without
    /// overtaking anything: it already holds dispatch (a nested handler is
    /// waiting), or dispatch is idle and the worker has nothing queued.
    pub(crate) fn runs_inline(&self) -> bool {
        let Some(owner) = self.sync_owner() else {
            return false;
        };
        match self.dispatcher {
            Some((thread, _)) => thread == owner,
            None => self.queued == 0,
        }
    }

    pub(crate) fn park(&mut self) {
        self.parked += 1;
    }

    pub(crate) fn enqueue(&mut self) {
        self.queued += 1;
    }

    /// Parked commands were moved to the worker or dropped.
    pub(crate) fn unpark_all(&mut self) {
        self.parked = 0;
    }

    /// Take dispatch for `me`; reentrant for the thread holding it. A
    /// parked command (`parked == true`) is taken off the parked count
    /// first. The worker is kept out while commands are parked, so the
    /// blocked caller runs those before anything queued later.
    pub(crate) fn enter_dispatch(&mut self, me: ThreadId, parked: bool) -> bool {
        if parked {
            self.parked = self.parked.saturating_sub(1);
        }
        if let Some((thread, depth)) = &mut self.dispatcher {
            if *thread != me {
                return false;
            }
            *depth += 1;
            return true;
        }
        if !parked && self.parked > 0 {
            return false;
        }
        self.dispatcher = Some((me, 1));
        true
    }

    /// Undo one [`enter_dispatch`](Self::enter_dispatch); `queued` marks a
    /// frame the worker took off its queue. Returns `true` once dispatch is
    /// free.
    pub(crate) fn leave_dispatch(&mut self, queued: bool) -> bool {
        if queued {
            self.queued = self.queued.saturating_sub(1);
        }
        if let Some((_, depth)) = &mut self.dispatcher {
            if *depth > 1 {
                *depth -= 1;
                return false;
            }
        }
        self.dispatcher = None;
        true
    }

    /// A queued frame was discarded without being dispatched.
    pub(crate) fn dequeue(&mut self) {
        self.queued = self.queued.saturating_sub(1);
    }

    /// Check the one-call rule for `me`.
    fn admit(&self, me: ThreadId, max_nesting: usize) -> Result<(), Error> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let owned = self
            .pending
            .iter()
            .all(|c| matches!(c.waiter, Waiter::Sync { owner } if owner == me));
        if !owned {
            return Err(Error::Busy);
        }
        if self.pending.len() >= max_nesting.min(MAX_NESTING) {
            return Err(ResourceError::NestingTooDeep.into());
        }
        Ok(())
    }

    fn next_id(&mut self) -> u16 {
        loop {
            self.last_id = self.last_id.wrapping_add(1);
            let id = self.last_id;
            if id == NO_CORRELATION
                || self.retired.iter().any(|&r| r == id)
                || self.pending.iter().any(|c| c.correlation == id)
            {
                continue;
            }
            return id;
        }
    }

    fn push(&mut self, group: u8, command: u8, waiter: Waiter) -> u16 {
        let correlation = self.next_id();
        // admit() bounded the depth, so this cannot fail.
        let _ = self.pending.push(PendingCall { correlation, group, command, waiter, reply: None });
        correlation
    }

    pub(crate) fn begin_sync(
        &mut self,
        me: ThreadId,
        max_nesting: usize,
        group: u8,
        command: u8,
    ) -> Result<u16, Error> {
        self.admit(me, max_nesting)?;
        Ok(self.push(group, command, Waiter::Sync { owner: me }))
    }

    /// Register an asynchronous call. Only allowed on an idle link.
    pub(crate) fn begin_async(
        &mut self,
        group: u8,
        command: u8,
        completion: Completion,
        deadline: Instant,
    ) -> Result<u16, (Error, Completion)> {
        if self.is_pending() {
            return Err((Error::Busy, completion));
        }
        Ok(self.push(group, command, Waiter::Async { completion, deadline }))
    }

    fn position(&self, correlation: u16) -> Option<usize> {
        self.pending.iter().position(|c| c.correlation == correlation)
    }

    /// Forget a call whose frame never left (send failure).
    pub(crate) fn abandon(&mut self, correlation: u16) -> Option<PendingCall> {
        let i = self.position(correlation)?;
        Some(self.pending.remove(i))
    }

    fn retire(&mut self, id: u16) {
        if self.retired.is_full() {
            self.retired.pop_front();
        }
        let _ = self.retired.push_back(id);
    }

    pub(crate) fn is_retired(&self, id: u16) -> bool {
        self.retired.iter().any(|&r| r == id)
    }

    /// Route a response or error frame to its pending call.
    pub(crate) fn route(&mut self, header: Header, frame: RxBuffer) -> Routed {
        let Some(i) = self.position(header.correlation) else {
            return Routed::Unmatched { late: self.is_retired(header.correlation), frame };
        };
        if matches!(self.pending[i].waiter, Waiter::Sync { .. }) {
            if self.pending[i].reply.is_some() {
                // A second reply for the same call: keep the first.
                return Routed::Unmatched { late: true, frame };
            }
            self.pending[i].reply = Some(Ok((header, frame)));
            return Routed::Stored;
        }
        match self.pending.remove(i).waiter {
            Waiter::Async { completion, .. } => Routed::Complete(completion, header, frame),
            Waiter::Sync { .. } => Routed::Stored,
        }
    }

    /// Take the reply of a synchronous call if it has arrived.
    pub(crate) fn take_reply(
        &mut self,
        correlation: u16,
    ) -> Option<Result<(Header, RxBuffer), Error>> {
        let i = self.position(correlation)?;
        self.pending[i].reply.as_ref()?;
        self.pending.remove(i).reply
    }

    /// Give up on a synchronous call. A reply that raced the deadline wins.
    pub(crate) fn time_out(&mut self, correlation: u16) -> Result<(Header, RxBuffer), Error> {
        let Some(i) = self.position(correlation) else {
            return Err(Error::Timeout);
        };
        let call = self.pending.remove(i);
        match call.reply {
            Some(r) => r,
            None => {
                self.retire(correlation);
                Err(Error::Timeout)
            }
        }
    }

    /// Remove asynchronous calls past their deadline, retiring their ids.
    pub(crate) fn expire(&mut self, now: Instant) -> Vec<Expired, MAX_NESTING> {
        let mut expired = Vec::new();
        let mut i = 0;
        while i < self.pending.len() {
            let due = matches!(self.pending[i].waiter, Waiter::Async { deadline, .. } if deadline <= now);
            if !due {
                i += 1;
                continue;
            }
            let call = self.pending.remove(i);
            self.retire(call.correlation);
            if let Waiter::Async { completion, .. } = call.waiter {
                let _ = expired.push(Expired {
                    correlation: call.correlation,
                    group: call.group,
                    command: call.command,
                    completion,
                });
            }
        }
        expired
    }

    /// Fail every pending call with `error`. Synchronous waiters find the
    /// error in their slot; asynchronous completions are returned.
    pub(crate) fn fail_all(&mut self, error: Error) -> Vec<Completion, MAX_NESTING> {
        let mut completions = Vec::new();
        let mut i = 0;
        while i < self.pending.len() {
            if matches!(self.pending[i].waiter, Waiter::Sync { .. }) {
                if self.pending[i].reply.is_none() {
                    self.pending[i].reply = Some(Err(error));
                }
                i += 1;
                continue;
            }
            if let Waiter::Async { completion, .. } = self.pending.remove(i).waiter {
                let _ = completions.push(completion);
            }
        }
        completions
    }
}
