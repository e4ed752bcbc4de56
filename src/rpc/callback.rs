//! Callback proxies.
//!
//! A function pointer can't cross to the peer, so it is replaced by a slot
//! index in a fixed table on the side that owns the function. The peer keeps
//! the index as an opaque [`CallbackHandle`] and later sends it back through
//! the built-in callback group to have the function run here with its
//! context word.
//!
//! Registration is idempotent: the same `(function, context)` pair always
//! maps to the same handle, so repeated registration of one callback does
//! not consume slots.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::codec::{Decoder, Encoder};
use super::dispatch::Request;
use super::registry::{CALLBACK_GROUP, Group};
use crate::error::{ResourceError, Status};

/// Slots in each endpoint's callback table.
pub const CALLBACK_SLOTS: usize = 10;

/// Command id of the proxy invocation inside [`CALLBACK_GROUP`].
pub const INVOKE_CALLBACK: u8 = 0;

/// A proxied function: decodes its arguments, encodes its results.
pub type CallbackFn = fn(usize, &mut Decoder<'_>, &mut Encoder<'_>) -> Result<(), Status>;

/// Opaque handle the peer stores in place of a function pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallbackHandle(pub u32);

#[derive(Clone, Copy)]
struct Slot {
    f: CallbackFn,
    ctx: usize,
}

impl Slot {
    fn matches(&self, f: CallbackFn, ctx: usize) -> bool {
        core::ptr::fn_addr_eq(self.f, f) && self.ctx == ctx
    }
}

/// Fixed-capacity table of proxied callbacks.
pub struct CallbackTable<const N: usize> {
    slots: Mutex<CriticalSectionRawMutex, RefCell<[Option<Slot>; N]>>,
}

impl<const N: usize> CallbackTable<N> {
    pub const fn new() -> Self {
        Self { slots: Mutex::new(RefCell::new([None; N])) }
    }

    /// Store `(f, ctx)` and return its handle. A pair already present
    /// returns its existing handle; a full table is left unchanged.
    pub fn register(&self, f: CallbackFn, ctx: usize) -> Result<CallbackHandle, ResourceError> {
        self.slots.lock(|slots| {
            let mut slots = slots.borrow_mut();
            let mut free = None;
            for (i, slot) in slots.iter().enumerate() {
                match slot {
                    Some(s) if s.matches(f, ctx) => return Ok(CallbackHandle(i as u32)),
                    None if free.is_none() => free = Some(i),
                    _ => {}
                }
            }
            let Some(i) = free else {
                warn!("CB: table full ({} slots)", N);
                return Err(ResourceError::CallbackTableFull);
            };
            slots[i] = Some(Slot { f, ctx });
            Ok(CallbackHandle(i as u32))
        })
    }

    /// Free a slot. Returns `false` if it was not in use.
    pub fn deregister(&self, handle: CallbackHandle) -> bool {
        self.slots.lock(|slots| {
            let mut slots = slots.borrow_mut();
            slots
                .get_mut(handle.0 as usize)
                .and_then(Option::take)
                .is_some()
        })
    }

    pub fn lookup(&self, handle: CallbackHandle) -> Option<(CallbackFn, usize)> {
        self.slots.lock(|slots| {
            slots
                .borrow()
                .get(handle.0 as usize)
                .copied()
                .flatten()
                .map(|s| (s.f, s.ctx))
        })
    }

    pub fn occupancy(&self) -> usize {
        self.slots.lock(|slots| slots.borrow().iter().filter(|s| s.is_some()).count())
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<const N: usize> Default for CallbackTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// The reserved group every endpoint serves: look up the handle in the
/// local table and run the function, replying with what it encodes.
pub(crate) fn callback_group() -> Group {
    Group::new(CALLBACK_GROUP, "callback").command(INVOKE_CALLBACK, |req: &mut Request<'_>| {
        let handle = CallbackHandle(req.args().decode_u32()?);
        let endpoint = req.endpoint().clone();
        let Some((f, ctx)) = endpoint.callbacks().lookup(handle) else {
            warn!("CB: unknown handle {}", handle.0);
            return Err(Status::NO_ENTRY);
        };
        debug!("CB: invoking handle {}", handle.0);
        let capacity = usize::from(endpoint.config().callback_reply_capacity);
        req.respond_with(capacity, |args, out| f(ctx, args, out))
    })
}
