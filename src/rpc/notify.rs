//! Asynchronous notifications (events).
//!
//! An event is a one-way frame from a service to whoever listens for it.
//! Listeners are keyed by `(group, version)`: an event whose version no
//! listener of its group expects is dropped, as is an event for a paused
//! listener. Both are counted so a caller can see that data was lost.

use core::cell::RefCell;
use std::sync::Arc;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use heapless::Vec;
use log::debug;

use super::codec::{CodecError, Decoder};
use crate::error::ResourceError;

/// Listener slots per endpoint.
pub const MAX_LISTENERS: usize = 8;

/// Decodes an event payload and hands the value to the application.
pub type ListenerFn = Arc<dyn Fn(&mut Decoder<'_>) -> Result<(), CodecError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Active,
    /// Events are dropped (and counted) until resumed.
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerStats {
    pub state: ListenerState,
    pub delivered: u32,
    /// Events dropped while paused.
    pub dropped: u32,
}

struct Listener {
    id: ListenerId,
    group: u8,
    version: u8,
    state: ListenerState,
    delivered: u32,
    dropped: u32,
    handler: ListenerFn,
}

/// Outcome of matching an event against the table.
pub(crate) enum Route {
    Deliver(ListenerFn),
    Paused,
    /// The group has listeners, none for this version.
    VersionMismatch,
    NoListener,
}

struct Slots {
    listeners: Vec<Listener, MAX_LISTENERS>,
    last_id: u16,
    unmatched: u32,
}

impl Slots {
    /// Next id, skipping zero and any still held by a listener. The table
    /// is never full here, so a free id exists.
    fn next_id(&mut self) -> ListenerId {
        loop {
            self.last_id = self.last_id.wrapping_add(1);
            let id = ListenerId(self.last_id);
            if self.last_id != 0 && self.listeners.iter().all(|l| l.id != id) {
                return id;
            }
        }
    }
}

pub struct ListenerTable {
    slots: Mutex<CriticalSectionRawMutex, RefCell<Slots>>,
}

impl ListenerTable {
    pub const fn new() -> Self {
        Self {
            slots: Mutex::new(RefCell::new(Slots { listeners: Vec::new(), last_id: 0, unmatched: 0 })),
        }
    }

    pub fn register(&self, group: u8, version: u8, handler: ListenerFn) -> Result<ListenerId, ResourceError> {
        self.slots.lock(|s| {
            let mut s = s.borrow_mut();
            if s.listeners.iter().any(|l| l.group == group && l.version == version) {
                return Err(ResourceError::ListenerExists);
            }
            if s.listeners.is_full() {
                return Err(ResourceError::ListenerTableFull);
            }
            let id = s.next_id();
            let listener = Listener {
                id,
                group,
                version,
                state: ListenerState::Active,
                delivered: 0,
                dropped: 0,
                handler,
            };
            s.listeners.push(listener).map_err(|_| ResourceError::ListenerTableFull)?;
            Ok(id)
        })
    }

    pub fn deregister(&self, id: ListenerId) -> Result<(), ResourceError> {
        self.slots.lock(|s| {
            let mut s = s.borrow_mut();
            let i = s
                .listeners
                .iter()
                .position(|l| l.id == id)
                .ok_or(ResourceError::ListenerNotFound)?;
            s.listeners.swap_remove(i);
            Ok(())
        })
    }

    pub fn pause(&self, id: ListenerId) -> Result<(), ResourceError> {
        self.set_state(id, ListenerState::Paused)
    }

    pub fn resume(&self, id: ListenerId) -> Result<(), ResourceError> {
        self.set_state(id, ListenerState::Active)
    }

    fn set_state(&self, id: ListenerId, state: ListenerState) -> Result<(), ResourceError> {
        self.slots.lock(|s| {
            let mut s = s.borrow_mut();
            let l = s
                .listeners
                .iter_mut()
                .find(|l| l.id == id)
                .ok_or(ResourceError::ListenerNotFound)?;
            l.state = state;
            Ok(())
        })
    }

    pub fn stats(&self, id: ListenerId) -> Option<ListenerStats> {
        self.slots.lock(|s| {
            s.borrow().listeners.iter().find(|l| l.id == id).map(|l| ListenerStats {
                state: l.state,
                delivered: l.delivered,
                dropped: l.dropped,
            })
        })
    }

    /// Events that matched no `(group, version)` listener.
    pub fn unmatched(&self) -> u32 {
        self.slots.lock(|s| s.borrow().unmatched)
    }

    pub fn len(&self) -> usize {
        self.slots.lock(|s| s.borrow().listeners.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Match an event and update counters. The handler, if any, is
    /// returned so it runs after the lock is released.
    pub(crate) fn route(&self, group: u8, version: u8) -> Route {
        self.slots.lock(|s| {
            let mut s = s.borrow_mut();
            let group_known = s.listeners.iter().any(|l| l.group == group);
            let Some(l) = s.listeners.iter_mut().find(|l| l.group == group && l.version == version) else {
                s.unmatched = s.unmatched.saturating_add(1);
                return if group_known { Route::VersionMismatch } else { Route::NoListener };
            };
            match l.state {
                ListenerState::Paused => {
                    l.dropped = l.dropped.saturating_add(1);
                    debug!("EVT: group {} v{} paused, dropped ({})", group, version, l.dropped);
                    Route::Paused
                }
                ListenerState::Active => {
                    l.delivered = l.delivered.saturating_add(1);
                    Route::Deliver(Arc::clone(&l.handler))
                }
            }
        })
    }
}

impl Default for ListenerTable {
    fn default() -> Self {
        Self::new()
    }
}
