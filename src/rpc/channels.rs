//! Per-endpoint queues between the receive path and dispatch contexts.
//!
//! Uses `embassy-sync` bounded MPMC channels. The transport's receive
//! context only routes; frames are processed either by the endpoint worker
//! or by the thread currently blocked in a synchronous call on the link.
//!
//! ```text
//!                        ┌──────────────┐  WorkItem   ┌──────────────┐
//!  transport ──▶ route ─▶│  work queue  │────────────▶│ worker thread│
//!                  │     └──────────────┘             └──────────────┘
//!                  │     ┌──────────────┐  Inbound    ┌──────────────┐
//!                  └────▶│ conversation │────────────▶│ blocked call │
//!                        └──────────────┘             └──────────────┘
//! ```

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;

use super::transport::RxBuffer;

/// Channel depth for the worker queue (commands and events).
pub const WORK_DEPTH: usize = 16;

/// Channel depth for the conversation of a blocked caller.
pub const CONVERSATION_DEPTH: usize = 8;

/// Item for the endpoint worker.
pub(crate) enum WorkItem {
    Frame(RxBuffer),
    Shutdown,
}

/// Item for the thread blocked in a synchronous call.
pub(crate) enum Inbound {
    /// A reply was stored in a pending slot; re-check.
    Wake,
    /// A command from the peer, to be dispatched by the waiting thread.
    Command(RxBuffer),
}

pub(crate) type WorkQueue = Channel<CriticalSectionRawMutex, WorkItem, WORK_DEPTH>;

pub(crate) type Conversation = Channel<CriticalSectionRawMutex, Inbound, CONVERSATION_DEPTH>;

/// Token posted whenever dispatch on the link becomes free; the worker
/// waits on it before running a queued frame.
pub(crate) type DispatchGate = Channel<CriticalSectionRawMutex, (), 1>;
