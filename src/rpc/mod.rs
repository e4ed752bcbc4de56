//! Transport-agnostic RPC subsystem.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          RPC Stack                           │
//! │                                                              │
//! │  ┌───────────┐   ┌──────────┐   ┌──────────────────────────┐ │
//! │  │ Transport │──▶│ Endpoint │──▶│ Dispatcher → handlers    │ │
//! │  │ (trait)   │   │ (routing)│   │ (registry, listeners)    │ │
//! │  └───────────┘   └──────────┘   └──────────────────────────┘ │
//! │       ▲               │                      │               │
//! │       │               ▼                      ▼               │
//! │  ┌───────────┐   ┌──────────┐   ┌──────────────────────────┐ │
//! │  │ Transport │◀──│ Invoker  │◀──│ nested calls, callbacks  │ │
//! │  │ (send)    │   │ (calls)  │   │                          │ │
//! │  └───────────┘   └──────────┘   └──────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Payloads use the cursor codec in [`codec`]; frames carry the 5-byte
//! header from [`frame`].

pub mod callback;
pub mod channels;
pub mod codec;
pub mod dispatch;
pub mod endpoint;
pub mod frame;
pub mod invoke;
pub mod loopback;
pub mod notify;
pub mod registry;
pub mod scratchpad;
pub mod stream;
pub mod transport;

pub use callback::{CALLBACK_SLOTS, CallbackFn, CallbackHandle, CallbackTable, INVOKE_CALLBACK};
pub use codec::{Decoder, Encoder};
pub use dispatch::Request;
pub use endpoint::{Endpoint, EndpointBuilder};
pub use frame::{HEADER_SIZE, Header, PacketType};
pub use invoke::Reply;
pub use loopback::LoopbackTransport;
pub use notify::{ListenerId, ListenerState, ListenerStats};
pub use registry::{CALLBACK_GROUP, Group, Registry, RegistryBuilder};
pub use scratchpad::{SCRATCHPAD_ALIGN, Scratchpad, ScratchpadError};
pub use stream::{ByteChannel, NullChannel, StreamTransport};
pub use transport::{BufferPool, MAX_FRAME_SIZE, Receiver, RxBuffer, Transport, TxBuffer};
