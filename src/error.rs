//! Unified error types for the RPC core.
//!
//! Every fallible runtime operation funnels into [`Error`], whose variants
//! follow the failure classes a caller has to tell apart: the link itself
//! (transport), the wire (protocol / codec), bounded tables (resource), and
//! the strict one-call-per-link rule. All variants are `Copy` so they can be
//! handed to the error hook and to completions without allocation.
//!
//! Application-level failures are *not* errors here: a handler's outcome
//! travels back as a [`Status`] inside the reply.

use core::fmt;

use crate::rpc::frame::PacketType;

// ---------------------------------------------------------------------------
// Top-level RPC error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The link could not carry the frame (no buffer, link down, I/O).
    Transport(TransportError),
    /// The peer (or our own receive path) rejected a frame.
    Protocol(ProtocolError),
    /// A bounded table is full or an entry is missing.
    Resource(ResourceError),
    /// Encoding or decoding a value failed.
    Codec(CodecError),
    /// Group/command table misuse detected while building the registry.
    Registry(RegistryError),
    /// No correlated response arrived before the deadline.
    Timeout,
    /// Another call is already outstanding on this link.
    Busy,
    /// The endpoint was shut down or never started.
    NotRunning,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport: {e}"),
            Self::Protocol(e) => write!(f, "protocol: {e}"),
            Self::Resource(e) => write!(f, "resource: {e}"),
            Self::Codec(e) => write!(f, "codec: {e}"),
            Self::Registry(e) => write!(f, "registry: {e}"),
            Self::Timeout => write!(f, "timed out waiting for response"),
            Self::Busy => write!(f, "a call is already pending on this link"),
            Self::NotRunning => write!(f, "endpoint is not running"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Transport errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// The shared buffer pool has no free buffer.
    NoBuffer,
    /// Header plus requested payload exceeds the maximum frame size.
    FrameTooLarge,
    /// The peer is unreachable.
    LinkDown,
    /// The delivery queue towards the peer is full.
    QueueFull,
    /// The underlying byte channel reported a write/read failure.
    Io,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoBuffer => write!(f, "no transmit buffer available"),
            Self::FrameTooLarge => write!(f, "frame exceeds maximum size"),
            Self::LinkDown => write!(f, "link down"),
            Self::QueueFull => write!(f, "delivery queue full"),
            Self::Io => write!(f, "byte channel I/O failure"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

// ---------------------------------------------------------------------------
// Protocol errors
// ---------------------------------------------------------------------------

/// Frame-level failures. The wire codes are carried in `Error` packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame shorter than the header or with an unknown packet type.
    MalformedHeader,
    /// No handler registered for `(group, command)`.
    UnknownCommand { group: u8, command: u8 },
    /// Payload could not be decoded by the receiving side.
    MalformedPayload,
    /// The receiver had no room to queue the frame.
    NoResources,
    /// A response or error frame that no pending call was waiting for.
    Uncorrelated,
    /// The receiving endpoint has been shut down.
    Stopped,
}

impl ProtocolError {
    /// Wire code sent in the payload of an `Error` packet.
    pub const fn code(self) -> u8 {
        match self {
            Self::MalformedHeader => 1,
            Self::UnknownCommand { .. } => 2,
            Self::MalformedPayload => 3,
            Self::NoResources => 4,
            Self::Uncorrelated => 5,
            Self::Stopped => 6,
        }
    }

    /// Rebuild a protocol error from a wire code and the header it came with.
    pub const fn from_code(code: u8, group: u8, command: u8) -> Self {
        match code {
            1 => Self::MalformedHeader,
            2 => Self::UnknownCommand { group, command },
            4 => Self::NoResources,
            5 => Self::Uncorrelated,
            6 => Self::Stopped,
            _ => Self::MalformedPayload,
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedHeader => write!(f, "malformed frame header"),
            Self::UnknownCommand { group, command } => {
                write!(f, "unknown command {command} in group {group}")
            }
            Self::MalformedPayload => write!(f, "malformed payload"),
            Self::NoResources => write!(f, "receiver out of resources"),
            Self::Uncorrelated => write!(f, "frame matches no pending call"),
            Self::Stopped => write!(f, "receiver stopped"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

// ---------------------------------------------------------------------------
// Resource-exhaustion errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceError {
    CallbackTableFull,
    ListenerTableFull,
    /// A listener for the same `(group, version)` is already registered.
    ListenerExists,
    ListenerNotFound,
    /// Nested calls exceeded the configured depth.
    NestingTooDeep,
    /// The worker queue could not accept another frame.
    QueueFull,
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CallbackTableFull => write!(f, "callback table full"),
            Self::ListenerTableFull => write!(f, "listener table full"),
            Self::ListenerExists => write!(f, "listener already registered"),
            Self::ListenerNotFound => write!(f, "listener not registered"),
            Self::NestingTooDeep => write!(f, "nested call depth exceeded"),
            Self::QueueFull => write!(f, "worker queue full"),
        }
    }
}

impl std::error::Error for ResourceError {}

impl From<ResourceError> for Error {
    fn from(e: ResourceError) -> Self {
        Self::Resource(e)
    }
}

// ---------------------------------------------------------------------------
// Codec errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// Encoding would run past the end of the buffer.
    BufferFull,
    /// Input ended before the value was complete.
    Truncated,
    /// Input bytes do not form a valid value.
    Malformed,
    /// String bytes are not UTF-8.
    InvalidUtf8,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferFull => write!(f, "encode buffer full"),
            Self::Truncated => write!(f, "input truncated"),
            Self::Malformed => write!(f, "malformed input"),
            Self::InvalidUtf8 => write!(f, "invalid UTF-8"),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

// ---------------------------------------------------------------------------
// Registry errors
// ---------------------------------------------------------------------------

/// Programming errors caught while the static tables are assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    DuplicateGroup(u8),
    DuplicateCommand { group: u8, command: u8 },
    /// The group id is reserved for the built-in callback group.
    ReservedGroup(u8),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateGroup(id) => write!(f, "group {id} registered twice"),
            Self::DuplicateCommand { group, command } => {
                write!(f, "command {command} registered twice in group {group}")
            }
            Self::ReservedGroup(id) => write!(f, "group {id} is reserved"),
        }
    }
}

impl From<RegistryError> for Error {
    fn from(e: RegistryError) -> Self {
        Self::Registry(e)
    }
}

impl std::error::Error for RegistryError {}

// ---------------------------------------------------------------------------
// Application status
// ---------------------------------------------------------------------------

/// First value of every response payload. Zero is success; negative values
/// follow errno numbering so both sides agree without a shared enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub i32);

impl Status {
    pub const OK: Self = Self(0);
    pub const NO_ENTRY: Self = Self(-2);
    pub const NO_MEMORY: Self = Self(-12);
    pub const INVALID_ARGS: Self = Self(-22);
    pub const BAD_MESSAGE: Self = Self(-74);
    pub const NO_BUFFERS: Self = Self(-105);

    pub const fn is_ok(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::OK => write!(f, "ok"),
            Self::NO_ENTRY => write!(f, "no such entry"),
            Self::NO_MEMORY => write!(f, "out of memory"),
            Self::INVALID_ARGS => write!(f, "invalid arguments"),
            Self::BAD_MESSAGE => write!(f, "bad message"),
            Self::NO_BUFFERS => write!(f, "no buffer space"),
            Self(code) => write!(f, "status {code}"),
        }
    }
}

/// Argument decode failures inside a handler become `BAD_MESSAGE`, so
/// handlers can use `?` on the decoder and still answer the caller.
impl From<CodecError> for Status {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::BufferFull => Self::NO_BUFFERS,
            CodecError::Truncated | CodecError::Malformed | CodecError::InvalidUtf8 => {
                Self::BAD_MESSAGE
            }
        }
    }
}

impl From<Error> for Status {
    fn from(e: Error) -> Self {
        match e {
            Error::Codec(c) => c.into(),
            Error::Transport(TransportError::NoBuffer) => Self::NO_BUFFERS,
            Error::Resource(_) => Self::NO_MEMORY,
            _ => Self::INVALID_ARGS,
        }
    }
}

// ---------------------------------------------------------------------------
// Error reports
// ---------------------------------------------------------------------------

/// Where on the link the failure was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    Send,
    Receive,
    /// The transport dropped an inbound frame before it reached the endpoint.
    Transport,
}

/// A failure that could not be returned to a caller directly: unknown
/// commands, garbage frames, late responses, send failures on the receive
/// path. Delivered to the endpoint's error hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorReport {
    pub source: ErrorSource,
    pub group: u8,
    pub id: u8,
    pub packet: Option<PacketType>,
    pub error: Error,
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} group={} id={} packet={:?}: {}",
            self.source, self.group, self.id, self.packet, self.error
        )
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
