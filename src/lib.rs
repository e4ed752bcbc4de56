//! rpclink: cross-processor RPC core.
//!
//! Two endpoints that share no memory call each other's registered
//! commands over a frame transport. Exposes the codec, the transport
//! abstraction with loopback and byte-stream implementations, the
//! group/command registry, correlated calls, callback proxies and events.

#![deny(unused_must_use)]

pub mod config;
pub mod error;
pub mod rpc;

pub use config::EndpointConfig;
pub use error::{Error, ErrorReport, ErrorSource, Result, Status};
