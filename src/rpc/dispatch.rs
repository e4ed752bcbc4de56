//! Server role: run handlers for inbound commands and events.
//!
//! Reply rules for a two-way command:
//! - the handler called [`Request::respond`] → that response is sent
//! - the handler returned `Ok(())` without responding → status-only `OK`
//! - the handler returned `Err(status)` → status-only response with it
//!
//! One-way commands (declared so, or sent without a correlation id) never
//! produce a frame. Unknown commands are answered with an `Error` frame when
//! the sender is waiting for one. The response always leaves before the
//! receive buffer is released.

use log::{debug, warn};

use super::codec::{CodecError, Decoder, Encoder};
use super::endpoint::Endpoint;
use super::frame::{Header, PacketType};
use super::notify::Route;
use super::scratchpad::Scratchpad;
use super::transport::{RxBuffer, TxBuffer};
use crate::error::{Error, ErrorSource, ProtocolError, Status};

/// Worst-case encoded size of a status value (zig-zag varint i32).
pub const STATUS_CAPACITY: usize = 5;

/// A command being handled: its arguments, scratch space, and the means
/// to respond or to call back into the peer.
pub struct Request<'a> {
    header: Header,
    args: Decoder<'a>,
    scratch: Scratchpad<'a>,
    endpoint: Endpoint,
    response: Option<TxBuffer>,
    replies: bool,
}

impl<'a> Request<'a> {
    pub fn group(&self) -> u8 {
        self.header.group
    }

    pub fn command(&self) -> u8 {
        self.header.id
    }

    pub fn correlation(&self) -> u16 {
        self.header.correlation
    }

    /// Whether the caller is waiting for a response.
    pub fn expects_response(&self) -> bool {
        self.replies
    }

    pub fn args(&mut self) -> &mut Decoder<'a> {
        &mut self.args
    }

    pub fn scratchpad(&mut self) -> &mut Scratchpad<'a> {
        &mut self.scratch
    }

    pub fn parts(&mut self) -> (&mut Decoder<'a>, &mut Scratchpad<'a>) {
        (&mut self.args, &mut self.scratch)
    }

    /// The local endpoint; handlers use it for nested calls.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Build the response: status `OK` followed by what `encode` writes into
    /// `estimate` bytes. A later call replaces an earlier one.
    pub fn respond<F>(&mut self, estimate: usize, encode: F) -> Result<(), Status>
    where
        F: FnOnce(&mut Encoder<'_>) -> Result<(), CodecError>,
    {
        self.respond_with(estimate, |_, out| Ok(encode(out)?))
    }

    /// Like [`respond`](Self::respond), with the remaining arguments at
    /// hand while encoding.
    pub fn respond_with<F>(&mut self, estimate: usize, encode: F) -> Result<(), Status>
    where
        F: FnOnce(&mut Decoder<'a>, &mut Encoder<'_>) -> Result<(), Status>,
    {
        if !self.replies {
            debug!("RPC: response to one-way command {}/{} ignored", self.header.group, self.header.id);
            return Ok(());
        }
        let mut tx = self
            .endpoint
            .alloc_tx(self.header.reply(PacketType::Response), STATUS_CAPACITY + estimate)
            .map_err(Status::from)?;
        let args = &mut self.args;
        tx.write_payload(|out| {
            out.encode_i32(Status::OK.0)?;
            encode(args, out)
        })?;
        self.response = Some(tx);
        Ok(())
    }
}

/// Process one frame taken off the worker queue or a conversation.
pub(crate) fn dispatch(endpoint: &Endpoint, frame: RxBuffer) {
    let header = match frame.header() {
        Ok(h) => h,
        Err(e) => {
            endpoint.report_malformed(&frame, e);
            return;
        }
    };
    match header.packet {
        PacketType::Command => dispatch_command(endpoint, header, frame),
        PacketType::Event => dispatch_event(endpoint, header, frame),
        PacketType::Response | PacketType::Error => endpoint.route_reply(header, frame),
    }
}

fn dispatch_command(endpoint: &Endpoint, header: Header, mut frame: RxBuffer) {
    let Some(command) = endpoint.registry().lookup(header.group, header.id) else {
        let err = ProtocolError::UnknownCommand { group: header.group, command: header.id };
        endpoint.report(ErrorSource::Receive, header.group, header.id, Some(header.packet), err.into());
        if header.expects_reply() {
            endpoint.send_error(header, err);
        }
        return;
    };
    let replies = header.expects_reply() && !command.is_one_way();
    debug!(
        "RPC[{}]: command {}/{} corr={}",
        endpoint.name(),
        header.group,
        header.id,
        header.correlation
    );

    let (outcome, response) = {
        let (args, scratch) = frame.split();
        let mut req = Request {
            header,
            args,
            scratch,
            endpoint: endpoint.clone(),
            response: None,
            replies,
        };
        let outcome = command.run(&mut req);
        (outcome, req.response.take())
    };

    if !replies {
        if let Err(status) = outcome {
            warn!("RPC[{}]: one-way {}/{} failed: {}", endpoint.name(), header.group, header.id, status);
        }
        return;
    }
    match (outcome, response) {
        (Ok(()), Some(tx)) => {
            let _ = endpoint.send(tx, header.group, header.id, PacketType::Response);
        }
        (Ok(()), None) => endpoint.send_status(header, Status::OK),
        (Err(status), _) => {
            debug!("RPC[{}]: {}/{} -> {}", endpoint.name(), header.group, header.id, status);
            endpoint.send_status(header, status);
        }
    }
    frame.release();
}

fn dispatch_event(endpoint: &Endpoint, header: Header, mut frame: RxBuffer) {
    let version = header.id;
    match endpoint.listeners().route(header.group, version) {
        Route::Deliver(handler) => {
            let (mut payload, _) = frame.split();
            if let Err(e) = handler(&mut payload) {
                endpoint.report(ErrorSource::Receive, header.group, version, Some(header.packet), Error::Codec(e));
            }
        }
        Route::Paused => {}
        Route::VersionMismatch => {
            warn!("EVT[{}]: group {} has no listener for version {}", endpoint.name(), header.group, version);
        }
        Route::NoListener => {
            debug!("EVT[{}]: no listener for group {}", endpoint.name(), header.group);
        }
    }
}
