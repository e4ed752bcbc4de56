//! Frame header.
//!
//! ```text
//! ┌──────────┬───────┬──────┬──────────────────┬─────────────┐
//! │ type (1) │ group │ id   │ correlation (2)  │ payload ... │
//! │          │ (1)   │ (1)  │ LE u16           │             │
//! └──────────┴───────┴──────┴──────────────────┴─────────────┘
//! ```
//!
//! `id` is the command id for commands, responses and errors, and the
//! listener version for events. Correlation `0` is never allocated to a
//! two-way call; one-way commands and events carry it.

use crate::error::ProtocolError;

pub const HEADER_SIZE: usize = 5;

/// Correlation id used by frames that expect no reply.
pub const NO_CORRELATION: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Command = 0,
    Response = 1,
    Event = 2,
    Error = 3,
}

impl PacketType {
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Command),
            1 => Some(Self::Response),
            2 => Some(Self::Event),
            3 => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub packet: PacketType,
    pub group: u8,
    pub id: u8,
    pub correlation: u16,
}

impl Header {
    pub const fn new(packet: PacketType, group: u8, id: u8, correlation: u16) -> Self {
        Self { packet, group, id, correlation }
    }

    pub fn write(&self, out: &mut [u8; HEADER_SIZE]) {
        out[0] = self.packet as u8;
        out[1] = self.group;
        out[2] = self.id;
        out[3..5].copy_from_slice(&self.correlation.to_le_bytes());
    }

    /// Parse the header at the start of `frame`.
    pub fn parse(frame: &[u8]) -> Result<Self, ProtocolError> {
        let Some(raw) = frame.first_chunk::<HEADER_SIZE>() else {
            return Err(ProtocolError::MalformedHeader);
        };
        let packet = PacketType::from_u8(raw[0]).ok_or(ProtocolError::MalformedHeader)?;
        Ok(Self {
            packet,
            group: raw[1],
            id: raw[2],
            correlation: u16::from_le_bytes([raw[3], raw[4]]),
        })
    }

    /// Whether a reply to this frame is expected.
    pub fn expects_reply(&self) -> bool {
        self.packet == PacketType::Command && self.correlation != NO_CORRELATION
    }

    /// Header of the reply frame to this command.
    pub fn reply(&self, packet: PacketType) -> Self {
        Self::new(packet, self.group, self.id, self.correlation)
    }
}
