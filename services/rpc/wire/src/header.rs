//! Fixed header carried in front of every frame.
//!
//! The header is small enough to be decoded before the metadata map, so a
//! reader can reject unsupported versions and unknown kinds early.

use bitflags::bitflags;
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::WireError;

/// Wire protocol version
pub const WIRE_VERSION: u8 = 1;

/// Fixed header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Message kinds understood by the dispatch layer
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Method invocation expecting a response
    Request = 0x00,
    /// Response to a previous request
    Response = 0x01,
    /// Invocation without a response
    OneWay = 0x02,
    /// Remote failure while handling a request
    Exception = 0x03,
}

impl TryFrom<u8> for MessageKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(MessageKind::Request),
            0x01 => Ok(MessageKind::Response),
            0x02 => Ok(MessageKind::OneWay),
            0x03 => Ok(MessageKind::Exception),
            _ => Err(WireError::Kind(value)),
        }
    }
}

bitflags! {
    /// Frame flags bitmask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Flags: u16 {
        /// `checksum` holds CRC-32 of meta ++ payload
        const CHECKSUM = 1 << 0;
    }
}

/// Decoded fixed header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol version
    pub version: u8,
    /// Message kind
    pub kind: MessageKind,
    /// Frame flags
    pub flags: Flags,
    /// CRC-32 of the body, zero unless [`Flags::CHECKSUM`] is set
    pub checksum: u32,
    /// Request correlation id
    pub request_id: u64,
}

impl FrameHeader {
    /// Create a header for the current wire version
    pub fn new(kind: MessageKind, request_id: u64) -> Self {
        Self {
            version: WIRE_VERSION,
            kind,
            flags: Flags::empty(),
            checksum: 0,
            request_id,
        }
    }

    /// Write the header into `buf`
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.version);
        buf.put_u8(self.kind as u8);
        buf.put_u16(self.flags.bits());
        buf.put_u32(self.checksum);
        buf.put_u64(self.request_id);
    }

    /// Read a header from `buf`, which must hold at least [`HEADER_SIZE`] bytes
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        if buf.remaining() < HEADER_SIZE {
            return Err(WireError::Malformed);
        }

        let version = buf.get_u8();
        if version != WIRE_VERSION {
            return Err(WireError::Version(version));
        }

        let kind = MessageKind::try_from(buf.get_u8())?;

        let raw_flags = buf.get_u16();
        let flags = Flags::from_bits(raw_flags)
            .ok_or(WireError::Reserved(raw_flags & !Flags::all().bits()))?;

        let checksum = buf.get_u32();
        let request_id = buf.get_u64();

        Ok(Self {
            version,
            kind,
            flags,
            checksum,
            request_id,
        })
    }
}
