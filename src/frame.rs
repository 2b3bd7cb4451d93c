//! Wire framing.
//!
//! Every frame starts with a fixed 12-byte header:
//!
//! ```text
//! offset size  field
//! 0      1     version (always 0)
//! 1      1     type
//! 2      2     flags      (big-endian)
//! 4      4     stream id  (big-endian; ping id slot is unused and zero)
//! 8      4     length     (big-endian)
//! ```
//!
//! The meaning of `length` depends on the type: the number of body bytes that
//! follow for [`FrameType::Data`], a window credit delta for
//! [`FrameType::WindowUpdate`], an opaque ping id for [`FrameType::Ping`],
//! and a [`GoAwayCode`] for [`FrameType::GoAway`]. Only Data frames carry a
//! body.

use crate::error::Error;

/// Size of the fixed frame header in bytes.
pub const HEADER_SIZE: usize = 12;

/// The only protocol version in existence.
pub const PROTO_VERSION: u8 = 0;

/// Frame type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Stream payload bytes.
    Data = 0,
    /// Flow-control credit for a stream.
    WindowUpdate = 1,
    /// Liveness probe or its acknowledgement.
    Ping = 2,
    /// Advisory or fatal session teardown.
    GoAway = 3,
}

impl TryFrom<u8> for FrameType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        match value {
            0 => Ok(FrameType::Data),
            1 => Ok(FrameType::WindowUpdate),
            2 => Ok(FrameType::Ping),
            3 => Ok(FrameType::GoAway),
            other => Err(Error::InvalidMsgType(other)),
        }
    }
}

/// Per-frame flag bits. Flags may be combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(pub u16);

impl Flags {
    /// Start of a new stream.
    pub const SYN: Flags = Flags(0x1);
    /// Acknowledges a SYN.
    pub const ACK: Flags = Flags(0x2);
    /// Orderly half-close of the sender's direction.
    pub const FIN: Flags = Flags(0x4);
    /// Abortive close of the whole stream.
    pub const RST: Flags = Flags(0x8);

    /// No flags set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// All bits of `other` are set in `self`.
    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

/// Reason code carried in the `length` field of a go-away frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum GoAwayCode {
    /// Graceful: the sender will not open or accept new streams.
    Normal = 0,
    /// The sender observed a protocol violation.
    ProtocolError = 1,
    /// The sender hit an internal failure.
    InternalError = 2,
}

impl TryFrom<u32> for GoAwayCode {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Error> {
        match value {
            0 => Ok(GoAwayCode::Normal),
            1 => Ok(GoAwayCode::ProtocolError),
            2 => Ok(GoAwayCode::InternalError),
            other => Err(Error::InvalidGoAwayCode(other)),
        }
    }
}

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    typ: FrameType,
    flags: Flags,
    stream_id: u32,
    length: u32,
}

impl Header {
    pub fn new(typ: FrameType, flags: Flags, stream_id: u32, length: u32) -> Self {
        Header {
            typ,
            flags,
            stream_id,
            length,
        }
    }

    /// Header for a data frame carrying `length` body bytes.
    pub fn data(flags: Flags, stream_id: u32, length: u32) -> Self {
        Header::new(FrameType::Data, flags, stream_id, length)
    }

    /// Header granting `delta` bytes of send credit on a stream.
    pub fn window_update(flags: Flags, stream_id: u32, delta: u32) -> Self {
        Header::new(FrameType::WindowUpdate, flags, stream_id, delta)
    }

    /// Ping probe (`Flags::SYN`) or response (`Flags::ACK`).
    pub fn ping(flags: Flags, ping_id: u32) -> Self {
        Header::new(FrameType::Ping, flags, 0, ping_id)
    }

    pub fn go_away(code: GoAwayCode) -> Self {
        Header::new(FrameType::GoAway, Flags::default(), 0, code as u32)
    }

    pub fn frame_type(&self) -> FrameType {
        self.typ
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    /// Serialize into the wire layout.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = PROTO_VERSION;
        buf[1] = self.typ as u8;
        buf[2..4].copy_from_slice(&self.flags.0.to_be_bytes());
        buf[4..8].copy_from_slice(&self.stream_id.to_be_bytes());
        buf[8..12].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    /// Parse a header, rejecting unknown versions and message types.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self, Error> {
        if buf[0] != PROTO_VERSION {
            return Err(Error::InvalidVersion(buf[0]));
        }
        let typ = FrameType::try_from(buf[1])?;
        let flags = Flags(u16::from_be_bytes([buf[2], buf[3]]));
        let stream_id = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let length = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        Ok(Header::new(typ, flags, stream_id, length))
    }
}

/// A header plus the body that follows it on the wire.
///
/// Only data frames carry a body; for every other type `body` is empty.
#[derive(Debug)]
pub struct Frame {
    pub header: Header,
    pub body: Vec<u8>,
}

impl Frame {
    /// A body-less frame.
    pub fn control(header: Header) -> Self {
        Frame {
            header,
            body: Vec::new(),
        }
    }

    /// A data frame; the header length is derived from the body.
    pub fn data(flags: Flags, stream_id: u32, body: Vec<u8>) -> Self {
        Frame {
            header: Header::data(flags, stream_id, body.len() as u32),
            body,
        }
    }
}
