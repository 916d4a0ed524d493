//! Frame definition and encoding for the serial datagram protocol.
//!
//! A frame carries one datagram: a four byte header followed by up to
//! [`MAX_MESSAGE_LEN`] bytes of application payload.
//!
//! # Frame Format
//!
//! ```text
//! +-----+-----+----+------+----+-------+---------------------+-----+-----+--------+--------+
//! | DLE | STX | TO | FROM | ID | FLAGS | payload (DLE x2)... | DLE | ETX | FCS hi | FCS lo |
//! +-----+-----+----+------+----+-------+---------------------+-----+-----+--------+--------+
//!              \_____________ covered by the FCS ____________________/
//! ```
//!
//! The FCS covers the header, the unescaped payload and the trailing
//! `DLE ETX`. Header bytes are sent verbatim, even when one of them equals
//! `DLE`; peers running the RadioHead firmware expect exactly that.

use bytes::{BufMut, Bytes, BytesMut};

use super::checksum::Fcs;

/// Data link escape.
pub const DLE: u8 = 0x10;

/// Start of text, follows the leading `DLE`.
pub const STX: u8 = 0x02;

/// End of text, follows the trailing `DLE`.
pub const ETX: u8 = 0x03;

/// Synchronous idle. Reserved by the line discipline, never emitted.
pub const SYN: u8 = 0x16;

/// Header length in bytes.
pub const HEADER_LEN: usize = 4;

/// Maximum header plus payload length held by a receiver.
pub const MAX_PAYLOAD_LEN: usize = 64;

/// Maximum application payload per frame.
pub const MAX_MESSAGE_LEN: usize = MAX_PAYLOAD_LEN - HEADER_LEN;

/// Worst case size of an encoded frame (every payload byte a `DLE`).
pub const MAX_ENCODED_LEN: usize = 2 + HEADER_LEN + 2 * MAX_MESSAGE_LEN + 2 + 2;

/// Address accepted by every receiver.
pub const BROADCAST_ADDRESS: u8 = 0xFF;

/// Flags header byte.
///
/// The high nibble is reserved for the protocol (bit 7 marks an ACK), the
/// low nibble belongs to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct HeaderFlags(u8);

impl HeaderFlags {
    /// No flags set.
    pub const NONE: Self = Self(0x00);

    /// Bits reserved for the protocol.
    pub const RESERVED: Self = Self(0xF0);

    /// Bits available to the application.
    pub const APPLICATION_SPECIFIC: Self = Self(0x0F);

    /// The frame acknowledges the frame with the same id.
    pub const ACK: Self = Self(0x80);

    /// Creates flags from the raw header byte.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Returns the raw header byte.
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// Checks if every bit of `other` is set.
    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Sets the bits of `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Clears the bits of `other`.
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Combines two flag sets.
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Clears `clear`, then sets `set`.
    pub fn apply(&mut self, set: Self, clear: Self) {
        self.remove(clear);
        self.insert(set);
    }
}

/// The four header bytes of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Header {
    pub to: u8,
    pub from: u8,
    pub id: u8,
    pub flags: HeaderFlags,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            to: BROADCAST_ADDRESS,
            from: BROADCAST_ADDRESS,
            id: 0,
            flags: HeaderFlags::NONE,
        }
    }
}

impl Header {
    /// Header with the given TO, FROM, ID and FLAGS bytes.
    pub const fn new(to: u8, from: u8, id: u8, flags: HeaderFlags) -> Self {
        Self { to, from, id, flags }
    }

    /// True if the ACK flag is set.
    pub const fn is_ack(&self) -> bool {
        self.flags.contains(HeaderFlags::ACK)
    }

    /// True if addressed to [`BROADCAST_ADDRESS`].
    pub const fn is_broadcast(&self) -> bool {
        self.to == BROADCAST_ADDRESS
    }

    /// Header in wire order: TO, FROM, ID, FLAGS.
    pub const fn to_bytes(&self) -> [u8; HEADER_LEN] {
        [self.to, self.from, self.id, self.flags.bits()]
    }

    /// Inverse of [`to_bytes`](Self::to_bytes).
    pub const fn from_bytes(bytes: [u8; HEADER_LEN]) -> Self {
        Self {
            to: bytes[0],
            from: bytes[1],
            id: bytes[2],
            flags: HeaderFlags::from_bits(bytes[3]),
        }
    }
}

/// A datagram as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Bytes,
}

impl Frame {
    /// Creates a frame, truncating `payload` to [`MAX_MESSAGE_LEN`].
    pub fn new(header: Header, payload: &[u8]) -> Self {
        let len = payload.len().min(MAX_MESSAGE_LEN);
        Self {
            header,
            payload: Bytes::copy_from_slice(&payload[..len]),
        }
    }

    /// Returns the encoded size of this frame.
    pub fn wire_size(&self) -> usize {
        let escaped = self.payload.iter().filter(|&&b| b == DLE).count();
        2 + HEADER_LEN + self.payload.len() + escaped + 2 + 2
    }

    /// Appends the wire form of this frame to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        encode(&self.header, &self.payload, dst);
    }

    /// Returns the wire form of this frame.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.wire_size());
        self.encode_into(&mut buf);
        buf
    }
}

/// Encodes one frame into `dst`.
///
/// `payload` is silently truncated to [`MAX_MESSAGE_LEN`] bytes.
pub fn encode(header: &Header, payload: &[u8], dst: &mut BytesMut) {
    let payload = &payload[..payload.len().min(MAX_MESSAGE_LEN)];
    dst.reserve(2 + HEADER_LEN + 2 * payload.len() + 4);

    // Not in FCS
    dst.put_u8(DLE);
    dst.put_u8(STX);

    let mut fcs = Fcs::new();
    for byte in header.to_bytes() {
        dst.put_u8(byte);
        fcs.push(byte);
    }

    for &byte in payload {
        dst.put_u8(byte);
        fcs.push(byte);
        if byte == DLE {
            // Stuffed DLE, not in FCS
            dst.put_u8(DLE);
        }
    }

    dst.put_u8(DLE);
    fcs.push(DLE);
    dst.put_u8(ETX);
    fcs.push(ETX);

    dst.put_u16(fcs.value());
}

/// A datagram handed to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub header: Header,
    pub data: Bytes,
}

impl ReceivedMessage {
    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// TO header.
    pub fn to(&self) -> u8 {
        self.header.to
    }

    /// Sender address.
    pub fn from(&self) -> u8 {
        self.header.from
    }

    /// Sequence id chosen by the sender.
    pub fn id(&self) -> u8 {
        self.header.id
    }

    pub fn flags(&self) -> HeaderFlags {
        self.header.flags
    }
}

impl From<Frame> for ReceivedMessage {
    fn from(frame: Frame) -> Self {
        Self {
            header: frame.header,
            data: frame.payload,
        }
    }
}
