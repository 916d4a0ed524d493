//! Core data structures for the serial datagram protocol.
//!
//! This module contains fundamental building blocks:
//! - Frame: Wire-level unit with header and payload
//! - Checksum: CRC-CCITT frame check sequence

mod checksum;
mod frame;

pub use checksum::{FCS_INIT, Fcs, crc_ccitt_update};
pub use frame::{
    BROADCAST_ADDRESS, DLE, ETX, Frame, HEADER_LEN, Header, HeaderFlags, MAX_ENCODED_LEN,
    MAX_MESSAGE_LEN, MAX_PAYLOAD_LEN, ReceivedMessage, STX, SYN, encode,
};
