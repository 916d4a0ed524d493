//! Byte stream framing.
//!
//! [`Framer`] is the receive state machine of the serial driver: it walks
//! the incoming byte stream one byte at a time, undoes the DLE stuffing,
//! keeps a running FCS and emits a [`Frame`] for every frame that passes
//! both the FCS check and the address filter. Anything else is dropped
//! silently and the machine resynchronizes on the next `DLE STX`.
//!
//! It doubles as a `tokio_util` codec so a link can be driven by
//! `FramedRead` / `FramedWrite`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use bytes::{Buf, BytesMut};
use log::trace;
use tokio_util::codec::{Decoder, Encoder};

use crate::core::{
    BROADCAST_ADDRESS, DLE, ETX, Fcs, Frame, HEADER_LEN, Header, MAX_PAYLOAD_LEN, STX,
};
use crate::error::Error;

/// Receiver states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    /// The link has not been opened yet, bytes are ignored.
    Initialising,
    /// Waiting for the leading `DLE`.
    Idle,
    /// Got `DLE`, waiting for `STX`.
    SawLeadDle,
    /// Receiving header and payload.
    InData,
    /// Got a `DLE` while receiving data.
    SawDleInData,
    /// Got `DLE ETX`, waiting for the first FCS octet.
    WaitFcsHi,
    /// Waiting for the second FCS octet.
    WaitFcsLo,
}

/// Receive address filter.
///
/// Shared between the reader task that owns the [`Framer`] and the managers
/// that change the node address or promiscuous mode at runtime.
#[derive(Debug)]
pub struct AddressFilter {
    this_address: AtomicU8,
    promiscuous: AtomicBool,
}

impl Default for AddressFilter {
    fn default() -> Self {
        Self::new(BROADCAST_ADDRESS)
    }
}

impl AddressFilter {
    /// Filter for `this_address`, not promiscuous.
    pub fn new(this_address: u8) -> Self {
        Self {
            this_address: AtomicU8::new(this_address),
            promiscuous: AtomicBool::new(false),
        }
    }

    /// Address frames must carry in TO to be accepted.
    pub fn this_address(&self) -> u8 {
        self.this_address.load(Ordering::Relaxed)
    }

    /// Changes the accepted address. Frames already decoded are unaffected.
    pub fn set_this_address(&self, address: u8) {
        self.this_address.store(address, Ordering::Relaxed);
    }

    /// Whether frames for any address are accepted.
    pub fn promiscuous(&self) -> bool {
        self.promiscuous.load(Ordering::Relaxed)
    }

    /// Accepts frames for every address when `promiscuous` is set.
    pub fn set_promiscuous(&self, promiscuous: bool) {
        self.promiscuous.store(promiscuous, Ordering::Relaxed);
    }

    /// Returns true if a frame with the given TO header is for this node.
    pub fn accepts(&self, to: u8) -> bool {
        self.promiscuous() || to == self.this_address() || to == BROADCAST_ADDRESS
    }
}

/// Receive state machine and frame codec.
#[derive(Debug)]
pub struct Framer {
    state: RxState,

    /// Header and unstuffed payload of the frame being received.
    buf: heapless::Vec<u8, MAX_PAYLOAD_LEN>,

    /// Progressive FCS over the received data (not stuffed DLEs), plus `DLE ETX`.
    rx_fcs: Fcs,

    /// FCS received at the end of the current frame.
    recd_fcs: u16,

    filter: Arc<AddressFilter>,
}

impl Framer {
    /// Creates a framer in [`RxState::Initialising`].
    pub fn new(filter: Arc<AddressFilter>) -> Self {
        Self {
            state: RxState::Initialising,
            buf: heapless::Vec::new(),
            rx_fcs: Fcs::new(),
            recd_fcs: 0,
            filter,
        }
    }

    /// Creates a framer that is already receiving, for the given address.
    pub fn with_address(this_address: u8) -> Self {
        let mut framer = Self::new(Arc::new(AddressFilter::new(this_address)));
        framer.start();
        framer
    }

    /// Leaves [`RxState::Initialising`]; called once the link is open.
    pub fn start(&mut self) {
        if self.state == RxState::Initialising {
            self.state = RxState::Idle;
        }
    }

    pub fn state(&self) -> RxState {
        self.state
    }

    /// Address filter shared with the owning driver.
    pub fn filter(&self) -> &Arc<AddressFilter> {
        &self.filter
    }

    /// Handles one received byte.
    ///
    /// Returns a frame when this byte completes a valid frame addressed to
    /// this node.
    pub fn decode_byte(&mut self, ch: u8) -> Option<Frame> {
        match self.state {
            RxState::Initialising => None,

            RxState::Idle => {
                if ch == DLE {
                    self.state = RxState::SawLeadDle;
                }
                None
            }

            RxState::SawLeadDle => {
                if ch == STX {
                    self.clear_rx_buf();
                    self.state = RxState::InData;
                } else {
                    self.state = RxState::Idle;
                }
                None
            }

            RxState::InData => {
                if ch == DLE {
                    self.state = RxState::SawDleInData;
                } else {
                    self.append_rx_buf(ch);
                }
                None
            }

            RxState::SawDleInData => {
                match ch {
                    ETX => {
                        self.rx_fcs.push(DLE);
                        self.rx_fcs.push(ETX);
                        self.state = RxState::WaitFcsHi;
                    }
                    DLE => {
                        self.append_rx_buf(ch);
                        self.state = RxState::InData;
                    }
                    _ => {
                        trace!("unexpected byte {:#04x} after DLE, resynchronizing", ch);
                        self.state = RxState::Idle;
                    }
                }
                None
            }

            RxState::WaitFcsHi => {
                self.recd_fcs = (ch as u16) << 8;
                self.state = RxState::WaitFcsLo;
                None
            }

            RxState::WaitFcsLo => {
                self.recd_fcs |= ch as u16;
                self.state = RxState::Idle;
                let frame = self.validate_rx_buf();
                self.clear_rx_buf();
                frame
            }
        }
    }

    /// Runs every byte of `data` through the state machine.
    pub fn decode_slice(&mut self, data: &[u8]) -> Vec<Frame> {
        data.iter().filter_map(|&ch| self.decode_byte(ch)).collect()
    }

    fn clear_rx_buf(&mut self) {
        self.rx_fcs.reset();
        self.buf.clear();
    }

    fn append_rx_buf(&mut self, ch: u8) {
        // A full buffer drops the byte; the FCS then no longer matches.
        if self.buf.push(ch).is_ok() {
            self.rx_fcs.push(ch);
        }
    }

    fn validate_rx_buf(&self) -> Option<Frame> {
        if self.recd_fcs != self.rx_fcs.value() {
            trace!(
                "FCS mismatch: received {:#06x}, computed {:#06x}",
                self.recd_fcs,
                self.rx_fcs.value()
            );
            return None;
        }

        if self.buf.len() < HEADER_LEN {
            trace!("dropping {} byte frame without a complete header", self.buf.len());
            return None;
        }

        let header = Header::from_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        if !self.filter.accepts(header.to) {
            trace!("dropping frame for {:#04x}", header.to);
            return None;
        }

        Some(Frame::new(header, &self.buf[HEADER_LEN..]))
    }
}

impl Decoder for Framer {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        while src.has_remaining() {
            if let Some(frame) = self.decode_byte(src.get_u8()) {
                return Ok(Some(frame));
            }
        }
        Ok(None)
    }
}

impl Encoder<Frame> for Framer {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Error> {
        frame.encode_into(dst);
        Ok(())
    }
}
