//! # rhserial - RadioHead serial datagrams
//!
//! rhserial talks the RH_Serial wire protocol of the RadioHead library, so a
//! host can exchange datagrams with microcontroller nodes over a serial line
//! (or anything that carries bytes: a TCP bridge, a Unix socket, a pipe).
//!
//! - **Framing**: `DLE STX` ... `DLE ETX` frames with `DLE` stuffing
//! - **CRC-CCITT**: 16-bit frame check sequence
//! - **Addressing**: 8-bit node addresses, broadcast and promiscuous receive
//! - **Reliable delivery**: acknowledgements, randomized retransmission and
//!   duplicate suppression
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Application (Node)                    │
//! ├─────────────────────────────────────────────────────────┤
//! │                    Manager Layer                         │
//! │  ┌──────────────────────┐ ┌──────────────────────────┐  │
//! │  │       Datagram       │ │    ReliableDatagram      │  │
//! │  └──────────────────────┘ └──────────────────────────┘  │
//! ├─────────────────────────────────────────────────────────┤
//! │                    Driver / Frame Layer                  │
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────────┐    │
//! │  │   Framer    │ │  CRC-CCITT  │ │ Address filter  │    │
//! │  └─────────────┘ └─────────────┘ └─────────────────┘    │
//! ├─────────────────────────────────────────────────────────┤
//! │                    Transport Layer                       │
//! │  ┌─────────────────────────────────────────────────┐    │
//! │  │   Serial device / TCP / Unix socket / memory    │    │
//! │  └─────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use rhserial::{Config, Node, Target};
//!
//! let node = Node::new(Target::device("/dev/ttyUSB0", 9600), Config::new(0x01))?;
//! let mut events = node.take_events().unwrap();
//! node.init().await?;
//!
//! node.send(0x02, b"Hello").await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let Some(msg) = event.into_message() {
//!         println!("{:#04x}: {:?}", msg.from(), msg.data);
//!     }
//! }
//! ```

#![deny(unsafe_code)]

pub mod config;
pub mod core;
pub mod datagram;
pub mod driver;
pub mod error;
pub mod event;
pub mod framer;
pub mod node;
pub mod reliable;
pub mod transport;

pub use config::Config;
pub use self::core::{
    BROADCAST_ADDRESS, Frame, Header, HeaderFlags, MAX_MESSAGE_LEN, MAX_PAYLOAD_LEN,
    ReceivedMessage,
};
pub use datagram::Datagram;
pub use driver::{Driver, EventReceiver};
pub use error::{Error, ErrorKind, Result};
pub use event::Event;
pub use framer::Framer;
pub use node::Node;
pub use reliable::ReliableDatagram;
pub use transport::{DEFAULT_BAUD_RATE, MemoryTransport, Target, Transport};

/// Default minimum wait for an acknowledgement, in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 200;

/// Default number of retransmissions after the first attempt.
pub const DEFAULT_RETRIES: u32 = 3;
