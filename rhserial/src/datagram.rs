//! Addressed, unreliable datagrams.

use std::sync::{Mutex, MutexGuard};

use log::debug;

use crate::core::{BROADCAST_ADDRESS, Frame, Header, HeaderFlags};
use crate::driver::{Driver, EventReceiver};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::transport::Transport;

/// Datagram manager.
///
/// Keeps the local node address and a template header. Every send copies
/// the template into the frame it writes, so header changes made through the
/// setters apply to the next send only from then on.
pub struct Datagram {
    driver: Driver,
    template: Mutex<Header>,
}

impl Datagram {
    /// Creates a manager for `transport`. The link stays closed until
    /// [`init`](Self::init).
    pub fn new<T: Transport + 'static>(transport: T, this_address: u8) -> Self {
        let driver = Driver::new(transport);
        driver.set_this_address(this_address);
        Self {
            driver,
            template: Mutex::new(Header {
                from: this_address,
                ..Header::default()
            }),
        }
    }

    fn template(&self) -> MutexGuard<'_, Header> {
        self.template.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Opens the link, then applies the node address to filtering and to the
    /// FROM header.
    pub async fn init(&self) -> Result<()> {
        self.driver.init().await?;
        let address = self.this_address();
        self.set_this_address(address);
        self.driver.emit(Event::Initialized);
        Ok(())
    }

    /// Closes the link and stops the reader.
    pub async fn close(&self) -> Result<()> {
        self.driver.close().await
    }

    /// Address of this node.
    pub fn this_address(&self) -> u8 {
        self.driver.filter().this_address()
    }

    /// Sets the node address used for receive filtering and as the FROM header.
    pub fn set_this_address(&self, address: u8) {
        self.driver.set_this_address(address);
        self.template().from = address;
    }

    pub fn set_promiscuous(&self, promiscuous: bool) {
        self.driver.set_promiscuous(promiscuous);
    }

    pub fn promiscuous(&self) -> bool {
        self.driver.filter().promiscuous()
    }

    /// Sets the TO header of the template. `sendto` overrides it per call.
    pub fn set_header_to(&self, to: u8) {
        self.template().to = to;
    }

    /// Sets the FROM header for following sends.
    pub fn set_header_from(&self, from: u8) {
        self.template().from = from;
    }

    /// Sets the ID header for following sends.
    pub fn set_header_id(&self, id: u8) {
        self.template().id = id;
    }

    /// Clears the `clear` bits of the FLAGS header, then sets the `set` bits.
    ///
    /// The usual `clear` mask is [`HeaderFlags::APPLICATION_SPECIFIC`].
    pub fn set_header_flags(&self, set: HeaderFlags, clear: HeaderFlags) {
        self.template().flags.apply(set, clear);
    }

    /// Snapshot of the header the next send would use.
    pub fn header(&self) -> Header {
        *self.template()
    }

    /// Sends `payload` to `address` with the current header template.
    ///
    /// Payloads longer than [`MAX_MESSAGE_LEN`](crate::core::MAX_MESSAGE_LEN)
    /// are truncated.
    pub async fn sendto(&self, payload: &[u8], address: u8) -> Result<()> {
        if payload.is_empty() {
            return Err(Error::InvalidArgument("payload must not be empty"));
        }
        let header = {
            let mut template = self.template();
            template.to = address;
            *template
        };
        self.send_header(header, payload).await
    }

    /// Sends `payload` with an explicit header, leaving the template alone.
    pub async fn send_header(&self, header: Header, payload: &[u8]) -> Result<()> {
        if header.to == BROADCAST_ADDRESS {
            debug!("Broadcasting id {} ({} bytes)", header.id, payload.len());
        }
        self.driver.send(Frame::new(header, payload)).await
    }

    /// Takes the inbound event channel. Only the first call gets it.
    pub fn take_events(&self) -> Option<EventReceiver> {
        self.driver.take_events()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::HEADER_LEN;
    use crate::framer::Framer;
    use crate::transport::MemoryTransport;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    async fn read_frame(peer: &mut DuplexStream, framer: &mut Framer) -> Frame {
        let mut buf = [0u8; 256];
        loop {
            let n = peer.read(&mut buf).await.unwrap();
            assert!(n > 0, "link closed");
            if let Some(frame) = framer.decode_slice(&buf[..n]).into_iter().next() {
                return frame;
            }
        }
    }

    #[tokio::test]
    async fn test_sendto_uses_template() {
        let (transport, mut peer) = MemoryTransport::with_peer();
        let manager = Datagram::new(transport, 0x01);
        manager.init().await.unwrap();

        manager.set_header_id(0x07);
        manager.set_header_flags(HeaderFlags::from_bits(0x05), HeaderFlags::APPLICATION_SPECIFIC);
        manager.sendto(b"Hello", 0x02).await.unwrap();

        let mut framer = Framer::with_address(0x02);
        let frame = read_frame(&mut peer, &mut framer).await;
        assert_eq!(frame.header, Header::new(0x02, 0x01, 0x07, HeaderFlags::from_bits(0x05)));
        assert_eq!(&frame.payload[..], b"Hello");
    }

    #[tokio::test]
    async fn test_empty_payload_rejected() {
        let (transport, mut peer) = MemoryTransport::with_peer();
        let manager = Datagram::new(transport, 0x01);
        manager.init().await.unwrap();

        let err = manager.sendto(b"", 0x02).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        manager.close().await.unwrap();
        let mut rest = Vec::new();
        peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_address_applies_to_filter_and_from() {
        let (transport, mut peer) = MemoryTransport::with_peer();
        let manager = Datagram::new(transport, 0x01);
        let mut events = manager.take_events().unwrap();
        manager.set_this_address(0x09);
        manager.init().await.unwrap();
        assert_eq!(manager.this_address(), 0x09);
        assert_eq!(manager.header().from, 0x09);

        let ignored = Frame::new(Header::new(0x01, 0x03, 0x01, HeaderFlags::NONE), b"old");
        let wanted = Frame::new(Header::new(0x09, 0x03, 0x02, HeaderFlags::NONE), b"new");
        peer.write_all(&ignored.encode()).await.unwrap();
        peer.write_all(&wanted.encode()).await.unwrap();

        let msg = loop {
            match events.recv().await.unwrap() {
                Event::Message(msg) => break msg,
                Event::Initialized | Event::Started => {}
                other => panic!("unexpected event {:?}", other),
            }
        };
        assert_eq!(msg.id(), 0x02);
        assert_eq!(&msg.data[..], b"new");
    }

    #[tokio::test]
    async fn test_flags_mask() {
        let (transport, _peer) = MemoryTransport::with_peer();
        let manager = Datagram::new(transport, 0x01);

        manager.set_header_flags(HeaderFlags::from_bits(0x8F), HeaderFlags::NONE);
        manager.set_header_flags(HeaderFlags::from_bits(0x02), HeaderFlags::APPLICATION_SPECIFIC);
        assert_eq!(manager.header().flags.bits(), 0x82);
        assert_eq!(manager.header().to_bytes().len(), HEADER_LEN);
    }
}
