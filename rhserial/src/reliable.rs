//! Acknowledged datagrams.
//!
//! Every unicast send carries a sequence number in the ID header and waits
//! for the addressee to echo that ID back with the ACK flag set. A send with
//! no acknowledgement is retransmitted after a randomized timeout, up to the
//! configured number of retries. Receivers acknowledge every unicast frame
//! addressed to them, including duplicates, and deliver each ID from a given
//! sender once.
//!
//! ```text
//!  sender                          receiver
//!    | -- id=7 "hello" ----------->  |  deliver, ACK
//!    |        x--------- ACK id=7 -- |  (lost)
//!    |   [timeout in t..2t]          |
//!    | -- id=7 "hello" ----------->  |  duplicate: ACK only
//!    | <------------ ACK id=7 ------ |
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, trace, warn};
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::core::{BROADCAST_ADDRESS, Header, HeaderFlags, ReceivedMessage};
use crate::datagram::Datagram;
use crate::driver::{EventReceiver, EventSender};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::transport::Transport;
use crate::{DEFAULT_RETRIES, DEFAULT_TIMEOUT_MS};

/// Payload of an acknowledgement frame.
const ACK_PAYLOAD: &[u8] = b"!";

/// `(from, to, id)` of the acknowledgement a send is waiting for.
type AckKey = (u8, u8, u8);

struct Waiter {
    token: u64,
    tx: oneshot::Sender<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Shared {
    datagram: Datagram,
    last_sequence: AtomicU8,
    timeout_ms: AtomicU64,
    retries: AtomicU32,
    retransmissions: AtomicU32,
    next_token: AtomicU64,
    seen_ids: Mutex<[u8; 256]>,
    pending: Mutex<HashMap<AckKey, Waiter>>,
    events_tx: EventSender,
}

impl Shared {
    fn register(&self, key: AckKey) -> (u64, oneshot::Receiver<()>) {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        if lock(&self.pending).insert(key, Waiter { token, tx }).is_some() {
            debug!("Replaced a stale ACK waiter for id {}", key.2);
        }
        (token, rx)
    }

    fn unregister(&self, key: AckKey, token: u64) {
        let mut pending = lock(&self.pending);
        if pending.get(&key).is_some_and(|waiter| waiter.token == token) {
            pending.remove(&key);
        }
    }

    /// Random wait in `[timeout, 2 * timeout)`.
    fn ack_wait(&self) -> Duration {
        let timeout = self.timeout_ms.load(Ordering::Relaxed);
        if timeout == 0 {
            return Duration::ZERO;
        }
        let jittered = rand::thread_rng().gen_range(timeout..timeout.saturating_mul(2));
        Duration::from_millis(jittered)
    }

    /// Records `id` as the latest from `from`; false if it already was.
    fn first_sighting(&self, from: u8, id: u8) -> bool {
        let mut seen = lock(&self.seen_ids);
        let slot = &mut seen[usize::from(from)];
        if *slot == id {
            false
        } else {
            *slot = id;
            true
        }
    }

    fn forward(&self, event: Event) {
        let _ = self.events_tx.send(event);
    }

    async fn acknowledge(&self, id: u8, to: u8) -> Result<()> {
        let mut header = self.datagram.header();
        header.to = to;
        header.id = id;
        header.flags.apply(HeaderFlags::ACK, HeaderFlags::APPLICATION_SPECIFIC);
        debug!("Acknowledging id {} from {:#04x}", id, to);
        self.datagram.send_header(header, ACK_PAYLOAD).await
    }

    async fn handle_message(&self, msg: ReceivedMessage) {
        if msg.flags().contains(HeaderFlags::ACK) {
            let key = (msg.from(), msg.to(), msg.id());
            let waiter = lock(&self.pending).remove(&key);
            match waiter {
                Some(waiter) => {
                    debug!("ACK for id {} from {:#04x}", msg.id(), msg.from());
                    let _ = waiter.tx.send(());
                }
                None => trace!(
                    "Ignoring unexpected ACK for id {} from {:#04x}",
                    msg.id(),
                    msg.from()
                ),
            }
            return;
        }

        if msg.to() == BROADCAST_ADDRESS {
            self.forward(Event::Message(msg));
            return;
        }

        if msg.to() == self.datagram.this_address() {
            if let Err(e) = self.acknowledge(msg.id(), msg.from()).await {
                warn!("Failed to acknowledge id {} from {:#04x}: {}", msg.id(), msg.from(), e);
            }
        }

        if self.first_sighting(msg.from(), msg.id()) {
            self.forward(Event::Message(msg));
        } else {
            debug!("Dropping duplicate id {} from {:#04x}", msg.id(), msg.from());
        }
    }
}

async fn dispatch(shared: Arc<Shared>, mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        match event {
            Event::Message(msg) => shared.handle_message(msg).await,
            other => shared.forward(other),
        }
    }
}

/// Reliable datagram manager.
pub struct ReliableDatagram {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    events_rx: Mutex<Option<EventReceiver>>,
}

impl ReliableDatagram {
    /// Creates a reliable manager for `transport` with the default timeout
    /// and retry count.
    pub fn new<T: Transport + 'static>(transport: T, this_address: u8) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Shared {
            datagram: Datagram::new(transport, this_address),
            last_sequence: AtomicU8::new(0),
            timeout_ms: AtomicU64::new(DEFAULT_TIMEOUT_MS),
            retries: AtomicU32::new(DEFAULT_RETRIES),
            retransmissions: AtomicU32::new(0),
            next_token: AtomicU64::new(0),
            seen_ids: Mutex::new([0; 256]),
            pending: Mutex::new(HashMap::new()),
            events_tx,
        };
        Self {
            shared: Arc::new(shared),
            dispatcher: Mutex::new(None),
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Opens the link and starts acknowledging inbound frames.
    pub async fn init(&self) -> Result<()> {
        self.shared.datagram.init().await?;

        let mut dispatcher = lock(&self.dispatcher);
        if dispatcher.is_none() {
            if let Some(events) = self.shared.datagram.take_events() {
                *dispatcher = Some(tokio::spawn(dispatch(self.shared.clone(), events)));
            }
        }
        Ok(())
    }

    /// Closes the link. Sends still waiting for an ACK fail with
    /// [`Error::Closed`].
    pub async fn close(&self) -> Result<()> {
        let result = self.shared.datagram.close().await;

        let waiters: Vec<Waiter> = lock(&self.shared.pending).drain().map(|(_, w)| w).collect();
        if !waiters.is_empty() {
            debug!("Abandoning {} pending acknowledgements", waiters.len());
        }
        result
    }

    /// Sends `payload` to `address` and waits for it to be acknowledged.
    ///
    /// Broadcasts are never acknowledged; they resolve once written. A write
    /// failure is returned as is, without retrying.
    pub async fn sendto_wait(&self, payload: &[u8], address: u8) -> Result<()> {
        if payload.is_empty() {
            return Err(Error::InvalidArgument("payload must not be empty"));
        }

        let shared = &self.shared;
        let seq = shared.last_sequence.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let retries = shared.retries.load(Ordering::Relaxed);
        let mut attempt = 0;

        loop {
            let mut header: Header = shared.datagram.header();
            header.to = address;
            header.id = seq;
            header.flags.remove(HeaderFlags::ACK);

            if address == BROADCAST_ADDRESS {
                return shared.datagram.send_header(header, payload).await;
            }

            let key = (address, shared.datagram.this_address(), seq);
            let (token, mut ack) = shared.register(key);
            if let Err(e) = shared.datagram.send_header(header, payload).await {
                shared.unregister(key, token);
                return Err(e);
            }

            match tokio::time::timeout(shared.ack_wait(), &mut ack).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(_)) => return Err(Error::Closed),
                Err(_) => {
                    shared.unregister(key, token);
                    if ack.try_recv().is_ok() {
                        return Ok(());
                    }
                }
            }

            if attempt >= retries {
                warn!("No ACK from {:#04x} for id {} after {} attempts", address, seq, attempt + 1);
                return Err(Error::Timeout {
                    address,
                    id: seq,
                    attempts: attempt + 1,
                });
            }

            attempt += 1;
            shared.retransmissions.fetch_add(1, Ordering::Relaxed);
            warn!(
                "No ACK from {:#04x} for id {}, retransmitting ({}/{})",
                address, seq, attempt, retries
            );
        }
    }

    /// Underlying datagram manager, for header access.
    pub fn datagram(&self) -> &Datagram {
        &self.shared.datagram
    }

    pub fn this_address(&self) -> u8 {
        self.shared.datagram.this_address()
    }

    pub fn set_this_address(&self, address: u8) {
        self.shared.datagram.set_this_address(address);
    }

    pub fn set_promiscuous(&self, promiscuous: bool) {
        self.shared.datagram.set_promiscuous(promiscuous);
    }

    /// Sets the number of retransmissions after the first attempt. Zero sends
    /// each message once.
    pub fn set_retries(&self, retries: u32) {
        self.shared.retries.store(retries, Ordering::Relaxed);
    }

    pub fn retries(&self) -> u32 {
        self.shared.retries.load(Ordering::Relaxed)
    }

    /// Sets the minimum ACK wait. The actual wait is random between this and
    /// twice this.
    pub fn set_timeout(&self, timeout: Duration) {
        let ms = u64::try_from(timeout.as_millis())
            .unwrap_or(u64::MAX)
            .min(u64::from(u32::MAX));
        self.shared.timeout_ms.store(ms, Ordering::Relaxed);
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.shared.timeout_ms.load(Ordering::Relaxed))
    }

    /// Retransmissions sent since creation or the last reset.
    pub fn retransmissions(&self) -> u32 {
        self.shared.retransmissions.load(Ordering::Relaxed)
    }

    /// Zeroes the retransmission counter.
    pub fn reset_retransmissions(&self) {
        self.shared.retransmissions.store(0, Ordering::Relaxed);
    }

    /// Takes the inbound event channel. Only the first call gets it.
    ///
    /// Acknowledgements and duplicates never show up here.
    pub fn take_events(&self) -> Option<EventReceiver> {
        lock(&self.events_rx).take()
    }
}

impl Drop for ReliableDatagram {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.dispatcher).take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Frame;
    use crate::framer::Framer;
    use crate::transport::MemoryTransport;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    struct Peer {
        stream: DuplexStream,
        framer: Framer,
        frames: Vec<Frame>,
    }

    impl Peer {
        fn new(stream: DuplexStream, address: u8) -> Self {
            Self {
                stream,
                framer: Framer::with_address(address),
                frames: Vec::new(),
            }
        }

        async fn recv(&mut self) -> Frame {
            let mut buf = [0u8; 256];
            while self.frames.is_empty() {
                let n = self.stream.read(&mut buf).await.unwrap();
                assert!(n > 0, "link closed");
                self.frames.extend(self.framer.decode_slice(&buf[..n]));
            }
            self.frames.remove(0)
        }

        async fn send(&mut self, header: Header, payload: &[u8]) {
            let frame = Frame::new(header, payload);
            self.stream.write_all(&frame.encode()).await.unwrap();
        }

        async fn rest(&mut self) -> Vec<u8> {
            let mut rest = Vec::new();
            self.stream.read_to_end(&mut rest).await.unwrap();
            rest
        }
    }

    async fn next_message(events: &mut EventReceiver) -> ReceivedMessage {
        loop {
            match events.recv().await.expect("event channel closed") {
                Event::Message(msg) => return msg,
                Event::Initialized | Event::Started => {}
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    async fn setup(address: u8, peer_address: u8) -> (Arc<ReliableDatagram>, Peer) {
        let (transport, stream) = MemoryTransport::with_peer();
        let manager = Arc::new(ReliableDatagram::new(transport, address));
        manager.init().await.unwrap();
        (manager, Peer::new(stream, peer_address))
    }

    #[tokio::test(start_paused = true)]
    async fn test_acked_send_resolves() {
        let (manager, mut peer) = setup(0x01, 0x02).await;

        let sender = manager.clone();
        let send = tokio::spawn(async move { sender.sendto_wait(b"Hello", 0x02).await });

        let frame = peer.recv().await;
        assert_eq!(frame.header, Header::new(0x02, 0x01, 0x01, HeaderFlags::NONE));
        assert_eq!(&frame.payload[..], b"Hello");

        peer.send(Header::new(0x01, 0x02, 0x01, HeaderFlags::ACK), b"!").await;

        send.await.unwrap().unwrap();
        assert_eq!(manager.retransmissions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_send_times_out() {
        let (manager, mut peer) = setup(0x01, 0x02).await;
        let start = tokio::time::Instant::now();

        let err = manager.sendto_wait(b"anyone?", 0x02).await.unwrap_err();
        match err {
            Error::Timeout { address, id, attempts } => {
                assert_eq!(address, 0x02);
                assert_eq!(id, 1);
                assert_eq!(attempts, DEFAULT_RETRIES + 1);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(manager.retransmissions(), DEFAULT_RETRIES);
        assert!(start.elapsed() >= Duration::from_millis(DEFAULT_TIMEOUT_MS * 4));

        for _ in 0..=DEFAULT_RETRIES {
            let frame = peer.recv().await;
            assert_eq!(frame.header.id, 1);
            assert!(!frame.header.is_ack());
        }

        manager.reset_retransmissions();
        assert_eq!(manager.retransmissions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_sends_once() {
        let (manager, mut peer) = setup(0x01, 0x02).await;
        manager.set_retries(0);
        manager.set_timeout(Duration::from_millis(50));

        let err = manager.sendto_wait(b"once", 0x02).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { attempts: 1, .. }));
        assert_eq!(manager.retransmissions(), 0);

        manager.close().await.unwrap();
        let rest = peer.rest().await;
        assert_eq!(Framer::with_address(0x02).decode_slice(&rest).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmit_then_ack() {
        let (manager, mut peer) = setup(0x01, 0x02).await;

        let sender = manager.clone();
        let send = tokio::spawn(async move { sender.sendto_wait(b"again", 0x02).await });

        // Ignore the first copy.
        let first = peer.recv().await;
        let second = peer.recv().await;
        assert_eq!(first.header.id, second.header.id);

        peer.send(Header::new(0x01, 0x02, second.header.id, HeaderFlags::ACK), b"!").await;
        send.await.unwrap().unwrap();
        assert_eq!(manager.retransmissions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_sends_only_take_their_own_ack() {
        let (manager, mut peer) = setup(0x01, 0x02).await;
        peer.framer.filter().set_promiscuous(true);

        let to_two = manager.clone();
        let send_two = tokio::spawn(async move { to_two.sendto_wait(b"two", 0x02).await });
        let to_three = manager.clone();
        let send_three = tokio::spawn(async move { to_three.sendto_wait(b"three", 0x03).await });

        let mut id_two = None;
        let mut id_three = None;
        for _ in 0..2 {
            let frame = peer.recv().await;
            match frame.header.to {
                0x02 => id_two = Some(frame.header.id),
                0x03 => id_three = Some(frame.header.id),
                other => panic!("unexpected destination {:#04x}", other),
            }
        }
        let (id_two, id_three) = (id_two.unwrap(), id_three.unwrap());
        assert_ne!(id_two, id_three);

        // Right id, wrong sender: must not complete the send to 0x02.
        peer.send(Header::new(0x01, 0x03, id_two, HeaderFlags::ACK), b"!").await;
        peer.send(Header::new(0x01, 0x03, id_three, HeaderFlags::ACK), b"!").await;
        send_three.await.unwrap().unwrap();
        assert!(!send_two.is_finished());

        peer.send(Header::new(0x01, 0x02, id_two, HeaderFlags::ACK), b"!").await;
        send_two.await.unwrap().unwrap();
        assert_eq!(manager.retransmissions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_numbers_advance() {
        let (manager, mut peer) = setup(0x01, 0x02).await;

        for expected in 1..=3u8 {
            let sender = manager.clone();
            let send = tokio::spawn(async move { sender.sendto_wait(b"n", 0x02).await });
            let frame = peer.recv().await;
            assert_eq!(frame.header.id, expected);
            peer.send(Header::new(0x01, 0x02, expected, HeaderFlags::ACK), b"!").await;
            send.await.unwrap().unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_is_reacked_and_delivered_once() {
        let (manager, mut peer) = setup(0x01, 0x02).await;
        let mut events = manager.take_events().unwrap();

        let header = Header::new(0x01, 0x02, 0x05, HeaderFlags::NONE);
        peer.send(header, b"once").await;
        peer.send(header, b"once").await;

        for _ in 0..2 {
            let ack = peer.recv().await;
            assert_eq!(ack.header, Header::new(0x02, 0x01, 0x05, HeaderFlags::ACK));
            assert_eq!(&ack.payload[..], b"!");
        }

        peer.send(Header::new(0x01, 0x02, 0x06, HeaderFlags::NONE), b"next").await;

        let first = next_message(&mut events).await;
        assert_eq!(first.id(), 0x05);
        assert_eq!(&first.data[..], b"once");
        let second = next_message(&mut events).await;
        assert_eq!(second.id(), 0x06);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_keeps_protocol_flags_only() {
        let (manager, mut peer) = setup(0x01, 0x02).await;
        manager
            .datagram()
            .set_header_flags(HeaderFlags::from_bits(0x43), HeaderFlags::NONE);

        peer.send(Header::new(0x01, 0x02, 0x09, HeaderFlags::NONE), b"x").await;
        let ack = peer.recv().await;
        assert_eq!(ack.header.flags.bits(), 0xC0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_resolves_without_ack() {
        let (manager, mut peer) = setup(0x01, 0x02).await;

        manager.sendto_wait(b"all", BROADCAST_ADDRESS).await.unwrap();
        assert_eq!(manager.retransmissions(), 0);

        let frame = peer.recv().await;
        assert!(frame.header.is_broadcast());
        assert_eq!(frame.header.id, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_delivered_without_ack_or_dedup() {
        let (manager, mut peer) = setup(0x01, 0x02).await;
        let mut events = manager.take_events().unwrap();

        let header = Header::new(BROADCAST_ADDRESS, 0x02, 0x09, HeaderFlags::NONE);
        peer.send(header, b"news").await;
        peer.send(header, b"news").await;

        assert_eq!(next_message(&mut events).await.id(), 0x09);
        assert_eq!(next_message(&mut events).await.id(), 0x09);

        manager.close().await.unwrap();
        assert!(peer.rest().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_promiscuous_dedup_without_ack() {
        let (manager, mut peer) = setup(0x01, 0x02).await;
        manager.set_promiscuous(true);
        let mut events = manager.take_events().unwrap();

        let header = Header::new(0x03, 0x02, 0x07, HeaderFlags::NONE);
        peer.send(header, b"overheard").await;
        peer.send(header, b"overheard").await;
        peer.send(Header::new(0x03, 0x02, 0x08, HeaderFlags::NONE), b"more").await;

        assert_eq!(next_message(&mut events).await.id(), 0x07);
        assert_eq!(next_message(&mut events).await.id(), 0x08);

        manager.close().await.unwrap();
        assert!(peer.rest().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_payload_rejected() {
        let (manager, mut peer) = setup(0x01, 0x02).await;

        let err = manager.sendto_wait(b"", 0x02).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        manager.close().await.unwrap();
        assert!(peer.rest().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_settles_pending_send() {
        let (manager, mut peer) = setup(0x01, 0x02).await;
        manager.set_timeout(Duration::from_secs(60));

        let sender = manager.clone();
        let send = tokio::spawn(async move { sender.sendto_wait(b"late", 0x02).await });

        peer.recv().await;
        manager.close().await.unwrap();

        let err = send.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Closed));
    }

    #[tokio::test]
    async fn test_send_before_init_fails() {
        let (transport, _stream) = MemoryTransport::with_peer();
        let manager = ReliableDatagram::new(transport, 0x01);

        let err = manager.sendto_wait(b"early", 0x02).await.unwrap_err();
        assert!(matches!(err, Error::NotOpen));
        assert!(lock(&manager.shared.pending).is_empty());
    }

    #[test]
    fn test_accessors() {
        let (transport, _stream) = MemoryTransport::with_peer();
        let manager = ReliableDatagram::new(transport, 0x01);
        assert_eq!(manager.retries(), DEFAULT_RETRIES);
        assert_eq!(manager.timeout(), Duration::from_millis(DEFAULT_TIMEOUT_MS));

        manager.set_retries(7);
        manager.set_timeout(Duration::from_millis(500));
        assert_eq!(manager.retries(), 7);
        assert_eq!(manager.timeout(), Duration::from_millis(500));
    }
}
