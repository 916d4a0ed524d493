//! Serial driver: runs the [`Framer`] over an open [`Link`].
//!
//! The driver owns the link. Reading happens in a spawned task that walks
//! every received chunk through the framer and publishes validated frames on
//! the event channel; writing is serialized through an async mutex so that
//! frames of concurrent senders never interleave on the wire.
//!
//! [`Link`]: crate::transport::Link

use std::sync::{Arc, Mutex, MutexGuard};

use futures::{SinkExt, StreamExt};
use log::{debug, error, info, trace};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::core::Frame;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::framer::{AddressFilter, Framer};
use crate::transport::{LinkReader, LinkWriter, Transport};

pub type EventSender = mpsc::UnboundedSender<Event>;
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Unaddressed, unreliable datagrams over a byte link.
pub struct Driver {
    transport: Box<dyn Transport>,
    filter: Arc<AddressFilter>,
    writer: tokio::sync::Mutex<Option<FramedWrite<LinkWriter, Framer>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    events_tx: EventSender,
    events_rx: Mutex<Option<EventReceiver>>,
}

impl Driver {
    /// Creates a driver for `transport`; nothing is opened until [`Driver::init`].
    pub fn new<T: Transport + 'static>(transport: T) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            transport: Box::new(transport),
            filter: Arc::new(AddressFilter::default()),
            writer: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Opens the link and starts receiving.
    pub async fn init(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if writer.is_some() {
            return Err(Error::AlreadyOpen);
        }

        let link = self.transport.open().await.map_err(|e| {
            error!("Failed to open link: {}", e);
            Error::Transport(e)
        })?;

        let mut framer = Framer::new(self.filter.clone());
        framer.start();
        let frames = FramedRead::new(link.reader, framer);
        *writer = Some(FramedWrite::new(link.writer, Framer::new(self.filter.clone())));

        let handle = tokio::spawn(read_loop(frames, self.events_tx.clone()));
        *lock(&self.reader) = Some(handle);

        info!("Driver started for address {:#04x}", self.filter.this_address());
        Ok(())
    }

    /// Shuts the link down.
    ///
    /// Closing a driver that is not open is a no-op.
    pub async fn close(&self) -> Result<()> {
        let writer = self.writer.lock().await.take();

        if let Some(handle) = lock(&self.reader).take() {
            if !handle.is_finished() {
                handle.abort();
                self.emit(Event::Stopped);
            }
        }

        match writer {
            Some(mut sink) => {
                sink.close().await?;
                info!("Driver closed");
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub async fn is_open(&self) -> bool {
        self.writer.lock().await.is_some()
    }

    /// Encodes and writes one frame, resolving once it has been flushed.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(Error::NotOpen)?;

        trace!(
            "Sending frame to={:#04x} from={:#04x} id={} flags={:#04x} len={}",
            frame.header.to,
            frame.header.from,
            frame.header.id,
            frame.header.flags.bits(),
            frame.payload.len()
        );

        sink.send(frame).await.inspect_err(|e| error!("Link write failed: {}", e))
    }

    pub fn filter(&self) -> &Arc<AddressFilter> {
        &self.filter
    }

    pub fn set_this_address(&self, address: u8) {
        self.filter.set_this_address(address);
    }

    pub fn set_promiscuous(&self, promiscuous: bool) {
        self.filter.set_promiscuous(promiscuous);
    }

    /// Takes the inbound event channel. Only the first call gets it.
    pub fn take_events(&self) -> Option<EventReceiver> {
        lock(&self.events_rx).take()
    }

    pub(crate) fn emit(&self, event: Event) {
        // Nobody listening is fine.
        let _ = self.events_tx.send(event);
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.reader).take() {
            handle.abort();
        }
    }
}

async fn read_loop(mut frames: FramedRead<LinkReader, Framer>, events: EventSender) {
    let _ = events.send(Event::Started);

    while let Some(result) = frames.next().await {
        match result {
            Ok(frame) => {
                trace!(
                    "Received frame to={:#04x} from={:#04x} id={} flags={:#04x} len={}",
                    frame.header.to,
                    frame.header.from,
                    frame.header.id,
                    frame.header.flags.bits(),
                    frame.payload.len()
                );
                if events.send(Event::Message(frame.into())).is_err() {
                    break;
                }
            }
            Err(e) => {
                error!("Link read failed: {}", e);
                let _ = events.send(Event::Error(e));
                break;
            }
        }
    }

    debug!("Receiver stopped");
    let _ = events.send(Event::Stopped);
}
