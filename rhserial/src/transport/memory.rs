use std::io;
use std::sync::Mutex;

use futures::future::BoxFuture;
use tokio::io::DuplexStream;

use super::{Link, Transport};

/// Default capacity of the in-memory pipe, in bytes per direction.
const DEFAULT_CAPACITY: usize = 4096;

/// An in-memory link, one end of a `tokio::io::duplex` pipe.
///
/// The link can be opened once; opening it again fails the way a busy
/// serial port would.
#[derive(Debug)]
pub struct MemoryTransport {
    stream: Mutex<Option<DuplexStream>>,
}

impl MemoryTransport {
    /// Wraps one end of a duplex pipe.
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            stream: Mutex::new(Some(stream)),
        }
    }

    /// Creates two transports connected to each other.
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(DEFAULT_CAPACITY);
        (Self::new(a), Self::new(b))
    }

    /// Creates a transport and hands back the raw far end of its pipe.
    pub fn with_peer() -> (Self, DuplexStream) {
        let (a, b) = tokio::io::duplex(DEFAULT_CAPACITY);
        (Self::new(a), b)
    }
}

impl Transport for MemoryTransport {
    fn open(&self) -> BoxFuture<'_, io::Result<Link>> {
        let stream = self
            .stream
            .lock()
            .map_err(|_| io::Error::other("memory transport lock poisoned"))
            .and_then(|mut slot| {
                slot.take().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::AddrInUse, "memory link already opened")
                })
            });

        Box::pin(async move { stream.map(Link::from_stream) })
    }
}
