//! Transport layer abstraction.
//!
//! This module provides the `Transport` trait that opens the byte link the
//! protocol runs on (serial device, TCP bridge, Unix socket, in-memory pipe).
//!
//! # Implementations
//!
//! - `Target`: real links (TCP connect, TCP accept, Unix socket, serial port)
//! - `MemoryTransport`: in-memory duplex pipe for tests
//!
//! # Example
//!
//! ```rust,ignore
//! use rhserial::transport::{Target, Transport};
//!
//! let target = Target::device("/dev/ttyUSB0", 9600);
//! let link = target.open().await?;
//! ```

mod memory;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use futures::future::BoxFuture;
use log::info;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, StopBits};

use crate::error::Error;

pub use memory::MemoryTransport;

/// Baud rate used when a device target does not name one.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Read half of an open link.
pub type LinkReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of an open link.
pub type LinkWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An open byte link.
pub struct Link {
    pub reader: LinkReader,
    pub writer: LinkWriter,
}

impl Link {
    /// Splits a bidirectional stream into a link.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Link")
    }
}

/// Opens the byte link the driver talks over.
///
/// Closing is done by the driver: it shuts the writer down and drops the
/// reader.
pub trait Transport: Send + Sync {
    /// Opens the link.
    fn open(&self) -> BoxFuture<'_, io::Result<Link>>;
}

/// Links reachable from the host.
#[derive(Debug, Clone)]
pub enum Target {
    /// Connect to a TCP serial bridge (ser2net, socat, ...).
    Tcp(SocketAddr),
    /// Listen on a TCP address and use the first accepted connection.
    TcpListen(SocketAddr),
    /// Connect to a Unix domain socket.
    #[cfg(unix)]
    Unix(PathBuf),
    /// Open a serial port at `baud`, 8 data bits, no parity, one stop bit.
    Device { path: PathBuf, baud: u32 },
}

impl Target {
    /// Serial port target.
    pub fn device(path: impl Into<PathBuf>, baud: u32) -> Self {
        Target::Device {
            path: path.into(),
            baud,
        }
    }

    /// Replaces the baud rate of a device target; other targets are returned
    /// unchanged.
    pub fn with_baud(self, baud: u32) -> Self {
        match self {
            Target::Device { path, .. } => Target::Device { path, baud },
            other => other,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Tcp(addr) => write!(f, "tcp://{}", addr),
            Target::TcpListen(addr) => write!(f, "tcp-listen://{}", addr),
            #[cfg(unix)]
            Target::Unix(path) => write!(f, "unix://{}", path.display()),
            Target::Device { path, baud } => write!(f, "{}@{}", path.display(), baud),
        }
    }
}

impl FromStr for Target {
    type Err = Error;

    /// Parses the form printed by `Display`. Anything without a scheme is a
    /// serial port path, optionally followed by `@baud`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let socket = |addr: &str| {
            addr.parse::<SocketAddr>()
                .map_err(|_| Error::InvalidArgument("invalid socket address"))
        };

        if let Some(addr) = s.strip_prefix("tcp-listen://") {
            Ok(Target::TcpListen(socket(addr)?))
        } else if let Some(addr) = s.strip_prefix("tcp://") {
            Ok(Target::Tcp(socket(addr)?))
        } else if let Some(path) = s.strip_prefix("unix://") {
            #[cfg(unix)]
            return Ok(Target::Unix(path.into()));
            #[cfg(not(unix))]
            return Err(Error::InvalidArgument("unix sockets are not supported here"));
        } else if s.is_empty() {
            Err(Error::InvalidArgument("empty link target"))
        } else {
            match s.rsplit_once('@') {
                Some((path, baud)) if !path.is_empty() => {
                    let baud = baud
                        .parse()
                        .map_err(|_| Error::InvalidArgument("invalid baud rate"))?;
                    Ok(Target::device(path, baud))
                }
                _ => Ok(Target::device(s, DEFAULT_BAUD_RATE)),
            }
        }
    }
}

impl Transport for Target {
    fn open(&self) -> BoxFuture<'_, io::Result<Link>> {
        Box::pin(async move {
            info!("Opening link {}", self);
            match self {
                Target::Tcp(addr) => {
                    let stream = tokio::net::TcpStream::connect(addr).await?;
                    stream.set_nodelay(true)?;
                    info!("TCP link connected.");
                    Ok(Link::from_stream(stream))
                }
                Target::TcpListen(addr) => {
                    let listener = tokio::net::TcpListener::bind(addr).await?;
                    info!("Waiting for a peer on {}", addr);
                    let (stream, peer) = listener.accept().await?;
                    stream.set_nodelay(true)?;
                    info!("Peer {} connected.", peer);
                    Ok(Link::from_stream(stream))
                }
                #[cfg(unix)]
                Target::Unix(path) => {
                    let stream = tokio::net::UnixStream::connect(path).await?;
                    info!("Unix socket connected.");
                    Ok(Link::from_stream(stream))
                }
                Target::Device { path, baud } => {
                    let stream = tokio_serial::new(path.to_string_lossy(), *baud)
                        .data_bits(DataBits::Eight)
                        .stop_bits(StopBits::One)
                        .parity(Parity::None)
                        .flow_control(FlowControl::None)
                        .open_native_async()?;
                    info!("Serial port opened at {} baud.", baud);
                    Ok(Link::from_stream(stream))
                }
            }
        })
    }
}
