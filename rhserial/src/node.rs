//! Node façade over the datagram managers.

use std::time::Duration;

use log::{info, warn};

use crate::config::Config;
use crate::core::{BROADCAST_ADDRESS, DLE};
use crate::datagram::Datagram;
use crate::driver::EventReceiver;
use crate::error::{Error, Result};
use crate::reliable::ReliableDatagram;
use crate::transport::Transport;

enum Manager {
    Reliable(ReliableDatagram),
    Unreliable(Datagram),
}

/// One node on a serial network.
///
/// Picks the reliable or the plain datagram manager from its [`Config`].
/// Retry settings only mean something for reliable nodes; on others the
/// setters do nothing and the getters return zero.
pub struct Node {
    manager: Manager,
}

impl Node {
    /// Creates a node. Fails if the configured address is outside 1..=254.
    pub fn new<T: Transport + 'static>(transport: T, config: Config) -> Result<Self> {
        validate_address(config.address)?;

        let manager = if config.reliable {
            let manager = ReliableDatagram::new(transport, config.address);
            manager.set_timeout(config.timeout);
            manager.set_retries(config.retries);
            Manager::Reliable(manager)
        } else {
            Manager::Unreliable(Datagram::new(transport, config.address))
        };

        let node = Self { manager };
        node.set_promiscuous(config.promiscuous);
        Ok(node)
    }

    fn datagram(&self) -> &Datagram {
        match &self.manager {
            Manager::Reliable(m) => m.datagram(),
            Manager::Unreliable(m) => m,
        }
    }

    pub fn is_reliable(&self) -> bool {
        matches!(self.manager, Manager::Reliable(_))
    }

    pub async fn init(&self) -> Result<()> {
        match &self.manager {
            Manager::Reliable(m) => m.init().await?,
            Manager::Unreliable(m) => m.init().await?,
        }
        info!(
            "Node {:#04x} up ({})",
            self.address(),
            if self.is_reliable() { "reliable" } else { "unreliable" }
        );
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        match &self.manager {
            Manager::Reliable(m) => m.close().await,
            Manager::Unreliable(m) => m.close().await,
        }
    }

    /// Sends `data` to `to`; use [`BROADCAST_ADDRESS`] to reach every node.
    ///
    /// A reliable node resolves once the message is acknowledged.
    pub async fn send(&self, to: u8, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(Error::InvalidArgument("nothing to send"));
        }
        match &self.manager {
            Manager::Reliable(m) => m.sendto_wait(data, to).await,
            Manager::Unreliable(m) => m.sendto(data, to).await,
        }
    }

    /// Sends the first `len` bytes of `data`. A `len` of zero sends all of it.
    pub async fn send_len(&self, to: u8, data: &[u8], len: usize) -> Result<()> {
        let data = match len {
            0 => data,
            len => data
                .get(..len)
                .ok_or(Error::InvalidArgument("length exceeds buffer"))?,
        };
        self.send(to, data).await
    }

    /// Changes this node's address. Fails outside 1..=254.
    pub fn set_address(&self, address: u8) -> Result<()> {
        validate_address(address)?;
        self.datagram().set_this_address(address);
        Ok(())
    }

    pub fn address(&self) -> u8 {
        self.datagram().this_address()
    }

    pub fn set_retries(&self, retries: u32) {
        if let Manager::Reliable(m) = &self.manager {
            m.set_retries(retries);
        }
    }

    pub fn retries(&self) -> u32 {
        match &self.manager {
            Manager::Reliable(m) => m.retries(),
            Manager::Unreliable(_) => 0,
        }
    }

    pub fn set_timeout(&self, timeout: Duration) {
        if let Manager::Reliable(m) = &self.manager {
            m.set_timeout(timeout);
        }
    }

    pub fn timeout(&self) -> Duration {
        match &self.manager {
            Manager::Reliable(m) => m.timeout(),
            Manager::Unreliable(_) => Duration::ZERO,
        }
    }

    pub fn retransmissions(&self) -> u32 {
        match &self.manager {
            Manager::Reliable(m) => m.retransmissions(),
            Manager::Unreliable(_) => 0,
        }
    }

    pub fn reset_retransmissions(&self) {
        if let Manager::Reliable(m) = &self.manager {
            m.reset_retransmissions();
        }
    }

    /// Accept frames addressed to any node, not just this one.
    pub fn set_promiscuous(&self, promiscuous: bool) {
        self.datagram().set_promiscuous(promiscuous);
    }

    /// Takes the inbound event channel. Only the first call gets it.
    pub fn take_events(&self) -> Option<EventReceiver> {
        match &self.manager {
            Manager::Reliable(m) => m.take_events(),
            Manager::Unreliable(m) => m.take_events(),
        }
    }
}

fn validate_address(address: u8) -> Result<()> {
    if address == 0 || address == BROADCAST_ADDRESS {
        return Err(Error::InvalidArgument("node address must be in 1..=254"));
    }
    if is_unreachable_address(address) {
        warn!(
            "Node address {:#04x} is the DLE byte; frames sent to it cannot be decoded",
            address
        );
    }
    Ok(())
}

/// Header bytes go out unescaped, so a TO of `DLE` reads as an escape at the
/// receiver and the frame is dropped.
fn is_unreachable_address(address: u8) -> bool {
    address == DLE
}
