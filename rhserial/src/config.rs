use std::time::Duration;

use crate::core::BROADCAST_ADDRESS;
use crate::{DEFAULT_RETRIES, DEFAULT_TIMEOUT_MS};

/// Settings for a [`Node`](crate::Node).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Address of this node, 1..=254.
    pub address: u8,
    /// Use acknowledged delivery.
    pub reliable: bool,
    /// Receive frames addressed to any node.
    pub promiscuous: bool,
    /// Minimum wait for an acknowledgement.
    pub timeout: Duration,
    /// Retransmissions after the first attempt.
    pub retries: u32,
}

impl Config {
    pub fn new(address: u8) -> Self {
        Self {
            address,
            reliable: true,
            promiscuous: false,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            retries: DEFAULT_RETRIES,
        }
    }

    pub fn with_reliable(mut self, reliable: bool) -> Self {
        self.reliable = reliable;
        self
    }

    pub fn with_promiscuous(mut self, promiscuous: bool) -> Self {
        self.promiscuous = promiscuous;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(BROADCAST_ADDRESS - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders() {
        let config = Config::new(0x05)
            .with_reliable(false)
            .with_promiscuous(true)
            .with_timeout(Duration::from_millis(50))
            .with_retries(1);

        assert_eq!(config.address, 0x05);
        assert!(!config.reliable);
        assert!(config.promiscuous);
        assert_eq!(config.timeout, Duration::from_millis(50));
        assert_eq!(config.retries, 1);
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.address, 0xFE);
        assert!(config.reliable);
        assert_eq!(config.retries, DEFAULT_RETRIES);
        assert_eq!(config.timeout, Duration::from_millis(DEFAULT_TIMEOUT_MS));
    }
}
