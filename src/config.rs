//! Session configuration.

use std::time::Duration;

use crate::error::Error;

/// Default capacity of the accept queue.
pub const DEFAULT_ACCEPT_BACKLOG: usize = 256;

/// Default per-stream receive window in bytes.
pub const DEFAULT_STREAM_WINDOW: u32 = 256 * 1024;

/// Tunables for a [`Session`](crate::Session).
///
/// The window size doubles as the peer's assumed initial send credit, so both
/// endpoints of a connection must agree on it when deviating from the
/// default.
#[derive(Debug, Clone)]
pub struct Config {
    /// How many peer-opened streams may sit unaccepted before further SYNs
    /// are refused with a reset.
    pub accept_backlog: usize,

    /// Whether to run the background keepalive pinger.
    pub enable_keepalive: bool,

    /// Interval between keepalive pings.
    pub keepalive_interval: Duration,

    /// Per-stream receive window and buffer capacity in bytes.
    pub max_stream_window_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            accept_backlog: DEFAULT_ACCEPT_BACKLOG,
            enable_keepalive: true,
            keepalive_interval: Duration::from_secs(30),
            max_stream_window_size: DEFAULT_STREAM_WINDOW,
        }
    }
}

impl Config {
    /// Check the configuration for values the protocol cannot operate with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the offending field.
    pub fn validate(&self) -> Result<(), Error> {
        if self.accept_backlog == 0 {
            return Err(Error::Config("accept backlog must be at least 1"));
        }
        if self.enable_keepalive && self.keepalive_interval.is_zero() {
            return Err(Error::Config("keepalive interval must be nonzero"));
        }
        if self.max_stream_window_size == 0 {
            return Err(Error::Config("stream window must be nonzero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.accept_backlog, 256);
        assert_eq!(config.max_stream_window_size, 262_144);
        assert!(config.enable_keepalive);
        assert_eq!(config.keepalive_interval, Duration::from_secs(30));
    }

    #[test]
    fn rejects_zero_backlog() {
        let config = Config {
            accept_backlog: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_zero_keepalive_interval() {
        let config = Config {
            keepalive_interval: Duration::ZERO,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        // Tolerated when the keepalive task is disabled.
        let config = Config {
            enable_keepalive: false,
            keepalive_interval: Duration::ZERO,
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_window() {
        let config = Config {
            max_stream_window_size: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
