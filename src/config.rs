//! Link and driver configuration.
//!
//! [`LinkConfig`] holds the timing contract of the controller link and has
//! no defaults of its own. [`DriverConfig`] is the surrounding driver
//! configuration and supplies the defaults used by [`crate::Driver`].

use std::time::Duration;

use crate::error::{Error, Result};

/// Default time to wait for the controller's synchronous response.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time to wait for a transmit report after acceptance.
pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(65);

/// Default time to wait for the controller to acknowledge an abort.
pub const DEFAULT_ABORT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time to wait for the controller to restart after a soft reset.
pub const DEFAULT_SOFT_RESET_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of automatic retries after a successful soft reset.
pub const DEFAULT_RETRY_BUDGET: u8 = 1;

/// Default capacity of the diagnostic event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Timeouts and retry budget of a controller link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkConfig {
    /// Time to wait for the synchronous response to a send request.
    pub ack_timeout: Duration,
    /// Time to wait for the transmit report once a request was accepted.
    pub callback_timeout: Duration,
    /// Time to wait for the controller to acknowledge an abort.
    pub abort_timeout: Duration,
    /// Time to wait for the controller to announce readiness after a soft reset.
    pub soft_reset_timeout: Duration,
    /// Automatic retries allowed for retryable payloads after a soft reset.
    pub retry_budget: u8,
}

impl LinkConfig {
    /// Creates a link configuration.
    ///
    /// The soft reset confirmation timeout starts out equal to `abort_timeout`.
    #[must_use]
    pub const fn new(
        ack_timeout: Duration,
        callback_timeout: Duration,
        abort_timeout: Duration,
        retry_budget: u8,
    ) -> Self {
        Self {
            ack_timeout,
            callback_timeout,
            abort_timeout,
            soft_reset_timeout: abort_timeout,
            retry_budget,
        }
    }

    /// Sets the acknowledgment timeout.
    #[must_use]
    pub const fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Sets the callback timeout.
    #[must_use]
    pub const fn callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout = timeout;
        self
    }

    /// Sets the abort acknowledgment timeout.
    #[must_use]
    pub const fn abort_timeout(mut self, timeout: Duration) -> Self {
        self.abort_timeout = timeout;
        self
    }

    /// Sets the soft reset confirmation timeout.
    #[must_use]
    pub const fn soft_reset_timeout(mut self, timeout: Duration) -> Self {
        self.soft_reset_timeout = timeout;
        self
    }

    /// Sets the retry budget.
    #[must_use]
    pub const fn retry_budget(mut self, budget: u8) -> Self {
        self.retry_budget = budget;
        self
    }

    /// Checks the timing contract.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if any timeout is zero or the acknowledgment
    /// timeout is not shorter than the callback timeout.
    pub fn validate(&self) -> Result<()> {
        let timeouts = [
            ("ack_timeout", self.ack_timeout),
            ("callback_timeout", self.callback_timeout),
            ("abort_timeout", self.abort_timeout),
            ("soft_reset_timeout", self.soft_reset_timeout),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, t)| t.is_zero()) {
            return Err(Error::Config {
                reason: format!("{name} must be greater than zero"),
            });
        }
        if self.ack_timeout >= self.callback_timeout {
            return Err(Error::Config {
                reason: format!(
                    "ack_timeout ({:?}) must be shorter than callback_timeout ({:?})",
                    self.ack_timeout, self.callback_timeout
                ),
            });
        }
        Ok(())
    }
}

/// Configuration of a [`crate::Driver`].
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Controller link timing.
    pub link: LinkConfig,
    /// Soft-reset the controller after connecting and wait until it is ready.
    pub soft_reset_on_connect: bool,
    /// Capacity of the diagnostic event channel.
    pub event_capacity: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::new(
                DEFAULT_ACK_TIMEOUT,
                DEFAULT_CALLBACK_TIMEOUT,
                DEFAULT_ABORT_TIMEOUT,
                DEFAULT_RETRY_BUDGET,
            )
            .soft_reset_timeout(DEFAULT_SOFT_RESET_TIMEOUT),
            soft_reset_on_connect: false,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl DriverConfig {
    /// Sets the link configuration.
    #[must_use]
    pub const fn link(mut self, link: LinkConfig) -> Self {
        self.link = link;
        self
    }

    /// Enables or disables the soft reset after connecting.
    #[must_use]
    pub const fn soft_reset_on_connect(mut self, enabled: bool) -> Self {
        self.soft_reset_on_connect = enabled;
        self
    }

    /// Sets the event channel capacity.
    #[must_use]
    pub const fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_config_defaults() {
        let config = DriverConfig::default();
        assert_eq!(config.link.ack_timeout, DEFAULT_ACK_TIMEOUT);
        assert_eq!(config.link.callback_timeout, DEFAULT_CALLBACK_TIMEOUT);
        assert_eq!(config.link.retry_budget, 1);
        assert!(!config.soft_reset_on_connect);
        assert!(config.link.validate().is_ok());
    }

    #[test]
    fn test_link_config_builder() {
        let config = LinkConfig::new(
            Duration::from_millis(750),
            Duration::from_secs(2),
            Duration::from_secs(1),
            0,
        )
        .soft_reset_timeout(Duration::from_secs(3))
        .retry_budget(2);
        assert_eq!(config.abort_timeout, Duration::from_secs(1));
        assert_eq!(config.soft_reset_timeout, Duration::from_secs(3));
        assert_eq!(config.retry_budget, 2);
    }

    #[test]
    fn test_validate_rejects_ack_not_shorter_than_callback() {
        let config = LinkConfig::new(
            Duration::from_secs(2),
            Duration::from_secs(2),
            Duration::from_secs(1),
            0,
        );
        assert!(matches!(config.validate(), Err(Error::Config { .. })));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = LinkConfig::new(
            Duration::from_millis(750),
            Duration::from_secs(2),
            Duration::ZERO,
            0,
        );
        let err = config.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid configuration: abort_timeout must be greater than zero"
        );
    }
}
