//! Link timing and transport profile configuration.

use {
    crate::retry::RetryPolicy,
    std::time::Duration,
};

/// Default serial baud rate.
pub const DEFAULT_BAUD: u32 = 115200;

/// Default wireless packet size.
pub const WIRELESS_PACKET_SIZE: usize = 512;

/// Wireless packet size on constrained radios.
pub const WIRELESS_CONSTRAINED_PACKET_SIZE: usize = 208;

/// OTA chunk size on the serial link.
pub const SERIAL_OTA_CHUNK_SIZE: usize = 3984;

/// OTA chunk size on constrained wireless radios.
pub const WIRELESS_CONSTRAINED_OTA_CHUNK_SIZE: usize = 1008;

/// OTA chunk size on other wireless radios.
pub const WIRELESS_OTA_CHUNK_SIZE: usize = 4992;

/// Configuration shared by every connector built from one context.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct LinkConfig {
    /// Scale applied to the size-derived packet timeout.
    pub timeout_multiplier: f64,
    /// Lower bound of a single attempt's timeout.
    pub min_packet_timeout: Duration,
    /// Attempts for one exchange.
    pub exchange_retries: u32,
    /// Serial baud rate.
    pub baud_rate: u32,
    /// Pulse DTR/RTS before waiting for the session marker.
    pub serial_reset_on_connect: bool,
    /// Nominal wireless throughput used for timeout estimation, bits/s.
    pub wireless_bitrate: u32,
    /// Use the reduced wireless packet and OTA chunk sizes.
    pub constrained_radio: bool,
    /// Pause after OTA `BEGIN` while the controller erases flash.
    pub ota_erase_delay: Duration,
    /// Pause between OTA `WRITE`s.
    pub ota_write_pacing: Duration,
    /// Clock read/write retry policy.
    pub clock_retry: RetryPolicy,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            timeout_multiplier: 1.2,
            min_packet_timeout: Duration::from_millis(500),
            exchange_retries: 3,
            baud_rate: DEFAULT_BAUD,
            serial_reset_on_connect: true,
            wireless_bitrate: 64_000,
            constrained_radio: false,
            ota_erase_delay: Duration::from_millis(100),
            ota_write_pacing: Duration::ZERO,
            clock_retry: RetryPolicy::clock(),
        }
    }
}

impl LinkConfig {
    /// Set the timeout multiplier.
    #[must_use]
    pub fn with_timeout_multiplier(mut self, multiplier: f64) -> Self {
        self.timeout_multiplier = multiplier;
        self
    }

    /// Set the minimum packet timeout.
    #[must_use]
    pub fn with_min_packet_timeout(mut self, timeout: Duration) -> Self {
        self.min_packet_timeout = timeout;
        self
    }

    /// Set the number of exchange attempts.
    #[must_use]
    pub fn with_exchange_retries(mut self, retries: u32) -> Self {
        self.exchange_retries = retries;
        self
    }

    /// Set the serial baud rate.
    #[must_use]
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Enable or disable the DTR/RTS reset pulse.
    #[must_use]
    pub fn with_serial_reset(mut self, reset: bool) -> Self {
        self.serial_reset_on_connect = reset;
        self
    }

    /// Select the constrained radio profile.
    #[must_use]
    pub fn with_constrained_radio(mut self, constrained: bool) -> Self {
        self.constrained_radio = constrained;
        self
    }

    /// Set both OTA pauses.
    #[must_use]
    pub fn with_ota_pacing(mut self, erase_delay: Duration, write_pacing: Duration) -> Self {
        self.ota_erase_delay = erase_delay;
        self.ota_write_pacing = write_pacing;
        self
    }

    /// Set the clock retry policy.
    #[must_use]
    pub fn with_clock_retry(mut self, policy: RetryPolicy) -> Self {
        self.clock_retry = policy;
        self
    }

    /// Wireless packet size for the configured radio.
    pub fn wireless_packet_size(&self) -> usize {
        if self.constrained_radio {
            WIRELESS_CONSTRAINED_PACKET_SIZE
        } else {
            WIRELESS_PACKET_SIZE
        }
    }

    /// Wireless OTA chunk size for the configured radio.
    pub fn wireless_ota_chunk_size(&self) -> usize {
        if self.constrained_radio {
            WIRELESS_CONSTRAINED_OTA_CHUNK_SIZE
        } else {
            WIRELESS_OTA_CHUNK_SIZE
        }
    }
}
