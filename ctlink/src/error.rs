//! Error types for ctlink.

use std::io;
use thiserror::Error;

/// Result type for ctlink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for ctlink operations.
///
/// Codec integrity failures ([`crate::protocol::FrameError`]) never appear
/// here directly; connectors discard the corrupt unit or translate it into an
/// exchange error.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// No controller matched the selection criteria.
    #[error("No device found")]
    NoDeviceFound,

    /// Selection could not be completed.
    #[error("Selection failed: {0}")]
    SelectionFailed(String),

    /// The user dismissed the selection prompt.
    #[error("User canceled selection")]
    UserCanceledSelection,

    /// The link could not be established within the timeout.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// An operation required a selected device.
    #[error("Device not selected")]
    DeviceNotSelected,

    /// An operation required a connected device.
    #[error("Device disconnected")]
    DeviceDisconnected,

    /// The peer kept rejecting a write until the retries ran out.
    #[error("Write failed after {attempts} attempt(s)")]
    WriteFailed {
        /// Number of attempts made.
        attempts: u32,
    },

    /// The peer did not answer within the exchange budget.
    #[error("Response timeout after {elapsed_ms} ms")]
    ResponseTimeout {
        /// Milliseconds spent waiting.
        elapsed_ms: u64,
    },

    /// Teardown did not complete in time.
    #[error("Disconnect timeout")]
    DisconnectTimeout,

    /// Writing the clock to the peer failed permanently.
    #[error("Clock write failed")]
    ClockWriteFailed,

    /// Reading the clock from the peer failed permanently.
    #[error("Clock read failed")]
    ClockReadFailed,

    /// The firmware update session was abandoned.
    #[error("Firmware update failed: {0}")]
    UpdateFailed(String),

    /// Payload does not fit the transport in a single unacknowledged write.
    #[error("Payload too large: {len} bytes exceeds {max}")]
    PayloadTooLarge {
        /// Payload length.
        len: usize,
        /// Largest accepted length.
        max: usize,
    },

    /// Malformed or unexpected data from the peer.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Unsupported operation on this connector.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The embedding application requested a stop.
    #[error("Interrupted")]
    Interrupted,

    /// The engine context has not been initialised or was torn down.
    #[error("Engine not initialized")]
    EngineNotInitialized,
}

/// Coarse error classes used to decide retry and teardown policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Selection errors, surfaced immediately without retry.
    Selection,
    /// Connection errors, caller may re-select or reconnect.
    Connection,
    /// Exchange errors, retried internally before surfacing.
    Exchange,
    /// Clock and firmware update errors.
    Update,
    /// Everything else (I/O, configuration, protocol).
    Other,
}

impl Error {
    /// Classify this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NoDeviceFound | Self::SelectionFailed(_) | Self::UserCanceledSelection => {
                ErrorCategory::Selection
            },
            Self::ConnectionFailed(_) | Self::DeviceNotSelected | Self::DeviceDisconnected => {
                ErrorCategory::Connection
            },
            Self::WriteFailed { .. }
            | Self::ResponseTimeout { .. }
            | Self::DisconnectTimeout
            | Self::PayloadTooLarge { .. } => ErrorCategory::Exchange,
            Self::ClockWriteFailed | Self::ClockReadFailed | Self::UpdateFailed(_) => {
                ErrorCategory::Update
            },
            _ => ErrorCategory::Other,
        }
    }

    /// Whether this error means the link must be considered dead.
    pub fn forces_disconnect(&self) -> bool {
        matches!(self, Self::ResponseTimeout { .. } | Self::DeviceDisconnected)
    }

    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        !self.forces_disconnect()
            && !matches!(
                self.category(),
                ErrorCategory::Selection | ErrorCategory::Connection
            )
            && !matches!(
                self,
                Self::Interrupted
                    | Self::EngineNotInitialized
                    | Self::Config(_)
                    | Self::Unsupported(_)
                    | Self::PayloadTooLarge { .. }
            )
    }
}
