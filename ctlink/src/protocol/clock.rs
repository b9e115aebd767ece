//! Clock sample wire layout.
//!
//! The minimal form is a single little-endian `u64` millisecond timestamp.
//! The extended form appends the synchronisation context the wireless
//! firmware reports:
//!
//! ```text
//! +-------+--------+----------+------+-----------+---------+---------+
//! | Clock | Origin | Timeline | Tngl | FW build  | History | Tngl    |
//! |  u64  |  u64   |   u64    | u64  |   u64     | fp u32  | fp u32  |
//! +-------+--------+----------+------+-----------+---------+---------+
//! ```

use {
    crate::error::{Error, Result},
    byteorder::{ByteOrder, LittleEndian, WriteBytesExt},
};

/// Length of the minimal clock sample.
pub const CLOCK_MINIMAL_LEN: usize = 8;

/// Length of the extended clock sample.
pub const CLOCK_EXTENDED_LEN: usize = 48;

/// Synchronisation context carried by the extended sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClockContext {
    /// Handle of the controller that originated the clock.
    pub origin_handle: u64,
    /// Timeline clock in milliseconds.
    pub timeline_clock: u64,
    /// Tngl clock in milliseconds.
    pub tngl_clock: u64,
    /// Firmware compile timestamp.
    pub fw_compile_timestamp: u64,
    /// Event history fingerprint.
    pub history_fingerprint: u32,
    /// Tngl fingerprint.
    pub tngl_fingerprint: u32,
}

/// A millisecond clock value reported by or sent to a controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClockSample {
    /// Clock value in milliseconds.
    pub clock_ms: u64,
    /// Extended fields, present on the 48-byte variant.
    pub context: Option<ClockContext>,
}

impl ClockSample {
    /// A minimal sample.
    pub fn new(clock_ms: u64) -> Self {
        Self {
            clock_ms,
            context: None,
        }
    }

    /// An extended sample.
    pub fn with_context(clock_ms: u64, context: ClockContext) -> Self {
        Self {
            clock_ms,
            context: Some(context),
        }
    }

    /// Serialize to the 8- or 48-byte wire form.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CLOCK_EXTENDED_LEN);
        buf.write_u64::<LittleEndian>(self.clock_ms).unwrap();
        if let Some(ctx) = &self.context {
            buf.write_u64::<LittleEndian>(ctx.origin_handle).unwrap();
            buf.write_u64::<LittleEndian>(ctx.timeline_clock).unwrap();
            buf.write_u64::<LittleEndian>(ctx.tngl_clock).unwrap();
            buf.write_u64::<LittleEndian>(ctx.fw_compile_timestamp).unwrap();
            buf.write_u32::<LittleEndian>(ctx.history_fingerprint).unwrap();
            buf.write_u32::<LittleEndian>(ctx.tngl_fingerprint).unwrap();
        }
        buf
    }

    /// Parse a clock sample.
    ///
    /// Anything from 8 up to 47 bytes is read as the minimal form; 48 bytes
    /// or more as the extended form.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CLOCK_MINIMAL_LEN {
            return Err(Error::Protocol(format!(
                "clock sample too short: {} bytes",
                bytes.len()
            )));
        }

        let clock_ms = LittleEndian::read_u64(&bytes[0..8]);
        if bytes.len() < CLOCK_EXTENDED_LEN {
            return Ok(Self::new(clock_ms));
        }

        Ok(Self::with_context(clock_ms, ClockContext {
            origin_handle: LittleEndian::read_u64(&bytes[8..16]),
            timeline_clock: LittleEndian::read_u64(&bytes[16..24]),
            tngl_clock: LittleEndian::read_u64(&bytes[24..32]),
            fw_compile_timestamp: LittleEndian::read_u64(&bytes[32..40]),
            history_fingerprint: LittleEndian::read_u32(&bytes[40..44]),
            tngl_fingerprint: LittleEndian::read_u32(&bytes[44..48]),
        }))
    }
}
