//! Byte transport under the serial connector.
//!
//! [`SerialConnector`](crate::SerialConnector) frames requests and scans
//! for markers on top of a [`Port`]. The native implementation wraps the
//! `serialport` crate; tests substitute an in-memory port.

#[cfg(feature = "native")]
pub mod native;

use {
    crate::error::Result,
    log::debug,
    std::{
        io::{self, ErrorKind, Read, Write},
        thread,
        time::Duration,
    },
};

/// How long EN is held low when rebooting the gateway.
pub const RESET_HOLD: Duration = Duration::from_millis(100);

/// What is needed to open a gateway port. The line is always 8N1 without
/// flow control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSettings {
    /// Device path ("/dev/ttyUSB0", "COM3").
    pub path: String,
    /// Line speed.
    pub baud_rate: u32,
    /// Upper bound on a single blocking read.
    pub read_timeout: Duration,
}

impl PortSettings {
    pub fn new(path: impl Into<String>, baud_rate: u32, read_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            read_timeout,
        }
    }
}

/// An open link to the gateway.
///
/// A read that finds nothing within the read timeout fails with an error
/// [`is_idle_error`] accepts.
pub trait Port: Read + Write + Send {
    /// Device path the port was opened on.
    fn name(&self) -> &str;

    /// Drop whatever is buffered in either direction.
    fn clear_buffers(&mut self) -> Result<()>;

    fn set_dtr(&mut self, level: bool) -> Result<()>;

    fn set_rts(&mut self, level: bool) -> Result<()>;

    /// Release the device. Later reads and writes fail.
    fn close(&mut self) -> Result<()>;

    /// Write a whole frame and flush it onto the wire.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        self.write_all(buf)?;
        self.flush()?;
        Ok(())
    }
}

/// Reboot the gateway. The USB bridge wires RTS to EN, so raising RTS for
/// `hold` with DTR low restarts the controller into its application.
pub fn pulse_reset(port: &mut dyn Port, hold: Duration) -> Result<()> {
    debug!("Rebooting gateway on {}", port.name());
    port.set_dtr(false)?;
    port.set_rts(true)?;
    thread::sleep(hold);
    port.set_rts(false)?;
    Ok(())
}

/// Whether a read error just means the line was quiet.
pub fn is_idle_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
    )
}

#[cfg(feature = "native")]
pub use native::NativePort;
