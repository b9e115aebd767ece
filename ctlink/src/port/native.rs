//! Gateway port on a real serial device.

use {
    crate::{
        error::{Error, Result},
        port::{Port, PortSettings},
    },
    log::{debug, trace, warn},
    serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits},
    std::{
        io::{self, ErrorKind, Read, Write},
        thread,
        time::Duration,
    },
};

/// The gateway re-enumerates for a moment after a reset, so opening is
/// retried a few times.
const OPEN_ATTEMPTS: usize = 3;
const OPEN_BACKOFF: Duration = Duration::from_millis(500);

/// A `serialport` device held by the serial connector.
pub struct NativePort {
    device: Option<Box<dyn SerialPort>>,
    path: String,
}

impl NativePort {
    /// Open `settings.path` as 8N1 with no flow control.
    pub fn open(settings: &PortSettings) -> Result<Self> {
        let device = serialport::new(&settings.path, settings.baud_rate)
            .timeout(settings.read_timeout)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open()?;
        debug!("Opened {} at {} baud", settings.path, settings.baud_rate);

        Ok(Self {
            device: Some(device),
            path: settings.path.clone(),
        })
    }

    /// [`open`](Self::open), retrying while the device is busy or missing.
    pub fn open_with_retry(settings: &PortSettings) -> Result<Self> {
        let mut failure = None;
        for attempt in 1..=OPEN_ATTEMPTS {
            match Self::open(settings) {
                Ok(port) => return Ok(port),
                Err(e) => {
                    warn!("{}: open attempt {attempt}/{OPEN_ATTEMPTS} failed: {e}", settings.path);
                    failure = Some(e);
                    if attempt < OPEN_ATTEMPTS {
                        thread::sleep(OPEN_BACKOFF);
                    }
                },
            }
        }
        Err(failure.unwrap_or(Error::NoDeviceFound))
    }

    fn device(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.device
            .as_mut()
            .ok_or_else(|| io::Error::new(ErrorKind::NotConnected, "port closed"))
    }
}

impl Port for NativePort {
    fn name(&self) -> &str {
        &self.path
    }

    fn clear_buffers(&mut self) -> Result<()> {
        if let Some(device) = self.device.as_mut() {
            device.clear(ClearBuffer::All)?;
        }
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        trace!("{}: DTR {level}", self.path);
        if let Some(device) = self.device.as_mut() {
            device.write_data_terminal_ready(level)?;
        }
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        trace!("{}: RTS {level}", self.path);
        if let Some(device) = self.device.as_mut() {
            device.write_request_to_send(level)?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.device.take().is_some() {
            debug!("Closed {}", self.path);
        }
        Ok(())
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.device()?.read(buf)
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.device()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.device()?.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_device_fails() {
        let settings = PortSettings::new(
            "/dev/ctlink-does-not-exist",
            115200,
            Duration::from_millis(10),
        );
        assert!(NativePort::open(&settings).is_err());
    }
}
