//! Finding the gateway among the host's serial ports.
//!
//! The gateway is an ESP32 board, reached either through its native USB
//! CDC port or through a USB-to-UART bridge. Ports are ranked by the USB
//! IDs they report so auto-selection lands on the gateway rather than on
//! some unrelated modem.

use {crate::connector::ControllerInfo, std::fmt};

#[cfg(feature = "native")]
use log::{debug, trace};

/// USB chip in front of a serial port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bridge {
    /// Espressif native USB serial/JTAG.
    EspressifUsb,
    /// WCH CH340/CH341/CH9102.
    Ch340,
    /// Silicon Labs CP210x.
    Cp210x,
    /// FTDI FT232 family.
    Ftdi,
    /// Prolific PL2303.
    Prolific,
    /// Anything else, including ports without USB ids.
    Unknown,
}

impl Bridge {
    /// Classify a port by its USB vendor and product ids.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        match (vid, pid) {
            (0x303A, _) => Self::EspressifUsb,
            (0x1A86, 0x7523 | 0x7522 | 0x5523 | 0x5512 | 0x55D4) => Self::Ch340,
            (0x10C4, 0xEA60 | 0xEA63 | 0xEA70 | 0xEA71) => Self::Cp210x,
            (0x0403, 0x6001 | 0x6010 | 0x6011 | 0x6014 | 0x6015) => Self::Ftdi,
            (0x067B, 0x2303 | 0x23A3 | 0x23C3 | 0x23D3) => Self::Prolific,
            _ => Self::Unknown,
        }
    }

    /// Whether the ids matched a bridge a gateway board ships with.
    pub fn is_known(self) -> bool {
        self != Self::Unknown
    }

    /// Lower is more likely to be the gateway. Dev boards ship with the
    /// native port, a CH340 or a CP210x.
    fn rank(self) -> u8 {
        match self {
            Self::EspressifUsb => 0,
            Self::Ch340 | Self::Cp210x => 1,
            Self::Ftdi | Self::Prolific => 2,
            Self::Unknown => 3,
        }
    }
}

impl fmt::Display for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::EspressifUsb => "Espressif USB",
            Self::Ch340 => "CH340/CH341",
            Self::Cp210x => "CP210x",
            Self::Ftdi => "FTDI",
            Self::Prolific => "PL2303",
            Self::Unknown => "Unknown",
        })
    }
}

/// A serial port seen on the host.
#[derive(Debug, Clone)]
pub struct DetectedPort {
    /// Device path, "/dev/ttyUSB0" or "COM3".
    pub name: String,
    /// Bridge chip classified from `vid`/`pid`.
    pub bridge: Bridge,
    /// USB vendor id, for USB ports.
    pub vid: Option<u16>,
    /// USB product id, for USB ports.
    pub pid: Option<u16>,
    /// USB manufacturer string as reported by the OS.
    pub manufacturer: Option<String>,
    /// USB product string as reported by the OS.
    pub product: Option<String>,
    /// USB serial number string.
    pub serial: Option<String>,
}

impl DetectedPort {
    /// A port the host reported without USB details.
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bridge: Bridge::Unknown,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    /// The port as a controller candidate. Name and address are both the
    /// device path.
    pub fn to_controller_info(&self) -> ControllerInfo {
        let mut info = ControllerInfo::new(self.name.clone(), self.name.clone());
        let bridge = self.bridge.is_known().then(|| self.bridge.to_string());
        info.detail = match (bridge, &self.product) {
            (Some(bridge), Some(product)) => Some(format!("{bridge} {product}")),
            (bridge, product) => bridge.or_else(|| product.clone()),
        };
        info
    }

    /// One display line: path, chip or raw ids, then the product string.
    pub fn describe(&self) -> String {
        let mut line = self.name.clone();
        if self.bridge.is_known() {
            line.push_str(&format!(" [{}]", self.bridge));
        } else if let (Some(vid), Some(pid)) = (self.vid, self.pid) {
            line.push_str(&format!(" [VID:{vid:04X} PID:{pid:04X}]"));
        }
        if let Some(product) = &self.product {
            line.push_str(&format!(" - {product}"));
        }
        line
    }
}

/// Ports currently present on the host.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            debug!("Port enumeration failed: {e}");
            return Vec::new();
        },
    };

    ports
        .into_iter()
        .map(|info| {
            let mut port = DetectedPort::plain(info.port_name);
            if let serialport::SerialPortType::UsbPort(usb) = info.port_type {
                port.bridge = Bridge::from_vid_pid(usb.vid, usb.pid);
                port.vid = Some(usb.vid);
                port.pid = Some(usb.pid);
                port.manufacturer = usb.manufacturer;
                port.product = usb.product;
                port.serial = usb.serial_number;
                trace!("{}: {:04X}:{:04X} ({})", port.name, usb.vid, usb.pid, port.bridge);
            }
            port
        })
        .collect()
}

/// Without the `native` feature there is nothing to enumerate.
#[cfg(not(feature = "native"))]
pub fn detect_ports() -> Vec<DetectedPort> {
    Vec::new()
}

/// The port most likely to be the gateway. Ties go to the port listed
/// first.
pub fn pick_best(ports: &[DetectedPort]) -> Option<&DetectedPort> {
    ports.iter().min_by_key(|p| p.bridge.rank())
}

pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    ports.iter().map(DetectedPort::describe).collect()
}
