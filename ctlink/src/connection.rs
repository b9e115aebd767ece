//! Peer identity.

use {
    crate::error::{Error, Result},
    std::{fmt, str::FromStr},
};

/// Transport a peer is reached over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum TransportKind {
    /// Not known or not applicable.
    #[default]
    Undefined,
    /// Short-range wireless (BLE).
    ShortRangeWireless,
    /// Serial (UART/USB CDC).
    Serial,
    /// WebSocket relay.
    WebSocket,
    /// In-process simulation.
    Simulated,
}

impl TransportKind {
    /// Short lowercase name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::ShortRangeWireless => "wireless",
            Self::Serial => "serial",
            Self::WebSocket => "websocket",
            Self::Simulated => "simulated",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Six-byte hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Address with every byte zero.
    pub const ZERO: Self = Self([0; 6]);

    /// Raw bytes.
    pub fn bytes(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(Error::Config(format!("invalid MAC address: {s}")));
        }

        let mut bytes = [0u8; 6];
        for (slot, part) in bytes.iter_mut().zip(parts) {
            *slot = u8::from_str_radix(part, 16)
                .map_err(|_| Error::Config(format!("invalid MAC address: {s}")))?;
        }
        Ok(Self(bytes))
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for MacAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for MacAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Peer address, either a hardware address or a textual one (port path,
/// relay URL).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerAddress {
    /// Hardware address.
    Mac(MacAddress),
    /// Textual address.
    Text(String),
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mac(mac) => mac.fmt(f),
            Self::Text(text) => f.write_str(text),
        }
    }
}

/// One logical peer.
///
/// Equality only looks at transport and address; signal strength is
/// informational.
#[derive(Debug, Clone)]
pub struct Connection {
    transport: TransportKind,
    address: PeerAddress,
    rssi: Option<i8>,
}

impl Connection {
    /// Create a connection without signal strength.
    pub fn new(transport: TransportKind, address: PeerAddress) -> Self {
        Self {
            transport,
            address,
            rssi: None,
        }
    }

    /// Connection for data originating on this host.
    pub fn local() -> Self {
        Self::new(TransportKind::Undefined, PeerAddress::Mac(MacAddress::ZERO))
    }

    /// Attach a signal strength reading.
    #[must_use]
    pub fn with_rssi(mut self, rssi: i8) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// Transport kind.
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Peer address.
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    /// Signal strength, `None` when not applicable.
    pub fn rssi(&self) -> Option<i8> {
        self.rssi
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.transport == other.transport && self.address == other.address
    }
}

impl Eq for Connection {}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.transport, self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_parse_and_display() {
        let mac: MacAddress = "12:34:56:78:9A:bc".parse().unwrap();
        assert_eq!(mac.bytes(), [0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC]);
        assert_eq!(mac.to_string(), "12:34:56:78:9a:bc");
        assert!("12:34".parse::<MacAddress>().is_err());
        assert!("zz:34:56:78:9a:bc".parse::<MacAddress>().is_err());
    }

    #[test]
    fn test_equality_ignores_rssi() {
        let addr = PeerAddress::Text("/dev/ttyUSB0".into());
        let a = Connection::new(TransportKind::Serial, addr.clone()).with_rssi(-40);
        let b = Connection::new(TransportKind::Serial, addr.clone());
        let c = Connection::new(TransportKind::Simulated, addr);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_local_connection() {
        let local = Connection::local();
        assert_eq!(local.transport(), TransportKind::Undefined);
        assert_eq!(local.rssi(), None);
        assert_eq!(local.to_string(), "undefined/00:00:00:00:00:00");
    }
}
