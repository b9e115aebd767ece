//! `ctlink.toml` handling.
//!
//! Settings come from, highest priority first: command-line flags, their
//! `CTLINK_*` environment variables, `./ctlink.toml`, then `config.toml`
//! in the per-user config directory. A file that cannot be read or parsed
//! is reported and skipped.

use {
    ctlink::LinkConfig,
    directories::ProjectDirs,
    log::{debug, info, warn},
    serde::{Deserialize, Serialize},
    std::{
        fs,
        path::{Path, PathBuf},
        time::Duration,
    },
};

/// Project-local config file, looked up in the working directory.
pub const LOCAL_CONFIG: &str = "ctlink.toml";

const GLOBAL_CONFIG: &str = "config.toml";

/// A USB id the user accepted as a gateway.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    pub vid: u16,
    pub pid: u16,
}

impl UsbDevice {
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        (self.vid, self.pid) == (vid, pid)
    }
}

/// `[connection]`: which controller to talk to and how to reach it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// "serial" or "simulated".
    pub connector: Option<String>,
    /// Gateway port, "/dev/ttyUSB0" or "COM3".
    pub serial: Option<String>,
    pub baud: Option<u32>,
    /// JSON network definition for the simulated connector.
    pub network: Option<PathBuf>,
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
}

/// `[link]`: exchange timing on top of [`LinkConfig::default`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkSection {
    /// Scale applied to the size-derived packet timeout.
    pub timeout_multiplier: Option<f64>,
    /// Floor for a single attempt's timeout.
    pub min_packet_timeout_ms: Option<u64>,
    /// Attempts per exchange.
    pub exchange_retries: Option<u32>,
    /// Reboot the gateway through DTR/RTS when connecting.
    pub serial_reset: Option<bool>,
    /// Small packets for constrained radios.
    pub constrained_radio: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub link: LinkSection,
}

impl Config {
    /// Merge the global file and then the local one.
    pub fn load() -> Self {
        let mut config = Self::default();
        let sources = Self::global_config_path()
            .into_iter()
            .chain(std::iter::once(PathBuf::from(LOCAL_CONFIG)));
        for path in sources {
            if let Some(layer) = Self::load_from_file(&path) {
                debug!("Config layer {}", path.display());
                config.merge(layer);
            }
        }
        config
    }

    /// Only the file named by `--config`.
    pub fn load_from_path(path: &Path) -> Self {
        Self::load_from_file(path).unwrap_or_else(|| {
            warn!("No usable config at {}, using defaults", path.display());
            Self::default()
        })
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        let text = fs::read_to_string(path)
            .map_err(|e| warn!("Cannot read {}: {e}", path.display()))
            .ok()?;
        toml::from_str(&text)
            .map_err(|e| warn!("Ignoring {}: {e}", path.display()))
            .ok()
    }

    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "ctlink").map(|dirs| dirs.config_dir().to_path_buf())
    }

    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join(GLOBAL_CONFIG))
    }

    /// Layer `other` on top: its set fields win, remembered USB ids
    /// accumulate.
    fn merge(&mut self, other: Self) {
        let (conn, mine) = (other.connection, &mut self.connection);
        mine.connector = conn.connector.or(mine.connector.take());
        mine.serial = conn.serial.or(mine.serial.take());
        mine.baud = conn.baud.or(mine.baud);
        mine.network = conn.network.or(mine.network.take());
        mine.timeout_ms = conn.timeout_ms.or(mine.timeout_ms);
        for device in conn.usb_device {
            if !mine.usb_device.contains(&device) {
                mine.usb_device.push(device);
            }
        }

        let (link, mine) = (other.link, &mut self.link);
        mine.timeout_multiplier = link.timeout_multiplier.or(mine.timeout_multiplier);
        mine.min_packet_timeout_ms = link.min_packet_timeout_ms.or(mine.min_packet_timeout_ms);
        mine.exchange_retries = link.exchange_retries.or(mine.exchange_retries);
        mine.serial_reset = link.serial_reset.or(mine.serial_reset);
        mine.constrained_radio = link.constrained_radio.or(mine.constrained_radio);
    }

    /// Library configuration for this run; `baud` from the command line
    /// beats the file.
    pub fn link_config(&self, baud: Option<u32>) -> LinkConfig {
        let section = &self.link;
        let mut link = LinkConfig::default();
        if let Some(multiplier) = section.timeout_multiplier {
            link = link.with_timeout_multiplier(multiplier);
        }
        if let Some(ms) = section.min_packet_timeout_ms {
            link = link.with_min_packet_timeout(Duration::from_millis(ms));
        }
        if let Some(retries) = section.exchange_retries {
            link = link.with_exchange_retries(retries);
        }
        if let Some(reset) = section.serial_reset {
            link = link.with_serial_reset(reset);
        }
        if let Some(constrained) = section.constrained_radio {
            link = link.with_constrained_radio(constrained);
        }
        if let Some(baud) = baud.or(self.connection.baud) {
            link = link.with_baud_rate(baud);
        }
        link
    }

    pub fn is_remembered(&self, vid: u16, pid: u16) -> bool {
        self.connection.usb_device.iter().any(|d| d.matches(vid, pid))
    }

    /// Persist a USB id as a known gateway. It goes to `./ctlink.toml`
    /// when that exists, otherwise to the global file.
    pub fn remember_usb_device(&mut self, vid: u16, pid: u16) -> anyhow::Result<()> {
        if self.is_remembered(vid, pid) {
            return Ok(());
        }
        let device = UsbDevice { vid, pid };

        let path = match Self::global_config_dir() {
            _ if Path::new(LOCAL_CONFIG).exists() => PathBuf::from(LOCAL_CONFIG),
            Some(dir) => {
                fs::create_dir_all(&dir)?;
                dir.join(GLOBAL_CONFIG)
            },
            None => PathBuf::from(LOCAL_CONFIG),
        };

        let mut stored = Self::load_from_file(&path).unwrap_or_default();
        stored.connection.usb_device.push(device);
        fs::write(&path, toml::to_string_pretty(&stored)?)?;
        self.connection.usb_device.push(device);
        info!("Remembered {vid:04X}:{pid:04X} in {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {super::*, tempfile::tempdir};

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.connection.connector.is_none());
        assert!(config.connection.serial.is_none());
        assert!(config.connection.usb_device.is_empty());
        assert!(config.link.exchange_retries.is_none());
    }

    #[test]
    fn test_is_remembered() {
        let mut config = Config::default();
        assert!(!config.is_remembered(0x2E8A, 0x000A));
        config.connection.usb_device.push(UsbDevice { vid: 0x2E8A, pid: 0x000A });
        assert!(config.is_remembered(0x2E8A, 0x000A));
        assert!(!config.is_remembered(0x2E8A, 0x000B));
    }

    #[test]
    fn test_usb_device_matches() {
        let device = UsbDevice {
            vid: 0x1A86,
            pid: 0x7523,
        };
        assert!(device.matches(0x1A86, 0x7523));
        assert!(!device.matches(0x1A86, 0x7522));
        assert!(!device.matches(0x10C4, 0x7523));
    }

    #[test]
    fn test_merge_overrides_set_fields_only() {
        let mut base = Config::default();
        base.connection.serial = Some("/dev/ttyUSB0".to_string());
        base.connection.baud = Some(115200);

        let mut other = Config::default();
        other.connection.baud = Some(921600);
        other.link.serial_reset = Some(false);
        base.merge(other);

        assert_eq!(base.connection.serial.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(base.connection.baud, Some(921600));
        assert_eq!(base.link.serial_reset, Some(false));
    }

    #[test]
    fn test_merge_usb_devices_deduplicated() {
        let mut base = Config::default();
        base.connection.usb_device.push(UsbDevice { vid: 0x1A86, pid: 0x7523 });

        let mut other = Config::default();
        other.connection.usb_device.push(UsbDevice { vid: 0x1A86, pid: 0x7523 });
        other.connection.usb_device.push(UsbDevice { vid: 0x10C4, pid: 0xEA60 });
        base.merge(other);

        assert_eq!(base.connection.usb_device.len(), 2);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
[connection]
connector = "simulated"
serial = "/dev/ttyUSB0"
baud = 921600
timeout_ms = 2500

[[connection.usb_device]]
vid = 6790
pid = 29987

[link]
min_packet_timeout_ms = 800
exchange_retries = 5
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.connection.connector.as_deref(), Some("simulated"));
        assert_eq!(config.connection.timeout_ms, Some(2500));
        assert_eq!(config.connection.usb_device[0].vid, 6790);
        assert_eq!(config.link.exchange_retries, Some(5));
    }

    #[test]
    fn test_config_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.connection.serial.is_none());
        assert!(config.link.timeout_multiplier.is_none());
    }

    #[test]
    fn test_link_config_applies_overrides() {
        let mut config = Config::default();
        config.connection.baud = Some(230400);
        config.link.min_packet_timeout_ms = Some(800);
        config.link.exchange_retries = Some(5);
        config.link.serial_reset = Some(false);

        let link = config.link_config(None);
        assert_eq!(link.baud_rate, 230400);
        assert_eq!(link.min_packet_timeout, Duration::from_millis(800));
        assert_eq!(link.exchange_retries, 5);
        assert!(!link.serial_reset_on_connect);

        assert_eq!(config.link_config(Some(9600)).baud_rate, 9600);
    }

    #[test]
    fn test_link_config_defaults() {
        assert_eq!(Config::default().link_config(None), LinkConfig::default());
    }

    #[test]
    fn test_load_from_path_valid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(
            &path,
            r#"
[connection]
serial = "/dev/ttyUSB1"
[link]
constrained_radio = true
"#,
        )
        .unwrap();

        let config = Config::load_from_path(&path);
        assert_eq!(config.connection.serial.as_deref(), Some("/dev/ttyUSB1"));
        assert_eq!(config.link.constrained_radio, Some(true));
    }

    #[test]
    fn test_load_from_path_invalid_falls_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "invalid toml [[[").unwrap();

        let config = Config::load_from_path(&path);
        assert!(config.connection.serial.is_none());
    }

    #[test]
    fn test_load_from_path_nonexistent() {
        let config = Config::load_from_path(Path::new("/nonexistent/path/config.toml"));
        assert!(config.connection.serial.is_none());
    }

    #[test]
    fn test_global_config_path_names_project() {
        if let Some(path) = Config::global_config_path() {
            let text = path.to_string_lossy();
            assert!(text.contains("ctlink"));
            assert!(text.ends_with("config.toml"));
        }
    }
}
