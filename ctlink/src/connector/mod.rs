//! Transport connectors.
//!
//! A [`Connector`] adapts one transport to a common contract: pick a
//! controller, connect, exchange network/device/clock traffic, update
//! firmware, disconnect. Implementations:
//!
//! - [`serial::SerialConnector`]: framed serial link
//! - [`wireless::WirelessConnector`]: chunked GATT-style link
//! - [`simulated::SimulatedConnector`]: in-process controllers

pub mod serial;
pub mod simulated;
pub mod wireless;

use {
    crate::{
        connection::{Connection, MacAddress, PeerAddress, TransportKind},
        engine::LinkContext,
        error::{Error, Result},
        event::{ConnectorEvent, EventBus, LinkFlag},
        protocol::ClockSample,
    },
    log::{debug, info},
    std::{
        collections::BTreeMap,
        fmt,
        str::FromStr,
        sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc::Receiver},
        time::Duration,
    },
};

pub use {
    serial::SerialConnector,
    simulated::{NetworkDefinition, SimulatedConnector},
    wireless::{Characteristic, GattLink, Notification, WirelessConnector},
};

/// Available connector implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectorKind {
    /// Framed serial link.
    Serial,
    /// Short-range wireless link.
    Wireless,
    /// In-process simulation.
    Simulated,
}

impl ConnectorKind {
    /// Lowercase name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Serial => "serial",
            Self::Wireless => "wireless",
            Self::Simulated => "simulated",
        }
    }

    /// Transport this connector talks over.
    pub fn transport(self) -> TransportKind {
        match self {
            Self::Serial => TransportKind::Serial,
            Self::Wireless => TransportKind::ShortRangeWireless,
            Self::Simulated => TransportKind::Simulated,
        }
    }
}

impl fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ConnectorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "serial" => Ok(Self::Serial),
            "wireless" | "ble" => Ok(Self::Wireless),
            "simulated" | "dummy" => Ok(Self::Simulated),
            other => Err(Error::Unsupported(format!("connector '{other}'"))),
        }
    }
}

/// Lifecycle state of a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    /// No controller chosen.
    Unselected,
    /// Controller chosen, link down.
    Selected,
    /// Link up.
    Connected,
    /// Link being torn down.
    Disconnecting,
}

/// A controller a connector can talk to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerInfo {
    /// Display name.
    pub name: String,
    /// Transport-specific address (port path, radio id, simulated name).
    pub address: String,
    /// Hardware address, if known.
    pub mac: Option<MacAddress>,
    /// Signal strength, if applicable.
    pub rssi: Option<i8>,
    /// Extra description (bridge chip, product string).
    pub detail: Option<String>,
}

impl ControllerInfo {
    /// Describe a controller by name and address.
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            mac: None,
            rssi: None,
            detail: None,
        }
    }

    /// Connection identity for traffic from this controller.
    pub fn connection(&self, transport: TransportKind) -> Connection {
        let address = match self.mac {
            Some(mac) => PeerAddress::Mac(mac),
            None => PeerAddress::Text(self.address.clone()),
        };
        let connection = Connection::new(transport, address);
        match self.rssi {
            Some(rssi) => connection.with_rssi(rssi),
            None => connection,
        }
    }
}

impl fmt::Display for ControllerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if self.address != self.name {
            write!(f, " ({})", self.address)?;
        }
        if let Some(mac) = self.mac {
            write!(f, " [{mac}]")?;
        }
        if let Some(detail) = &self.detail {
            write!(f, " - {detail}")?;
        }
        Ok(())
    }
}

/// Filter applied when scanning or selecting. Empty fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionCriteria {
    /// Exact controller name.
    pub name: Option<String>,
    /// Substring of the address.
    pub address: Option<String>,
    /// Hardware address.
    pub mac: Option<MacAddress>,
}

impl SelectionCriteria {
    /// Match by name.
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Match by address substring.
    pub fn by_address(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Self::default()
        }
    }

    /// Whether `info` satisfies this filter.
    pub fn matches(&self, info: &ControllerInfo) -> bool {
        self.name
            .as_ref()
            .is_none_or(|name| *name == info.name)
            && self
                .address
                .as_ref()
                .is_none_or(|address| info.address.contains(address.as_str()))
            && self
                .mac
                .is_none_or(|mac| info.mac == Some(mac))
    }
}

/// Candidates matching any of `criteria` (all candidates when empty).
pub fn filter_candidates(
    candidates: Vec<ControllerInfo>,
    criteria: &[SelectionCriteria],
) -> Vec<ControllerInfo> {
    if criteria.is_empty() {
        return candidates;
    }
    candidates
        .into_iter()
        .filter(|info| criteria.iter().any(|c| c.matches(info)))
        .collect()
}

/// Let `chooser` pick one of `candidates`.
pub fn choose(
    candidates: &[ControllerInfo],
    chooser: &mut dyn FnMut(&[ControllerInfo]) -> Option<usize>,
) -> Result<ControllerInfo> {
    if candidates.is_empty() {
        return Err(Error::NoDeviceFound);
    }
    match chooser(candidates) {
        Some(index) => candidates
            .get(index)
            .cloned()
            .ok_or_else(|| Error::SelectionFailed(format!("no candidate at index {index}"))),
        None => Err(Error::UserCanceledSelection),
    }
}

/// The transport-independent connector contract.
///
/// All methods take `&self`; implementations serialise exchanges internally
/// so a connector can be shared across threads.
pub trait Connector: Send + Sync {
    /// Which implementation this is.
    fn kind(&self) -> ConnectorKind;

    /// Current lifecycle state.
    fn state(&self) -> ConnectorState;

    /// Subscribe to this connector's events.
    fn events(&self) -> Receiver<ConnectorEvent>;

    /// List reachable controllers matching `criteria`.
    fn scan(&self, criteria: &[SelectionCriteria], timeout: Duration) -> Result<Vec<ControllerInfo>>;

    /// Select a controller chosen by `chooser` from the scan results.
    fn user_select(
        &self,
        criteria: &[SelectionCriteria],
        timeout: Duration,
        chooser: &mut dyn FnMut(&[ControllerInfo]) -> Option<usize>,
    ) -> Result<ControllerInfo>;

    /// Select the best controller matching `criteria` without asking.
    fn auto_select(&self, criteria: &[SelectionCriteria], timeout: Duration) -> Result<ControllerInfo>;

    /// The selected controller.
    fn selected(&self) -> Option<ControllerInfo>;

    /// Forget the selection, disconnecting first if needed.
    fn unselect(&self);

    /// Bring the link up to the selected controller.
    fn connect(&self, timeout: Duration) -> Result<ControllerInfo>;

    /// The connected controller.
    fn connected(&self) -> Option<ControllerInfo>;

    /// Tear the link down. Never fails; teardown faults are logged.
    fn disconnect(&self);

    /// Reliably send network bytecode.
    fn deliver(&self, payload: &[u8], timeout: Duration) -> Result<()>;

    /// Send network bytecode best-effort.
    fn transmit(&self, payload: &[u8], timeout: Duration) -> Result<()>;

    /// Send a device request, optionally reading back the response.
    fn request(&self, payload: &[u8], read_response: bool, timeout: Duration) -> Result<Option<Vec<u8>>>;

    /// Write the controller's clock.
    fn set_clock(&self, sample: &ClockSample) -> Result<()>;

    /// Read the controller's clock.
    fn get_clock(&self) -> Result<ClockSample>;

    /// Run a full firmware update.
    fn update_firmware(&self, firmware: &[u8]) -> Result<()>;

    /// Forward engine bytecode unless it came from this connector's peer.
    fn send_execute(&self, bytes: &[u8], source: &Connection) -> Result<()>;

    /// Forward a clock sample unless it came from this connector's peer.
    fn send_synchronize(&self, sample: &ClockSample, source: &Connection) -> Result<()>;

    /// Disconnect and release everything.
    fn destroy(&self);
}

#[derive(Debug)]
struct LifecycleInner {
    state: ConnectorState,
    selected: Option<ControllerInfo>,
    connected: Option<ControllerInfo>,
}

/// Selection and connection bookkeeping shared by every connector.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    inner: Mutex<LifecycleInner>,
    flag: LinkFlag,
    events: EventBus,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(LifecycleInner {
                state: ConnectorState::Unselected,
                selected: None,
                connected: None,
            }),
            flag: LinkFlag::new(),
            events: EventBus::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LifecycleInner> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) fn state(&self) -> ConnectorState {
        self.lock().state
    }

    pub(crate) fn selected(&self) -> Option<ControllerInfo> {
        self.lock().selected.clone()
    }

    pub(crate) fn connected(&self) -> Option<ControllerInfo> {
        self.lock().connected.clone()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.flag.is_connected()
    }

    pub(crate) fn select(&self, info: ControllerInfo) {
        info!("selected {info}");
        let mut inner = self.lock();
        inner.selected = Some(info);
        inner.state = ConnectorState::Selected;
    }

    pub(crate) fn unselect(&self) {
        let mut inner = self.lock();
        inner.selected = None;
        inner.state = ConnectorState::Unselected;
    }

    /// Enter `Disconnecting` if there is a link to tear down.
    pub(crate) fn begin_disconnect(&self) -> bool {
        let mut inner = self.lock();
        if inner.state == ConnectorState::Connected || self.flag.is_connected() {
            inner.state = ConnectorState::Disconnecting;
            true
        } else {
            false
        }
    }

    pub(crate) fn mark_connected(&self, info: ControllerInfo) {
        {
            let mut inner = self.lock();
            inner.connected = Some(info);
            inner.state = ConnectorState::Connected;
        }
        self.flag.set_connected(&self.events);
    }

    /// Record link loss. Emits `Disconnected` once per connection.
    pub(crate) fn mark_disconnected(&self) {
        {
            let mut inner = self.lock();
            inner.connected = None;
            inner.state = if inner.selected.is_some() {
                ConnectorState::Selected
            } else {
                ConnectorState::Unselected
            };
        }
        self.flag.set_disconnected(&self.events);
    }

    /// The connected controller, or the error explaining why there is none.
    pub(crate) fn require_connected(&self) -> Result<ControllerInfo> {
        let inner = self.lock();
        match (&inner.connected, &inner.selected) {
            (Some(info), _) if self.flag.is_connected() => Ok(info.clone()),
            (_, Some(_)) => Err(Error::DeviceDisconnected),
            (_, None) => Err(Error::DeviceNotSelected),
        }
    }
}

/// Whether traffic from `source` would echo back to `peer`.
pub fn is_echo(source: &Connection, peer: Option<&Connection>) -> bool {
    peer.is_some_and(|peer| peer == source)
}

/// Factory building a connector from the shared context.
pub type ConnectorFactory = Box<dyn Fn(Arc<LinkContext>) -> Result<Box<dyn Connector>> + Send + Sync>;

/// Maps connector kinds to factories.
pub struct ConnectorRegistry {
    factories: BTreeMap<ConnectorKind, ConnectorFactory>,
}

impl fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ConnectorRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with the connectors that need no external backend: the
    /// simulated connector and, with the `native` feature, serial.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(ConnectorKind::Simulated, |ctx| {
            Ok(Box::new(SimulatedConnector::new(ctx)))
        });
        #[cfg(feature = "native")]
        registry.register(ConnectorKind::Serial, |ctx| {
            Ok(Box::new(SerialConnector::new(ctx)))
        });
        registry
    }

    /// Register or replace the factory for `kind`.
    pub fn register<F>(&mut self, kind: ConnectorKind, factory: F)
    where
        F: Fn(Arc<LinkContext>) -> Result<Box<dyn Connector>> + Send + Sync + 'static,
    {
        debug!("registering {kind} connector");
        self.factories.insert(kind, Box::new(factory));
    }

    /// Registered kinds.
    pub fn kinds(&self) -> Vec<ConnectorKind> {
        self.factories.keys().copied().collect()
    }

    /// Build a connector of `kind`.
    pub fn create(&self, kind: ConnectorKind, ctx: Arc<LinkContext>) -> Result<Box<dyn Connector>> {
        let factory = self
            .factories
            .get(&kind)
            .ok_or_else(|| Error::Unsupported(format!("no {kind} connector available")))?;
        info!("creating {kind} connector");
        factory(ctx)
    }
}
