//! In-process simulated controllers.
//!
//! A simulated network runs entirely inside the host process. Each
//! controller keeps its own logical clock, records the network bytecode it
//! receives and accepts firmware updates, so applications and tests can
//! exercise the full connector contract without hardware.

use {
    super::{
        Connector, ConnectorKind, ConnectorState, ControllerInfo, Lifecycle, SelectionCriteria,
        choose, filter_candidates, is_echo,
    },
    crate::{
        config::WIRELESS_OTA_CHUNK_SIZE,
        connection::{Connection, MacAddress, TransportKind},
        engine::LinkContext,
        error::{Error, Result},
        event::ConnectorEvent,
        protocol::{ClockSample, OtaCommand},
        sync::LogicalClock,
        updater::OtaSequencer,
    },
    log::{debug, info, trace},
    std::{
        collections::HashSet,
        sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc::Receiver},
        time::Duration,
    },
};

/// Name of the controller created when no network is defined.
pub const DEFAULT_CONTROLLER_NAME: &str = "SIMULATED";

/// Port tags of the default controller.
pub const DEFAULT_PORT_TAGS: [char; 4] = ['A', 'B', 'C', 'D'];

/// Pixel count of each default port.
pub const DEFAULT_PORT_SIZE: u32 = 100;

/// One output port of a simulated controller.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PortDefinition {
    /// Port letter.
    pub tag: char,
    /// Number of pixels.
    pub size: u32,
}

/// One simulated controller.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ControllerDefinition {
    /// Controller name.
    pub name: String,
    /// Hardware address; derived from the position when absent.
    #[cfg_attr(feature = "serde", serde(default))]
    pub mac: Option<MacAddress>,
    /// Output ports.
    #[cfg_attr(feature = "serde", serde(default))]
    pub ports: Vec<PortDefinition>,
}

/// Controllers making up a simulated network.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NetworkDefinition {
    /// Controllers.
    pub controllers: Vec<ControllerDefinition>,
}

impl Default for NetworkDefinition {
    fn default() -> Self {
        Self {
            controllers: vec![ControllerDefinition {
                name: DEFAULT_CONTROLLER_NAME.to_string(),
                mac: None,
                ports: DEFAULT_PORT_TAGS
                    .iter()
                    .map(|&tag| PortDefinition {
                        tag,
                        size: DEFAULT_PORT_SIZE,
                    })
                    .collect(),
            }],
        }
    }
}

impl NetworkDefinition {
    /// Check names are unique and present.
    pub fn validate(&self) -> Result<()> {
        if self.controllers.is_empty() {
            return Err(Error::Config("network defines no controllers".into()));
        }
        let mut names = HashSet::new();
        for controller in &self.controllers {
            if controller.name.is_empty() {
                return Err(Error::Config("controller without a name".into()));
            }
            if !names.insert(controller.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate controller '{}'",
                    controller.name
                )));
            }
            let mut tags = HashSet::new();
            if let Some(port) = controller.ports.iter().find(|p| !tags.insert(p.tag)) {
                return Err(Error::Config(format!(
                    "controller '{}' repeats port {}",
                    controller.name, port.tag
                )));
            }
        }
        Ok(())
    }
}

/// Firmware image state of a simulated controller.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FirmwareState {
    /// Length announced by `BEGIN`.
    pub expected: Option<u32>,
    /// Bytes received so far.
    pub image: Vec<u8>,
    /// `END` accepted.
    pub finished: bool,
    /// Reboots requested after a finished update.
    pub reboots: u32,
}

impl FirmwareState {
    fn apply(&mut self, command: &OtaCommand) -> Result<()> {
        match command {
            OtaCommand::Reset => *self = Self {
                reboots: self.reboots,
                ..Self::default()
            },
            OtaCommand::Begin { total_len } => {
                self.expected = Some(*total_len);
                self.image.clear();
                self.finished = false;
            },
            OtaCommand::Write { offset, data } => {
                let expected = self
                    .expected
                    .ok_or_else(|| Error::Protocol("write before begin".into()))?;
                if *offset as usize != self.image.len() {
                    return Err(Error::Protocol(format!(
                        "write at {offset}, have {} bytes",
                        self.image.len()
                    )));
                }
                if self.image.len() + data.len() > expected as usize {
                    return Err(Error::Protocol("write past announced length".into()));
                }
                self.image.extend_from_slice(data);
            },
            OtaCommand::End { written } => {
                if self.expected != Some(*written) || self.image.len() != *written as usize {
                    return Err(Error::Protocol(format!(
                        "end with {written} bytes, have {}",
                        self.image.len()
                    )));
                }
                self.finished = true;
            },
            OtaCommand::RebootRequest => {
                if self.finished {
                    self.reboots += 1;
                }
            },
        }
        Ok(())
    }
}

/// A running simulated controller.
#[derive(Debug)]
pub struct SimulatedController {
    name: String,
    mac: MacAddress,
    ports: Vec<PortDefinition>,
    clock: LogicalClock,
    executed: Mutex<Vec<Vec<u8>>>,
    firmware: Mutex<FirmwareState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

impl SimulatedController {
    fn from_definition(index: usize, definition: &ControllerDefinition) -> Self {
        let mac = definition.mac.unwrap_or_else(|| {
            let [.., hi, lo] = u16::try_from(index).unwrap_or(u16::MAX).to_be_bytes();
            MacAddress([0x12, 0x34, 0x00, 0x00, hi, lo])
        });
        Self {
            name: definition.name.clone(),
            mac,
            ports: definition.ports.clone(),
            clock: LogicalClock::new(0),
            executed: Mutex::new(Vec::new()),
            firmware: Mutex::new(FirmwareState::default()),
        }
    }

    /// Controller name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hardware address.
    pub fn mac(&self) -> MacAddress {
        self.mac
    }

    /// Output ports.
    pub fn ports(&self) -> &[PortDefinition] {
        &self.ports
    }

    /// Current clock.
    pub fn clock_ms(&self) -> u64 {
        self.clock.millis()
    }

    /// Network payloads received, oldest first.
    pub fn executed(&self) -> Vec<Vec<u8>> {
        lock(&self.executed).clone()
    }

    /// Firmware update state.
    pub fn firmware(&self) -> FirmwareState {
        lock(&self.firmware).clone()
    }

    fn info(&self) -> ControllerInfo {
        ControllerInfo {
            mac: Some(self.mac),
            detail: Some(format!("{} port(s)", self.ports.len())),
            ..ControllerInfo::new(self.name.clone(), self.name.clone())
        }
    }

    fn execute(&self, bytes: &[u8]) {
        trace!("{} executes {} bytes", self.name, bytes.len());
        lock(&self.executed).push(bytes.to_vec());
    }
}

/// Connector driving a simulated network.
pub struct SimulatedConnector {
    ctx: Arc<LinkContext>,
    network: NetworkDefinition,
    lifecycle: Lifecycle,
    controllers: Mutex<Vec<Arc<SimulatedController>>>,
}

impl std::fmt::Debug for SimulatedConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedConnector")
            .field("state", &self.lifecycle.state())
            .field("controllers", &self.network.controllers.len())
            .finish_non_exhaustive()
    }
}

impl SimulatedConnector {
    /// Connector with the default single-controller network.
    pub fn new(ctx: Arc<LinkContext>) -> Self {
        Self {
            ctx,
            network: NetworkDefinition::default(),
            lifecycle: Lifecycle::new(),
            controllers: Mutex::new(Vec::new()),
        }
    }

    /// Connector with a custom network.
    pub fn with_network(ctx: Arc<LinkContext>, network: NetworkDefinition) -> Result<Self> {
        network.validate()?;
        Ok(Self {
            network,
            ..Self::new(ctx)
        })
    }

    /// Controllers brought up by the last `connect`.
    pub fn controllers(&self) -> Vec<Arc<SimulatedController>> {
        lock(&self.controllers).clone()
    }

    fn candidates(&self) -> Vec<ControllerInfo> {
        self.network
            .controllers
            .iter()
            .enumerate()
            .map(|(index, definition)| SimulatedController::from_definition(index, definition).info())
            .collect()
    }

    fn peer(&self) -> Option<Connection> {
        self.lifecycle
            .connected()
            .map(|info| info.connection(TransportKind::Simulated))
    }

    /// The simulated controller standing behind the connected selection.
    fn target(&self) -> Result<Arc<SimulatedController>> {
        let info = self.lifecycle.require_connected()?;
        lock(&self.controllers)
            .iter()
            .find(|c| c.name == info.name)
            .cloned()
            .ok_or(Error::DeviceDisconnected)
    }

    fn broadcast(&self, bytes: &[u8]) -> Result<()> {
        self.lifecycle.require_connected()?;
        for controller in lock(&self.controllers).iter() {
            controller.execute(bytes);
        }
        Ok(())
    }

    fn set_clocks(&self, millis: u64) -> Result<()> {
        self.lifecycle.require_connected()?;
        for controller in lock(&self.controllers).iter() {
            controller.clock.set_millis(millis);
        }
        Ok(())
    }
}

impl Connector for SimulatedConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Simulated
    }

    fn state(&self) -> ConnectorState {
        self.lifecycle.state()
    }

    fn events(&self) -> Receiver<ConnectorEvent> {
        self.lifecycle.events().subscribe()
    }

    fn scan(&self, criteria: &[SelectionCriteria], _timeout: Duration) -> Result<Vec<ControllerInfo>> {
        Ok(filter_candidates(self.candidates(), criteria))
    }

    fn user_select(
        &self,
        criteria: &[SelectionCriteria],
        timeout: Duration,
        chooser: &mut dyn FnMut(&[ControllerInfo]) -> Option<usize>,
    ) -> Result<ControllerInfo> {
        let candidates = self.scan(criteria, timeout)?;
        let info = choose(&candidates, chooser)?;
        self.disconnect();
        self.lifecycle.select(info.clone());
        Ok(info)
    }

    fn auto_select(&self, criteria: &[SelectionCriteria], timeout: Duration) -> Result<ControllerInfo> {
        let info = self
            .scan(criteria, timeout)?
            .into_iter()
            .next()
            .ok_or(Error::NoDeviceFound)?;
        self.disconnect();
        self.lifecycle.select(info.clone());
        Ok(info)
    }

    fn selected(&self) -> Option<ControllerInfo> {
        self.lifecycle.selected()
    }

    fn unselect(&self) {
        self.disconnect();
        self.lifecycle.unselect();
    }

    fn connect(&self, _timeout: Duration) -> Result<ControllerInfo> {
        let info = self
            .lifecycle
            .selected()
            .ok_or(Error::DeviceNotSelected)?;
        if self.lifecycle.is_connected() {
            return Ok(info);
        }
        self.ctx.check_interrupted()?;

        let controllers: Vec<Arc<SimulatedController>> = self
            .network
            .controllers
            .iter()
            .enumerate()
            .map(|(index, definition)| Arc::new(SimulatedController::from_definition(index, definition)))
            .collect();
        info!("simulated network up with {} controller(s)", controllers.len());

        let macs: Vec<MacAddress> = controllers.iter().map(|c| c.mac).collect();
        *lock(&self.controllers) = controllers;
        self.lifecycle.mark_connected(info.clone());
        for mac in macs {
            self.lifecycle
                .events()
                .emit(ConnectorEvent::PeerConnected(mac));
        }
        Ok(info)
    }

    fn connected(&self) -> Option<ControllerInfo> {
        self.lifecycle.connected()
    }

    fn disconnect(&self) {
        if !self.lifecycle.begin_disconnect() {
            return;
        }
        let controllers = std::mem::take(&mut *lock(&self.controllers));
        for controller in &controllers {
            self.lifecycle
                .events()
                .emit(ConnectorEvent::PeerDisconnected(controller.mac));
        }
        debug!("simulated network down");
        self.lifecycle.mark_disconnected();
    }

    fn deliver(&self, payload: &[u8], _timeout: Duration) -> Result<()> {
        self.broadcast(payload)
    }

    fn transmit(&self, payload: &[u8], _timeout: Duration) -> Result<()> {
        self.broadcast(payload)
    }

    fn request(&self, payload: &[u8], read_response: bool, _timeout: Duration) -> Result<Option<Vec<u8>>> {
        let target = self.target()?;
        let source = target.info().connection(TransportKind::Simulated);
        let response = self.ctx.dispatch_request(payload, &source)?;
        Ok(read_response.then_some(response))
    }

    fn set_clock(&self, sample: &ClockSample) -> Result<()> {
        self.set_clocks(sample.clock_ms)
    }

    fn get_clock(&self) -> Result<ClockSample> {
        Ok(ClockSample::new(self.target()?.clock_ms()))
    }

    fn update_firmware(&self, firmware: &[u8]) -> Result<()> {
        let target = self.target()?;
        OtaSequencer::from_context(&self.ctx, WIRELESS_OTA_CHUNK_SIZE).run(
            firmware,
            &self.ctx,
            self.lifecycle.events(),
            |command| {
                self.lifecycle.require_connected()?;
                lock(&target.firmware).apply(command)
            },
        )
    }

    fn send_execute(&self, bytes: &[u8], source: &Connection) -> Result<()> {
        if is_echo(source, self.peer().as_ref()) {
            trace!("not echoing execute back to {source}");
            return Ok(());
        }
        self.broadcast(bytes)
    }

    fn send_synchronize(&self, sample: &ClockSample, source: &Connection) -> Result<()> {
        if is_echo(source, self.peer().as_ref()) {
            return Ok(());
        }
        self.set_clocks(sample.clock_ms)
    }

    fn destroy(&self) {
        self.unselect();
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{config::LinkConfig, event::OtaStatus, testing::RecordingEngine},
    };

    fn context() -> (Arc<LinkContext>, Arc<RecordingEngine>) {
        let engine = Arc::new(RecordingEngine::default().with_response(b"pong".to_vec()));
        let config = LinkConfig::default().with_ota_pacing(Duration::ZERO, Duration::ZERO);
        let ctx = Arc::new(LinkContext::new(engine.clone(), config));
        ctx.init();
        (ctx, engine)
    }

    fn connected(connector: &SimulatedConnector) {
        connector
            .auto_select(&[], Duration::ZERO)
            .unwrap();
        connector
            .connect(Duration::from_secs(1))
            .unwrap();
    }

    #[test]
    fn test_default_network_has_one_controller_with_four_ports() {
        let (ctx, _) = context();
        let connector = SimulatedConnector::new(ctx);
        connected(&connector);

        let controllers = connector.controllers();
        assert_eq!(controllers.len(), 1);
        assert_eq!(controllers[0].name(), "SIMULATED");
        let ports: Vec<(char, u32)> = controllers[0]
            .ports()
            .iter()
            .map(|p| (p.tag, p.size))
            .collect();
        assert_eq!(ports, vec![('A', 100), ('B', 100), ('C', 100), ('D', 100)]);
    }

    #[test]
    fn test_lifecycle_transitions_and_events() {
        let (ctx, _) = context();
        let connector = SimulatedConnector::new(ctx);
        let events = connector.events();
        assert_eq!(connector.state(), ConnectorState::Unselected);

        assert!(matches!(
            connector.connect(Duration::ZERO),
            Err(Error::DeviceNotSelected)
        ));
        connected(&connector);
        assert_eq!(connector.state(), ConnectorState::Connected);
        let mac = connector.controllers()[0].mac();

        connector.disconnect();
        connector.disconnect();
        assert_eq!(connector.state(), ConnectorState::Selected);
        connector.unselect();
        assert_eq!(connector.state(), ConnectorState::Unselected);

        assert_eq!(events.try_iter().collect::<Vec<_>>(), vec![
            ConnectorEvent::Connected,
            ConnectorEvent::PeerConnected(mac),
            ConnectorEvent::PeerDisconnected(mac),
            ConnectorEvent::Disconnected,
        ]);
    }

    #[test]
    fn test_operations_require_connection() {
        let (ctx, _) = context();
        let connector = SimulatedConnector::new(ctx);
        assert!(matches!(
            connector.deliver(b"x", Duration::ZERO),
            Err(Error::DeviceNotSelected)
        ));
        connector
            .auto_select(&[], Duration::ZERO)
            .unwrap();
        assert!(matches!(
            connector.get_clock(),
            Err(Error::DeviceDisconnected)
        ));
    }

    #[test]
    fn test_deliver_reaches_every_controller() {
        let (ctx, _) = context();
        let network = NetworkDefinition {
            controllers: vec![
                ControllerDefinition {
                    name: "left".into(),
                    mac: None,
                    ports: Vec::new(),
                },
                ControllerDefinition {
                    name: "right".into(),
                    mac: Some(MacAddress([1, 2, 3, 4, 5, 6])),
                    ports: Vec::new(),
                },
            ],
        };
        let connector = SimulatedConnector::with_network(ctx, network).unwrap();
        connector
            .user_select(&[], Duration::ZERO, &mut |c| {
                c.iter().position(|i| i.name == "right")
            })
            .unwrap();
        connector
            .connect(Duration::ZERO)
            .unwrap();

        connector
            .deliver(b"\x01\x02", Duration::ZERO)
            .unwrap();
        for controller in connector.controllers() {
            assert_eq!(controller.executed(), vec![vec![1, 2]]);
        }
        assert_ne!(connector.controllers()[0].mac(), connector.controllers()[1].mac());
    }

    #[test]
    fn test_invalid_network_rejected() {
        let (ctx, _) = context();
        let twice = ControllerDefinition {
            name: "dup".into(),
            mac: None,
            ports: Vec::new(),
        };
        let network = NetworkDefinition {
            controllers: vec![twice.clone(), twice],
        };
        assert!(matches!(
            SimulatedConnector::with_network(ctx, network),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_request_answered_by_engine() {
        let (ctx, engine) = context();
        let connector = SimulatedConnector::new(ctx);
        connected(&connector);

        let response = connector
            .request(b"ping", true, Duration::ZERO)
            .unwrap();
        assert_eq!(response, Some(b"pong".to_vec()));
        assert_eq!(
            connector
                .request(b"ping", false, Duration::ZERO)
                .unwrap(),
            None
        );
        assert_eq!(engine.requests().len(), 2);
    }

    #[test]
    fn test_clock_set_and_get() {
        let (ctx, _) = context();
        let connector = SimulatedConnector::new(ctx);
        connected(&connector);
        connector
            .set_clock(&ClockSample::new(1_000_000))
            .unwrap();
        let now = connector.get_clock().unwrap().clock_ms;
        assert!((1_000_000..1_001_000).contains(&now));
    }

    #[test]
    fn test_firmware_update_lands_on_target() {
        let (ctx, _) = context();
        let connector = SimulatedConnector::new(ctx);
        connected(&connector);
        let events = connector.events();
        let image: Vec<u8> = (0..12_000u32).map(|i| (i % 253) as u8).collect();

        connector
            .update_firmware(&image)
            .unwrap();

        let state = connector.controllers()[0].firmware();
        assert!(state.finished);
        assert_eq!(state.image, image);
        assert_eq!(state.reboots, 1);

        let statuses: Vec<OtaStatus> = events
            .try_iter()
            .filter_map(|e| match e {
                ConnectorEvent::OtaStatus(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![OtaStatus::Begin, OtaStatus::Success]);
    }

    #[test]
    fn test_firmware_state_rejects_out_of_order_write() {
        let mut state = FirmwareState::default();
        assert!(state
            .apply(&OtaCommand::Write {
                offset: 0,
                data: vec![1]
            })
            .is_err());
        state
            .apply(&OtaCommand::Begin { total_len: 4 })
            .unwrap();
        assert!(state
            .apply(&OtaCommand::Write {
                offset: 2,
                data: vec![1]
            })
            .is_err());
    }

    #[test]
    fn test_no_echo_to_connected_controller() {
        let (ctx, _) = context();
        let connector = SimulatedConnector::new(ctx);
        connected(&connector);
        let peer = connector
            .connected()
            .unwrap()
            .connection(TransportKind::Simulated);
        connector
            .send_execute(b"\x09", &peer)
            .unwrap();
        assert!(connector.controllers()[0].executed().is_empty());
        connector
            .send_execute(b"\x09", &Connection::local())
            .unwrap();
        assert_eq!(connector.controllers()[0].executed().len(), 1);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_network_definition_from_json() {
        let json = r#"{"controllers":[{"name":"porch","ports":[{"tag":"A","size":60}]}]}"#;
        let network: NetworkDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(network.controllers[0].ports[0].size, 60);
        assert!(network.controllers[0].mac.is_none());
        network.validate().unwrap();
    }
}
