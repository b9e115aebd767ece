//! Serial connector.
//!
//! The host writes raw frames (header + payload). The controller answers
//! each write with `>>>SUCCESS<<<` or `>>>FAIL<<<`, answers reads with a
//! `>>>DATA=` section carrying a read-data frame, and pushes its own
//! network/device/clock writes and log lines on the same stream.
//!
//! A background reader owns the receive side: it feeds the
//! [`StreamParser`], hands verdicts and read data to the exchange in flight
//! and dispatches controller writes into the engine.

use {
    super::{
        Connector, ConnectorKind, ConnectorState, ControllerInfo, Lifecycle, SelectionCriteria,
        choose, filter_candidates, is_echo,
    },
    crate::{
        config::SERIAL_OTA_CHUNK_SIZE,
        connection::{Connection, TransportKind},
        device::{self, DetectedPort},
        engine::LinkContext,
        error::{Error, Result},
        event::ConnectorEvent,
        exchange::{Correlator, Exclusive, Reply},
        port::{self, Port, PortSettings, RESET_HOLD},
        protocol::{
            Channel, ClockSample, Frame, FrameKind, Marker, StreamEvent, StreamParser, chunk,
            frame,
        },
        sync,
        updater::OtaSequencer,
    },
    log::{debug, info, trace, warn},
    std::{
        io::Read,
        sync::{
            Arc, Mutex, MutexGuard, PoisonError,
            atomic::{AtomicBool, Ordering},
            mpsc::{self, Receiver, RecvTimeoutError, Sender},
        },
        thread::{self, JoinHandle},
        time::{Duration, Instant},
    },
};

/// Port read timeout used by the reader loop.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Pause when a read returned nothing, so writers get the port.
const IDLE_PAUSE: Duration = Duration::from_millis(2);

/// Largest single write handed to the port.
const MAX_WRITE: usize = 1024;

/// Default budget for engine-initiated sends.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens a port for a set of settings.
pub type PortOpener = Arc<dyn Fn(&PortSettings) -> Result<Box<dyn Port>> + Send + Sync>;

/// Lists candidate ports.
pub type PortLister = Arc<dyn Fn() -> Vec<DetectedPort> + Send + Sync>;

/// Opener for native serial ports.
#[cfg(feature = "native")]
pub fn native_opener() -> PortOpener {
    Arc::new(|settings: &PortSettings| {
        let port = crate::port::NativePort::open_with_retry(settings)?;
        Ok(Box::new(port) as Box<dyn Port>)
    })
}

/// What the reader hands to the exchange in flight.
#[derive(Debug)]
enum Inbound {
    Begin,
    Ack,
    Nack(&'static str),
    Data(Channel, Vec<u8>),
}

/// The exchange in flight, as seen by the reader.
struct Waiter {
    tx: Sender<Inbound>,
    reads_data: bool,
}

struct Shared {
    ctx: Arc<LinkContext>,
    lifecycle: Lifecycle,
    port: Mutex<Option<Box<dyn Port>>>,
    pending: Mutex<Option<Waiter>>,
    peer: Mutex<Option<Connection>>,
    stop: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn arm(&self, reads_data: bool) -> Receiver<Inbound> {
        let (tx, rx) = mpsc::channel();
        *lock(&self.pending) = Some(Waiter { tx, reads_data });
        rx
    }

    fn disarm(&self) {
        lock(&self.pending).take();
    }

    fn offer(&self, inbound: Inbound) {
        match lock(&self.pending).as_ref() {
            Some(waiter) => {
                let _ = waiter.tx.send(inbound);
            },
            None => trace!("no exchange waiting for {inbound:?}"),
        }
    }

    fn awaits_data(&self) -> bool {
        lock(&self.pending)
            .as_ref()
            .is_some_and(|waiter| waiter.reads_data)
    }

    fn peer(&self) -> Connection {
        lock(&self.peer)
            .clone()
            .unwrap_or_else(Connection::local)
    }

    fn write_raw(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = lock(&self.port);
        let port = guard.as_mut().ok_or(Error::DeviceDisconnected)?;
        for piece in chunk::split_raw(bytes, MAX_WRITE) {
            port.write_all_bytes(piece)?;
        }
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write_frame(&self, frame_type: u32, payload: &[u8], timeout: Duration) -> Result<()> {
        let timeout_ms = timeout.as_millis().min(u128::from(u32::MAX)) as u32;
        trace!("-> frame {frame_type} ({} bytes)", payload.len());
        self.write_raw(&frame::encode(frame_type, payload, timeout_ms))
    }

    /// Link lost underneath us.
    fn lost(&self, reason: &str) {
        if self.lifecycle.is_connected() {
            warn!("serial link lost: {reason}");
        }
        self.stop.store(true, Ordering::SeqCst);
        self.disarm();
        self.lifecycle.mark_disconnected();
    }

    fn handle(&self, event: StreamEvent) {
        match event {
            StreamEvent::Marker(Marker::Begin) => {
                info!("controller session started");
                self.offer(Inbound::Begin);
            },
            StreamEvent::Marker(Marker::End) => {
                info!("controller ended the session");
                self.lost("end marker");
            },
            StreamEvent::Marker(Marker::Ready) => trace!("controller ready"),
            StreamEvent::Marker(Marker::Success) => self.offer(Inbound::Ack),
            StreamEvent::Marker(Marker::Fail) => self.offer(Inbound::Nack("fail marker")),
            StreamEvent::Marker(Marker::Error) => self.offer(Inbound::Nack("error marker")),
            StreamEvent::Log(line) => {
                debug!("[controller] {line}");
                self.lifecycle
                    .events()
                    .emit(ConnectorEvent::ControllerLog(line));
            },
            StreamEvent::Frame(frame) => self.dispatch(frame),
            StreamEvent::Corrupt(err) => {
                debug!("discarded corrupt unit: {err}");
                // Only a read can have lost its answer to a damaged frame
                if self.awaits_data() {
                    self.offer(Inbound::Nack("corrupt frame"));
                }
            },
        }
    }

    fn dispatch(&self, frame: Frame) {
        let peer = self.peer();
        match frame.kind() {
            FrameKind::Write(Channel::Network) => {
                self.ctx.dispatch_execute(&frame.payload, &peer);
            },
            FrameKind::Write(Channel::Device) => {
                match self.ctx.dispatch_request(&frame.payload, &peer) {
                    Ok(response) => {
                        let code = Channel::Device.read_data_code();
                        let budget = Duration::from_millis(u64::from(frame.timeout_ms));
                        if let Err(e) = self.write_frame(code, &response, budget) {
                            warn!("failed to answer controller request: {e}");
                        }
                    },
                    Err(e) => debug!("controller request not answered: {e}"),
                }
            },
            FrameKind::Write(Channel::Clock) => match ClockSample::decode(&frame.payload) {
                Ok(sample) => self.ctx.dispatch_synchronize(&sample, &peer),
                Err(e) => debug!("bad clock push: {e}"),
            },
            FrameKind::ReadData(channel) => self.offer(Inbound::Data(channel, frame.payload)),
            FrameKind::Read(_) | FrameKind::Unknown(_) => {
                debug!("ignoring frame type {}", frame.frame_type);
            },
        }
    }

    fn read_loop(&self) {
        let mut parser = StreamParser::new();
        let mut buf = [0u8; 1024];

        while !self.stop.load(Ordering::SeqCst) {
            let read = {
                let mut guard = lock(&self.port);
                let Some(port) = guard.as_mut() else {
                    break;
                };
                port.read(&mut buf)
            };

            match read {
                Ok(0) => thread::sleep(IDLE_PAUSE),
                Ok(n) => {
                    trace!("<- {n} bytes");
                    for event in parser.feed(&buf[..n]) {
                        self.handle(event);
                    }
                },
                Err(e) if port::is_idle_error(&e) => thread::sleep(IDLE_PAUSE),
                Err(e) => {
                    self.lost(&e.to_string());
                    break;
                },
            }
        }
        trace!("serial reader stopped");
    }
}

/// Connector for controllers on a serial port.
pub struct SerialConnector {
    shared: Arc<Shared>,
    correlator: Correlator,
    opener: PortOpener,
    lister: PortLister,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SerialConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialConnector")
            .field("state", &self.shared.lifecycle.state())
            .finish_non_exhaustive()
    }
}

impl SerialConnector {
    /// Connector using native serial ports.
    #[cfg(feature = "native")]
    pub fn new(ctx: Arc<LinkContext>) -> Self {
        Self::with_backend(ctx, native_opener(), Arc::new(device::detect_ports))
    }

    /// Connector using the given port opener and lister.
    pub fn with_backend(ctx: Arc<LinkContext>, opener: PortOpener, lister: PortLister) -> Self {
        let correlator = Correlator::new(ctx.config(), ctx.config().baud_rate);
        Self {
            shared: Arc::new(Shared {
                ctx,
                lifecycle: Lifecycle::new(),
                port: Mutex::new(None),
                pending: Mutex::new(None),
                peer: Mutex::new(None),
                stop: AtomicBool::new(true),
            }),
            correlator,
            opener,
            lister,
            reader: Mutex::new(None),
        }
    }

    fn ctx(&self) -> &LinkContext {
        &self.shared.ctx
    }

    fn matching_ports(&self, criteria: &[SelectionCriteria]) -> Vec<DetectedPort> {
        (self.lister)()
            .into_iter()
            .filter(|p| {
                criteria.is_empty() || {
                    let info = p.to_controller_info();
                    criteria.iter().any(|c| c.matches(&info))
                }
            })
            .collect()
    }

    fn wait_for_begin(&self, rx: &Receiver<Inbound>, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            self.ctx().check_interrupted()?;
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::ConnectionFailed(format!(
                    "no {} within {timeout:?}",
                    Marker::Begin.token()
                )));
            }
            match rx.recv_timeout((deadline - now).min(Duration::from_millis(50))) {
                Ok(Inbound::Begin) => return Ok(()),
                Ok(_) | Err(RecvTimeoutError::Timeout) => {},
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::ConnectionFailed("port closed during handshake".into()));
                },
            }
        }
    }

    fn open_link(&self, info: &ControllerInfo, timeout: Duration) -> Result<()> {
        let settings =
            PortSettings::new(&info.address, self.ctx().config().baud_rate, POLL_INTERVAL);
        let mut port = (self.opener)(&settings)
            .map_err(|e| Error::ConnectionFailed(format!("{}: {e}", info.address)))?;

        port.clear_buffers()?;
        if self.ctx().config().serial_reset_on_connect {
            port::pulse_reset(port.as_mut(), RESET_HOLD)?;
        }

        *lock(&self.shared.port) = Some(port);
        self.shared.stop.store(false, Ordering::SeqCst);
        let rx = self.shared.arm(false);

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("ctlink-serial-rx".into())
            .spawn(move || shared.read_loop())?;
        *lock(&self.reader) = Some(handle);

        let result = self.wait_for_begin(&rx, timeout);
        self.shared.disarm();
        result
    }

    fn stop_reader(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.disarm();
        if let Some(handle) = lock(&self.reader).take() {
            if handle.join().is_err() {
                warn!("serial reader panicked");
            }
        }
        if let Some(mut port) = lock(&self.shared.port).take() {
            if let Err(e) = port.close() {
                warn!("closing {} failed: {e}", port.name());
            }
        }
    }

    /// Wait for the verdict on a write. Read data is ignored here.
    fn await_verdict(&self, rx: &Receiver<Inbound>, timeout: Duration) -> Result<Reply> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(Inbound::Ack) => return Ok(Reply::Ack(None)),
                Ok(Inbound::Nack(reason)) => return Ok(Reply::Nack(reason.into())),
                Ok(Inbound::Begin) => return Ok(Reply::Nack("controller restarted".into())),
                Ok(Inbound::Data(..)) => {},
                Err(RecvTimeoutError::Timeout) => return Ok(Reply::Silent),
                Err(RecvTimeoutError::Disconnected) => return Err(Error::DeviceDisconnected),
            }
        }
    }

    /// Wait for read data on `channel`.
    fn await_data(&self, rx: &Receiver<Inbound>, channel: Channel, timeout: Duration) -> Result<Reply> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(Inbound::Data(ch, data)) if ch == channel => return Ok(Reply::Ack(Some(data))),
                Ok(Inbound::Nack(reason)) => return Ok(Reply::Nack(reason.into())),
                Ok(Inbound::Begin) => return Ok(Reply::Nack("controller restarted".into())),
                Ok(Inbound::Ack | Inbound::Data(..)) => {},
                Err(RecvTimeoutError::Timeout) => return Ok(Reply::Silent),
                Err(RecvTimeoutError::Disconnected) => return Err(Error::DeviceDisconnected),
            }
        }
    }

    fn write_attempt(&self, channel: Channel, payload: &[u8], timeout: Duration) -> Result<Reply> {
        self.shared.lifecycle.require_connected()?;
        let rx = self.shared.arm(false);
        let reply = self
            .shared
            .write_frame(channel.write_code(), payload, timeout)
            .and_then(|()| self.await_verdict(&rx, timeout));
        self.shared.disarm();
        reply
    }

    fn read_attempt(&self, channel: Channel, timeout: Duration) -> Result<Reply> {
        self.shared.lifecycle.require_connected()?;
        let rx = self.shared.arm(true);
        let reply = self
            .shared
            .write_frame(channel.read_code(), &[], timeout)
            .and_then(|()| self.await_data(&rx, channel, timeout));
        self.shared.disarm();
        reply
    }

    /// Drop the link if the error means it is dead.
    fn settle<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.forces_disconnect() && self.shared.lifecycle.is_connected() {
                warn!("{e}; dropping the serial link");
                self.disconnect();
            }
        }
        result
    }

    fn write_phase(
        &self,
        held: &Exclusive<'_>,
        channel: Channel,
        payload: &[u8],
        budget: Duration,
    ) -> Result<()> {
        let retries = self.ctx().config().exchange_retries;
        held.initiate(channel, payload, retries, budget, |t| {
            self.write_attempt(channel, payload, t)
        })
        .map(|_| ())
    }

    fn read_phase(&self, held: &Exclusive<'_>, channel: Channel, budget: Duration) -> Result<Vec<u8>> {
        let retries = self.ctx().config().exchange_retries;
        held.initiate(channel, &[], retries, budget, |t| self.read_attempt(channel, t))
            .and_then(|data| data.ok_or_else(|| Error::Protocol("read returned no data".into())))
    }

    fn write_exchange(&self, channel: Channel, payload: &[u8], budget: Duration) -> Result<()> {
        let result = self.write_phase(&self.correlator.exclusive(), channel, payload, budget);
        self.settle(result)
    }

    fn read_exchange(&self, channel: Channel, budget: Duration) -> Result<Vec<u8>> {
        let result = self.read_phase(&self.correlator.exclusive(), channel, budget);
        self.settle(result)
    }
}

impl Connector for SerialConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Serial
    }

    fn state(&self) -> ConnectorState {
        self.shared.lifecycle.state()
    }

    fn events(&self) -> Receiver<ConnectorEvent> {
        self.shared.lifecycle.events().subscribe()
    }

    fn scan(&self, criteria: &[SelectionCriteria], _timeout: Duration) -> Result<Vec<ControllerInfo>> {
        let candidates = (self.lister)()
            .iter()
            .map(DetectedPort::to_controller_info)
            .collect();
        Ok(filter_candidates(candidates, criteria))
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
        self.shared.lifecycle.select(info.clone());
        Ok(info)
    }

    fn auto_select(&self, criteria: &[SelectionCriteria], _timeout: Duration) -> Result<ControllerInfo> {
        let ports = self.matching_ports(criteria);
        let info = device::pick_best(&ports)
            .map(DetectedPort::to_controller_info)
            .ok_or(Error::NoDeviceFound)?;
        self.disconnect();
        self.shared.lifecycle.select(info.clone());
        Ok(info)
    }

    fn selected(&self) -> Option<ControllerInfo> {
        self.shared.lifecycle.selected()
    }

    fn unselect(&self) {
        self.disconnect();
        self.shared.lifecycle.unselect();
    }

    fn connect(&self, timeout: Duration) -> Result<ControllerInfo> {
        let info = self
            .shared
            .lifecycle
            .selected()
            .ok_or(Error::DeviceNotSelected)?;
        if self.shared.lifecycle.is_connected() {
            return Ok(info);
        }

        info!("connecting to {info}");
        // A link lost from the reader side leaves the port to reap
        self.stop_reader();
        self.correlator.set_bitrate(self.ctx().config().baud_rate);
        if let Err(e) = self.open_link(&info, timeout) {
            self.stop_reader();
            return Err(match e {
                Error::ConnectionFailed(_) | Error::Interrupted => e,
                other => Error::ConnectionFailed(other.to_string()),
            });
        }

        *lock(&self.shared.peer) = Some(info.connection(TransportKind::Serial));
        self.shared.lifecycle.mark_connected(info.clone());
        info!("connected to {info}");
        Ok(info)
    }

    fn connected(&self) -> Option<ControllerInfo> {
        self.shared.lifecycle.connected()
    }

    fn disconnect(&self) {
        let had_link = self.shared.lifecycle.begin_disconnect();
        self.stop_reader();
        if had_link {
            info!("serial link closed");
        }
        self.shared.lifecycle.mark_disconnected();
    }

    fn deliver(&self, payload: &[u8], timeout: Duration) -> Result<()> {
        self.write_exchange(Channel::Network, payload, timeout)
    }

    fn transmit(&self, payload: &[u8], timeout: Duration) -> Result<()> {
        // The controller acknowledges every serial write
        self.write_exchange(Channel::Network, payload, timeout)
    }

    fn request(&self, payload: &[u8], read_response: bool, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let result = {
            // Nothing else may reach the controller between the write and its read
            let held = self.correlator.exclusive();
            self.write_phase(&held, Channel::Device, payload, timeout)
                .and_then(|()| {
                    if read_response {
                        self.read_phase(&held, Channel::Device, timeout).map(Some)
                    } else {
                        Ok(None)
                    }
                })
        };
        self.settle(result)
    }

    fn set_clock(&self, sample: &ClockSample) -> Result<()> {
        let bytes = ClockSample::new(sample.clock_ms).encode();
        let budget = self.ctx().config().min_packet_timeout * 2;
        sync::write_clock(&self.ctx().config().clock_retry, || {
            self.write_exchange(Channel::Clock, &bytes, budget)
        })
    }

    fn get_clock(&self) -> Result<ClockSample> {
        let budget = self.ctx().config().min_packet_timeout * 2;
        sync::read_clock(&self.ctx().config().clock_retry, || {
            let data = self.read_exchange(Channel::Clock, budget)?;
            ClockSample::decode(&data)
        })
    }

    fn update_firmware(&self, firmware: &[u8]) -> Result<()> {
        self.shared.lifecycle.require_connected()?;
        let _boost = self.correlator.boost_timeouts(2.0);
        OtaSequencer::from_context(self.ctx(), SERIAL_OTA_CHUNK_SIZE).run(
            firmware,
            self.ctx(),
            self.shared.lifecycle.events(),
            |command| self.write_exchange(Channel::Device, &command.encode(), Duration::ZERO),
        )
    }

    fn send_execute(&self, bytes: &[u8], source: &Connection) -> Result<()> {
        if is_echo(source, lock(&self.shared.peer).as_ref()) {
            trace!("not echoing execute back to {source}");
            return Ok(());
        }
        self.deliver(bytes, FORWARD_TIMEOUT)
    }

    fn send_synchronize(&self, sample: &ClockSample, source: &Connection) -> Result<()> {
        if is_echo(source, lock(&self.shared.peer).as_ref()) {
            trace!("not echoing clock back to {source}");
            return Ok(());
        }
        self.write_exchange(Channel::Clock, &sample.encode(), FORWARD_TIMEOUT)
    }

    fn destroy(&self) {
        self.unselect();
    }
}

impl Drop for SerialConnector {
    fn drop(&mut self) {
        self.stop_reader();
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            config::LinkConfig,
            protocol::{FrameHeader, OtaCommand, frame::HEADER_LEN, stream::DATA_TOKEN},
            retry::RetryPolicy,
            testing::{MockPort, RecordingEngine, capture_logs, data_section},
        },
        std::sync::atomic::AtomicUsize,
    };

    struct Rig {
        connector: SerialConnector,
        port: MockPort,
        engine: Arc<RecordingEngine>,
    }

    fn rig(port: MockPort) -> Rig {
        capture_logs();
        let engine = Arc::new(RecordingEngine::default());
        let config = LinkConfig::default()
            .with_serial_reset(false)
            .with_min_packet_timeout(Duration::from_millis(200))
            .with_clock_retry(RetryPolicy::new(3, Duration::from_millis(10)))
            .with_ota_pacing(Duration::ZERO, Duration::ZERO);
        let ctx = Arc::new(LinkContext::new(engine.clone(), config));
        ctx.init();

        let handle = port.clone();
        let connector = SerialConnector::with_backend(
            ctx,
            Arc::new(move |_settings: &PortSettings| Ok(Box::new(handle.clone()) as Box<dyn Port>)),
            Arc::new(|| {
                vec![
                    DetectedPort::plain("/dev/ttyS0"),
                    DetectedPort {
                        bridge: device::Bridge::Cp210x,
                        ..DetectedPort::plain("/dev/ttyUSB0")
                    },
                ]
            }),
        );
        Rig {
            connector,
            port,
            engine,
        }
    }

    fn connected_rig(port: MockPort) -> Rig {
        port.push_inbound(b">>>BEGIN<<<\n");
        let rig = rig(port);
        rig.connector
            .auto_select(&[], Duration::ZERO)
            .unwrap();
        rig.connector
            .connect(Duration::from_secs(2))
            .unwrap();
        rig
    }

    fn acking_port() -> MockPort {
        MockPort::new("/dev/ttyUSB0").with_frame_responder(|frame| match frame.kind() {
            FrameKind::Read(channel) => {
                let data = match channel {
                    Channel::Clock => ClockSample::new(123_456).encode(),
                    _ => b"pong".to_vec(),
                };
                data_section(channel.read_data_code(), &data)
            },
            _ => b">>>SUCCESS<<<".to_vec(),
        })
    }

    #[test]
    fn test_auto_select_prefers_known_bridge() {
        let rig = rig(MockPort::new("/dev/ttyUSB0"));
        let info = rig
            .connector
            .auto_select(&[], Duration::ZERO)
            .unwrap();
        assert_eq!(info.address, "/dev/ttyUSB0");
        assert_eq!(rig.connector.state(), ConnectorState::Selected);
    }

    #[test]
    fn test_connect_requires_selection() {
        let rig = rig(MockPort::new("/dev/ttyUSB0"));
        assert!(matches!(
            rig.connector.connect(Duration::from_millis(10)),
            Err(Error::DeviceNotSelected)
        ));
    }

    #[test]
    fn test_connect_times_out_without_begin() {
        let rig = rig(MockPort::new("/dev/ttyUSB0"));
        rig.connector
            .auto_select(&[], Duration::ZERO)
            .unwrap();
        let result = rig.connector.connect(Duration::from_millis(100));
        assert!(matches!(result, Err(Error::ConnectionFailed(_))));
        assert_eq!(rig.connector.state(), ConnectorState::Selected);
        assert!(rig.port.is_closed());
    }

    #[test]
    fn test_connect_and_deliver() {
        let rig = connected_rig(acking_port());
        let events = rig.connector.events();
        assert_eq!(rig.connector.state(), ConnectorState::Connected);

        rig.connector
            .deliver(b"\x01\x02\x03", Duration::from_secs(1))
            .unwrap();
        let frames = rig.port.written_frames();
        assert_eq!(frames.last().unwrap().frame_type, 101);
        assert_eq!(frames.last().unwrap().payload, b"\x01\x02\x03");

        rig.connector.disconnect();
        rig.connector.disconnect();
        let seen: Vec<_> = events.try_iter().collect();
        assert_eq!(seen, vec![ConnectorEvent::Disconnected]);
        assert_eq!(rig.connector.state(), ConnectorState::Selected);
    }

    #[test]
    fn test_nacks_exhaust_retries() {
        let port = MockPort::new("/dev/ttyUSB0").with_frame_responder(|_| b">>>FAIL<<<".to_vec());
        let rig = connected_rig(port);

        let result = rig.connector.deliver(b"x", Duration::from_secs(5));
        assert!(matches!(result, Err(Error::WriteFailed { attempts: 3 })));
        assert_eq!(rig.port.written_frames().len(), 3);
        // Rejection alone does not drop the link
        assert_eq!(rig.connector.state(), ConnectorState::Connected);
    }

    #[test]
    fn test_silence_forces_disconnect() {
        let rig = connected_rig(MockPort::new("/dev/ttyUSB0"));
        let events = rig.connector.events();

        let result = rig.connector.deliver(b"x", Duration::from_secs(1));
        assert!(matches!(result, Err(Error::ResponseTimeout { .. })));
        assert_eq!(rig.connector.state(), ConnectorState::Selected);
        assert_eq!(events.try_iter().collect::<Vec<_>>(), vec![
            ConnectorEvent::Disconnected
        ]);
    }

    #[test]
    fn test_request_reads_response() {
        let rig = connected_rig(acking_port());
        let response = rig
            .connector
            .request(b"ping", true, Duration::from_secs(1))
            .unwrap();
        assert_eq!(response.as_deref(), Some(&b"pong"[..]));

        let codes: Vec<u32> = rig
            .port
            .written_frames()
            .iter()
            .map(|f| f.frame_type)
            .collect();
        assert_eq!(codes, vec![102, 202]);
    }

    #[test]
    fn test_request_write_and_read_stay_adjacent() {
        let rig = connected_rig(acking_port());
        let timeout = Duration::from_secs(2);

        thread::scope(|s| {
            s.spawn(|| {
                for _ in 0..50 {
                    let response = rig.connector.request(b"q", true, timeout).unwrap();
                    assert_eq!(response.as_deref(), Some(&b"pong"[..]));
                }
            });
            s.spawn(|| {
                for _ in 0..50 {
                    rig.connector.deliver(b"d", timeout).unwrap();
                }
            });
        });

        let frames = rig.port.written_frames();
        let requests: Vec<usize> = frames
            .iter()
            .enumerate()
            .filter(|(_, f)| f.frame_type == Channel::Device.write_code())
            .map(|(i, _)| i)
            .collect();
        assert_eq!(requests.len(), 50);
        for i in requests {
            assert_eq!(
                frames[i + 1].frame_type,
                Channel::Device.read_code(),
                "frame {i} was not followed by its read"
            );
        }
    }

    fn corrupt_section() -> Vec<u8> {
        let mut section = data_section(Channel::Device.read_data_code(), b"noise");
        section[DATA_TOKEN.len() + HEADER_LEN + 1] ^= 0xFF;
        section
    }

    #[test]
    fn test_corrupt_unit_does_not_fail_a_write() {
        let port = MockPort::new("/dev/ttyUSB0").with_frame_responder(|_| {
            let mut reply = corrupt_section();
            reply.extend_from_slice(b">>>SUCCESS<<<");
            reply
        });
        let rig = connected_rig(port);

        rig.connector
            .deliver(b"x", Duration::from_secs(1))
            .unwrap();
        assert_eq!(rig.port.written_frames().len(), 1);
    }

    #[test]
    fn test_corrupt_read_answer_is_retried() {
        let reads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&reads);
        let port = MockPort::new("/dev/ttyUSB0").with_frame_responder(move |frame| match frame.kind() {
            FrameKind::Read(channel) => {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    corrupt_section()
                } else {
                    data_section(channel.read_data_code(), b"pong")
                }
            },
            _ => b">>>SUCCESS<<<".to_vec(),
        });
        let rig = connected_rig(port);

        let response = rig
            .connector
            .request(b"ping", true, Duration::from_secs(2))
            .unwrap();
        assert_eq!(response.as_deref(), Some(&b"pong"[..]));
        assert_eq!(reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_clock_round_trip() {
        let rig = connected_rig(acking_port());
        rig.connector
            .set_clock(&ClockSample::new(42))
            .unwrap();
        assert_eq!(rig.connector.get_clock().unwrap().clock_ms, 123_456);

        let frames = rig.port.written_frames();
        assert_eq!(frames[0].frame_type, 103);
        assert_eq!(frames[0].payload, 42u64.to_le_bytes());
    }

    #[test]
    fn test_clock_write_fails_after_three_attempts() {
        let port = MockPort::new("/dev/ttyUSB0").with_frame_responder(|_| b">>>FAIL<<<".to_vec());
        let rig = connected_rig(port);
        let result = rig.connector.set_clock(&ClockSample::new(1));
        assert!(matches!(result, Err(Error::ClockWriteFailed)));
        // Three clock attempts, each an exchange of three writes
        assert_eq!(rig.port.written_frames().len(), 9);
    }

    #[test]
    fn test_controller_traffic_dispatched_to_engine() {
        let rig = connected_rig(MockPort::new("/dev/ttyUSB0"));
        let events = rig.connector.events();

        let mut stream = b"hello from controller\n".to_vec();
        stream.extend(data_section(Channel::Network.write_code(), b"\xAA\xBB"));
        stream.extend(data_section(
            Channel::Clock.write_code(),
            &ClockSample::new(9).encode(),
        ));
        rig.port.push_inbound(&stream);

        let deadline = Instant::now() + Duration::from_secs(2);
        while (rig.engine.executed().is_empty() || rig.engine.synchronized().is_empty())
            && Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(rig.engine.executed(), vec![vec![0xAA, 0xBB]]);
        assert_eq!(rig.engine.synchronized(), vec![ClockSample::new(9)]);
        assert!(events
            .try_iter()
            .any(|e| e == ConnectorEvent::ControllerLog("hello from controller".into())));
    }

    #[test]
    fn test_end_marker_disconnects_once() {
        let rig = connected_rig(MockPort::new("/dev/ttyUSB0"));
        let events = rig.connector.events();
        rig.port.push_inbound(b">>>END<<<");

        let deadline = Instant::now() + Duration::from_secs(2);
        while rig.connector.state() == ConnectorState::Connected && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        rig.connector.disconnect();

        assert_eq!(events.try_iter().collect::<Vec<_>>(), vec![
            ConnectorEvent::Disconnected
        ]);
    }

    #[test]
    fn test_no_echo_to_source() {
        let rig = connected_rig(acking_port());
        let peer = rig
            .connector
            .connected()
            .unwrap()
            .connection(TransportKind::Serial);

        rig.connector
            .send_execute(b"\x05", &peer)
            .unwrap();
        assert!(rig.port.written_frames().is_empty());

        rig.connector
            .send_execute(b"\x05", &Connection::local())
            .unwrap();
        assert_eq!(rig.port.written_frames().len(), 1);
    }

    #[test]
    fn test_firmware_update_over_serial() {
        let rig = connected_rig(acking_port());
        let events = rig.connector.events();
        let firmware = vec![0x5A; SERIAL_OTA_CHUNK_SIZE + 10];

        rig.connector
            .update_firmware(&firmware)
            .unwrap();

        let commands: Vec<OtaCommand> = rig
            .port
            .written_frames()
            .iter()
            .map(|f| OtaCommand::decode(&f.payload).unwrap())
            .collect();
        assert_eq!(commands.len(), 6);
        assert_eq!(commands[0], OtaCommand::Reset);
        assert_eq!(commands[4], OtaCommand::End {
            written: u32::try_from(firmware.len()).unwrap()
        });
        assert!(events
            .try_iter()
            .any(|e| e == ConnectorEvent::OtaStatus(crate::event::OtaStatus::Success)));
    }

    #[test]
    fn test_frame_header_carries_attempt_budget() {
        let rig = connected_rig(acking_port());
        rig.connector
            .deliver(b"abc", Duration::from_secs(1))
            .unwrap();
        let raw = rig.port.written_bytes();
        let header = FrameHeader::decode(&raw[..HEADER_LEN]).unwrap();
        assert_eq!(header.timeout_ms, 200);
    }
}
