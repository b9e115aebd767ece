//! Short-range wireless connector.
//!
//! The controller exposes three characteristics (network, clock, device).
//! Writes larger than one packet are split into chunks carrying a 12-byte
//! sub-header; reads are repeated while they come back full-sized. The radio
//! stack itself sits behind [`GattLink`] so any platform backend can be
//! plugged in.

use {
    super::{
        Connector, ConnectorKind, ConnectorState, ControllerInfo, Lifecycle, SelectionCriteria,
        choose, filter_candidates, is_echo,
    },
    crate::{
        connection::{Connection, TransportKind},
        engine::LinkContext,
        error::{Error, Result},
        event::ConnectorEvent,
        exchange::{Correlator, Exclusive, Reply},
        protocol::{
            Channel, ClockSample, Reassembler, WriteIdCounter,
            chunk::{self, CHUNK_HEADER_LEN},
            clock::CLOCK_MINIMAL_LEN,
        },
        sync::{self, ClockSlot},
        updater::OtaSequencer,
    },
    log::{debug, info, trace, warn},
    std::{
        sync::{
            Arc, Mutex, MutexGuard, PoisonError,
            atomic::{AtomicBool, Ordering},
            mpsc::{Receiver, RecvTimeoutError},
        },
        thread::{self, JoinHandle},
        time::Duration,
    },
};

/// How long the pump blocks waiting for one notification.
const NOTIFY_POLL: Duration = Duration::from_millis(20);

/// Default budget for engine-initiated sends.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(5);

/// A controller characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Characteristic {
    /// Network execute traffic.
    Network,
    /// Clock reads, writes and pushes.
    Clock,
    /// Device requests and firmware updates.
    Device,
}

impl From<Channel> for Characteristic {
    fn from(channel: Channel) -> Self {
        match channel {
            Channel::Network => Self::Network,
            Channel::Clock => Self::Clock,
            Channel::Device => Self::Device,
        }
    }
}

/// Something the radio stack delivered without being asked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A characteristic value changed.
    Value {
        /// Source characteristic.
        characteristic: Characteristic,
        /// New value.
        data: Vec<u8>,
    },
    /// The link went away.
    LinkClosed,
}

/// Platform radio backend.
///
/// Implementations block for at most the given timeout. Write and read
/// failures the peer might recover from should be reported as retryable
/// errors (e.g. [`Error::Protocol`]); an unanswered acknowledged write as
/// [`Error::ResponseTimeout`].
pub trait GattLink: Send + Sync {
    /// Discover advertising controllers.
    fn scan(&self, timeout: Duration) -> Result<Vec<ControllerInfo>>;

    /// Connect and subscribe to notifications.
    fn connect(&self, controller: &ControllerInfo, timeout: Duration) -> Result<()>;

    /// Drop the link.
    fn disconnect(&self) -> Result<()>;

    /// Whether the link is up.
    fn is_connected(&self) -> bool;

    /// Whether acknowledged (write-with-response) writes are available.
    fn supports_acknowledged_writes(&self) -> bool;

    /// Write one packet.
    fn write(
        &self,
        characteristic: Characteristic,
        data: &[u8],
        acknowledged: bool,
        timeout: Duration,
    ) -> Result<()>;

    /// Read a characteristic value once.
    fn read(&self, characteristic: Characteristic, timeout: Duration) -> Result<Vec<u8>>;

    /// Largest value a single read returns.
    fn max_read_size(&self) -> usize;

    /// Next pending notification, waiting up to `timeout`.
    fn poll_notification(&self, timeout: Duration) -> Option<Notification>;
}

struct Shared {
    ctx: Arc<LinkContext>,
    link: Arc<dyn GattLink>,
    lifecycle: Lifecycle,
    clock: ClockSlot,
    peer: Mutex<Option<Connection>>,
    stop: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn peer(&self) -> Connection {
        lock(&self.peer)
            .clone()
            .unwrap_or_else(Connection::local)
    }

    fn lost(&self) {
        if self.lifecycle.is_connected() {
            warn!("wireless link lost");
        }
        self.stop.store(true, Ordering::SeqCst);
        self.clock.finish();
        self.lifecycle.mark_disconnected();
    }

    fn pump(&self) {
        let mut network = Reassembler::new();

        while !self.stop.load(Ordering::SeqCst) {
            let Some(notification) = self.link.poll_notification(NOTIFY_POLL) else {
                continue;
            };

            match notification {
                Notification::LinkClosed => {
                    self.lost();
                    break;
                },
                Notification::Value {
                    characteristic: Characteristic::Network,
                    data,
                } => match network.push(&data) {
                    Ok(Some(message)) => self.ctx.dispatch_execute(&message, &self.peer()),
                    Ok(None) => trace!("network chunk buffered ({} bytes)", data.len()),
                    Err(e) => {
                        debug!("dropping network message: {e}");
                        network.clear();
                    },
                },
                Notification::Value {
                    characteristic: Characteristic::Clock,
                    data,
                } => match ClockSample::decode(&data) {
                    Ok(sample) => {
                        if let Some(pushed) = self.clock.offer(sample) {
                            self.ctx.dispatch_synchronize(&pushed, &self.peer());
                        }
                    },
                    Err(e) => debug!("bad clock notification: {e}"),
                },
                Notification::Value {
                    characteristic: Characteristic::Device,
                    data,
                } => debug!("ignoring {}-byte device notification", data.len()),
            }
        }
        trace!("wireless pump stopped");
    }
}

/// Connector for controllers over a short-range wireless link.
pub struct WirelessConnector {
    shared: Arc<Shared>,
    correlator: Correlator,
    write_ids: Mutex<WriteIdCounter>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WirelessConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WirelessConnector")
            .field("state", &self.shared.lifecycle.state())
            .finish_non_exhaustive()
    }
}

impl WirelessConnector {
    /// Create a connector over `link`.
    pub fn new(ctx: Arc<LinkContext>, link: Arc<dyn GattLink>) -> Self {
        let correlator = Correlator::new(ctx.config(), ctx.config().wireless_bitrate);
        Self {
            shared: Arc::new(Shared {
                ctx,
                link,
                lifecycle: Lifecycle::new(),
                clock: ClockSlot::new(),
                peer: Mutex::new(None),
                stop: AtomicBool::new(true),
            }),
            correlator,
            write_ids: Mutex::new(WriteIdCounter::new()),
            pump: Mutex::new(None),
        }
    }

    fn ctx(&self) -> &LinkContext {
        &self.shared.ctx
    }

    fn link(&self) -> &dyn GattLink {
        self.shared.link.as_ref()
    }

    /// Payload bytes one chunk can carry.
    fn max_chunk_payload(&self) -> usize {
        self.ctx()
            .config()
            .wireless_packet_size()
            .saturating_sub(CHUNK_HEADER_LEN)
    }

    fn next_write_id(&self) -> u32 {
        lock(&self.write_ids).next_id()
    }

    fn stop_pump(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = lock(&self.pump).take() {
            if handle.join().is_err() {
                warn!("wireless pump panicked");
            }
        }
    }

    fn settle<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.forces_disconnect() && self.shared.lifecycle.is_connected() {
                warn!("{e}; dropping the wireless link");
                self.disconnect();
            }
        }
        result
    }

    /// One attempt at writing a whole message as chunks.
    fn write_chunks(&self, characteristic: Characteristic, payload: &[u8], timeout: Duration) -> Result<Reply> {
        self.shared.lifecycle.require_connected()?;
        let chunks = chunk::split(self.next_write_id(), payload, self.max_chunk_payload());
        for (index, piece) in chunks.iter().enumerate() {
            trace!(
                "-> {characteristic:?} chunk {}/{} ({} bytes)",
                index + 1,
                chunks.len(),
                piece.len()
            );
            match self.link().write(characteristic, piece, true, timeout) {
                Ok(()) => {},
                Err(e) if e.is_retryable() => return Ok(Reply::Nack(e.to_string())),
                Err(Error::ResponseTimeout { .. }) => return Ok(Reply::Silent),
                Err(e) => return Err(e),
            }
        }
        Ok(Reply::Ack(None))
    }

    fn check_single_chunk(&self, payload: &[u8]) -> Result<()> {
        let max = self.max_chunk_payload();
        if payload.len() > max {
            return Err(Error::PayloadTooLarge {
                len: payload.len(),
                max,
            });
        }
        Ok(())
    }

    /// Reliable chunked write on `channel` under a held guard.
    fn write_phase(
        &self,
        held: &Exclusive<'_>,
        channel: Channel,
        payload: &[u8],
        budget: Duration,
    ) -> Result<()> {
        self.shared.lifecycle.require_connected()?;
        let acknowledged = self.link().supports_acknowledged_writes();
        if !acknowledged {
            self.check_single_chunk(payload)?;
        }

        let characteristic = Characteristic::from(channel);
        let retries = self.ctx().config().exchange_retries;
        held.initiate(channel, payload, retries, budget, |timeout| {
            if acknowledged {
                self.write_chunks(characteristic, payload, timeout)
            } else {
                self.write_unacknowledged(characteristic, payload, timeout)
                    .map(|()| Reply::Ack(None))
            }
        })
        .map(|_| ())
    }

    fn write_exchange(&self, channel: Channel, payload: &[u8], budget: Duration) -> Result<()> {
        let result = self.write_phase(&self.correlator.exclusive(), channel, payload, budget);
        self.settle(result)
    }

    fn write_unacknowledged(&self, characteristic: Characteristic, payload: &[u8], timeout: Duration) -> Result<()> {
        let max = self.max_chunk_payload();
        let mut chunks = chunk::split(self.next_write_id(), payload, max);
        match (chunks.pop(), chunks.is_empty()) {
            (Some(only), true) => self.link().write(characteristic, &only, false, timeout),
            _ => Err(Error::PayloadTooLarge {
                len: payload.len(),
                max,
            }),
        }
    }

    /// Read a logical value on `channel` under a held guard.
    fn read_phase(&self, held: &Exclusive<'_>, channel: Channel, budget: Duration) -> Result<Vec<u8>> {
        let characteristic = Characteristic::from(channel);
        let retries = self.ctx().config().exchange_retries;
        let max_read = self.link().max_read_size();
        held.initiate(channel, &[], retries, budget, |timeout| {
            self.shared.lifecycle.require_connected()?;
            match chunk::read_until_short(max_read, || self.link().read(characteristic, timeout)) {
                Ok(data) => Ok(Reply::Ack(Some(data))),
                Err(Error::ResponseTimeout { .. }) => Ok(Reply::Silent),
                Err(e) if e.is_retryable() => Ok(Reply::Nack(e.to_string())),
                Err(e) => Err(e),
            }
        })
        .map(Option::unwrap_or_default)
    }

    fn clock_budget(&self) -> Duration {
        self.ctx().config().min_packet_timeout * 2
    }

    /// One clock read: a direct read, falling back to the next clock
    /// notification when the read comes back short.
    fn read_clock_once(&self) -> Result<ClockSample> {
        let pending = self.shared.clock.begin();
        let outcome = self.read_clock_value(&pending);
        self.shared.clock.finish();
        outcome
    }

    fn read_clock_value(&self, pending: &Receiver<ClockSample>) -> Result<ClockSample> {
        let budget = self.clock_budget();
        let retries = 1;
        let data = self
            .correlator
            .initiate(Channel::Clock, &[], retries, budget, |timeout| {
                self.shared.lifecycle.require_connected()?;
                self.link()
                    .read(Characteristic::Clock, timeout)
                    .map(|data| Reply::Ack(Some(data)))
            })?
            .unwrap_or_default();

        if data.len() >= CLOCK_MINIMAL_LEN {
            return ClockSample::decode(&data);
        }

        debug!("short clock read ({} bytes), waiting for notification", data.len());
        match pending.recv_timeout(self.correlator.attempt_timeout(CLOCK_MINIMAL_LEN)) {
            Ok(sample) => Ok(sample),
            Err(RecvTimeoutError::Timeout) => Err(Error::Protocol("no clock value".into())),
            Err(RecvTimeoutError::Disconnected) => Err(Error::DeviceDisconnected),
        }
    }

    fn write_clock_once(&self, bytes: &[u8]) -> Result<()> {
        let acknowledged = self.link().supports_acknowledged_writes();
        self.correlator
            .initiate(Channel::Clock, bytes, 1, self.clock_budget(), |timeout| {
                self.shared.lifecycle.require_connected()?;
                match self
                    .link()
                    .write(Characteristic::Clock, bytes, acknowledged, timeout)
                {
                    Ok(()) => Ok(Reply::Ack(None)),
                    Err(Error::ResponseTimeout { .. }) => Ok(Reply::Silent),
                    Err(e) => Err(e),
                }
            })
            .map(|_| ())
    }
}

impl Connector for WirelessConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Wireless
    }

    fn state(&self) -> ConnectorState {
        self.shared.lifecycle.state()
    }

    fn events(&self) -> Receiver<ConnectorEvent> {
        self.shared.lifecycle.events().subscribe()
    }

    fn scan(&self, criteria: &[SelectionCriteria], timeout: Duration) -> Result<Vec<ControllerInfo>> {
        let found = self.link().scan(timeout)?;
        debug!("wireless scan found {} controller(s)", found.len());
        Ok(filter_candidates(found, criteria))
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

    fn auto_select(&self, criteria: &[SelectionCriteria], timeout: Duration) -> Result<ControllerInfo> {
        // Strongest signal wins
        let info = self
            .scan(criteria, timeout)?
            .into_iter()
            .max_by_key(|c| c.rssi.unwrap_or(i8::MIN))
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
        self.stop_pump();
        self.ctx().check_interrupted()?;
        self.link()
            .connect(&info, timeout)
            .map_err(|e| match e {
                Error::ConnectionFailed(_) | Error::Interrupted => e,
                other => Error::ConnectionFailed(other.to_string()),
            })?;

        *lock(&self.shared.peer) = Some(info.connection(TransportKind::ShortRangeWireless));
        self.shared.stop.store(false, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("ctlink-wireless-pump".into())
            .spawn(move || shared.pump());
        match handle {
            Ok(handle) => *lock(&self.pump) = Some(handle),
            Err(e) => {
                if let Err(err) = self.link().disconnect() {
                    warn!("wireless disconnect failed: {err}");
                }
                return Err(Error::ConnectionFailed(e.to_string()));
            },
        }

        self.shared.lifecycle.mark_connected(info.clone());
        info!("connected to {info}");
        Ok(info)
    }

    fn connected(&self) -> Option<ControllerInfo> {
        self.shared.lifecycle.connected()
    }

    fn disconnect(&self) {
        let had_link = self.shared.lifecycle.begin_disconnect();
        self.stop_pump();
        self.shared.clock.finish();
        if had_link || self.link().is_connected() {
            if let Err(e) = self.link().disconnect() {
                warn!("wireless disconnect failed: {e}");
            }
            info!("wireless link closed");
        }
        self.shared.lifecycle.mark_disconnected();
    }

    fn deliver(&self, payload: &[u8], timeout: Duration) -> Result<()> {
        self.write_exchange(Channel::Network, payload, timeout)
    }

    fn transmit(&self, payload: &[u8], timeout: Duration) -> Result<()> {
        self.shared.lifecycle.require_connected()?;
        self.check_single_chunk(payload)?;
        let retries = self.ctx().config().exchange_retries;
        let result = self
            .correlator
            .initiate(Channel::Network, payload, retries, timeout, |t| {
                self.shared.lifecycle.require_connected()?;
                match self.write_unacknowledged(Characteristic::Network, payload, t) {
                    Ok(()) => Ok(Reply::Ack(None)),
                    Err(Error::ResponseTimeout { .. }) => Ok(Reply::Silent),
                    Err(e) => Err(e),
                }
            })
            .map(|_| ());
        self.settle(result)
    }

    fn request(&self, payload: &[u8], read_response: bool, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let result = {
            // The response must belong to this request's write
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
        let bytes = sample.encode();
        let result = sync::write_clock(&self.ctx().config().clock_retry, || {
            self.write_clock_once(&bytes)
        });
        self.settle(result)
    }

    fn get_clock(&self) -> Result<ClockSample> {
        let result = sync::read_clock(&self.ctx().config().clock_retry, || self.read_clock_once());
        self.settle(result)
    }

    fn update_firmware(&self, firmware: &[u8]) -> Result<()> {
        self.shared.lifecycle.require_connected()?;
        let _boost = self.correlator.boost_timeouts(2.0);
        let chunk_size = self.ctx().config().wireless_ota_chunk_size();
        OtaSequencer::from_context(self.ctx(), chunk_size).run(
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
        let result = self.write_clock_once(&sample.encode());
        self.settle(result)
    }

    fn destroy(&self) {
        self.unselect();
    }
}

impl Drop for WirelessConnector {
    fn drop(&mut self) {
        self.stop_pump();
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            config::{LinkConfig, WIRELESS_CONSTRAINED_OTA_CHUNK_SIZE},
            connection::MacAddress,
            event::OtaStatus,
            protocol::{ChunkHeader, ClockContext, OtaCommand},
            retry::RetryPolicy,
            testing::{LinkOp, MockGattLink, RecordingEngine, capture_logs},
        },
        std::time::Instant,
    };

    struct Rig {
        connector: WirelessConnector,
        link: MockGattLink,
        engine: Arc<RecordingEngine>,
    }

    fn controller(name: &str, rssi: i8) -> ControllerInfo {
        ControllerInfo {
            mac: Some(MacAddress([0x0C, 0, 0, 0, 0, rssi.unsigned_abs()])),
            rssi: Some(rssi),
            ..ControllerInfo::new(name, name)
        }
    }

    fn rig_with(link: MockGattLink, config: LinkConfig) -> Rig {
        capture_logs();
        let engine = Arc::new(RecordingEngine::default());
        let config = config
            .with_min_packet_timeout(Duration::from_millis(100))
            .with_clock_retry(RetryPolicy::new(3, Duration::from_millis(5)))
            .with_ota_pacing(Duration::ZERO, Duration::ZERO);
        let ctx = Arc::new(LinkContext::new(engine.clone(), config));
        ctx.init();
        Rig {
            connector: WirelessConnector::new(ctx, Arc::new(link.clone())),
            link,
            engine,
        }
    }

    fn connected(link: MockGattLink, config: LinkConfig) -> Rig {
        let rig = rig_with(
            link.with_controllers(vec![controller("near", -40), controller("far", -90)]),
            config,
        );
        rig.connector
            .auto_select(&[], Duration::ZERO)
            .unwrap();
        rig.connector
            .connect(Duration::from_secs(1))
            .unwrap();
        rig
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !condition() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_auto_select_strongest_signal() {
        let rig = connected(MockGattLink::new(), LinkConfig::default());
        assert_eq!(rig.connector.connected().unwrap().name, "near");
        assert_eq!(rig.connector.state(), ConnectorState::Connected);
    }

    #[test]
    fn test_auto_select_without_candidates() {
        let rig = rig_with(MockGattLink::new(), LinkConfig::default());
        assert!(matches!(
            rig.connector.auto_select(&[], Duration::ZERO),
            Err(Error::NoDeviceFound)
        ));
    }

    #[test]
    fn test_deliver_chunks_in_offset_order() {
        let rig = connected(MockGattLink::new(), LinkConfig::default());
        let payload: Vec<u8> = (0..1200u32).map(|i| (i % 251) as u8).collect();
        rig.connector
            .deliver(&payload, Duration::from_secs(5))
            .unwrap();

        let writes = rig.link.writes();
        assert_eq!(writes.len(), 3);
        let mut rebuilt = Vec::new();
        for (i, (characteristic, data, acknowledged)) in writes.iter().enumerate() {
            assert_eq!(*characteristic, Characteristic::Network);
            assert!(acknowledged);
            let header = ChunkHeader::decode(data).unwrap();
            assert_eq!(header.offset as usize, i * 500);
            assert_eq!(header.total_len, 1200);
            rebuilt.extend_from_slice(&data[CHUNK_HEADER_LEN..]);
        }
        assert_eq!(rebuilt, payload);
    }

    #[test]
    fn test_deliver_without_ack_support_must_fit() {
        let rig = connected(
            MockGattLink::new().with_ack_support(false),
            LinkConfig::default(),
        );
        let result = rig.connector.deliver(&[0u8; 600], Duration::from_secs(1));
        assert!(matches!(result, Err(Error::PayloadTooLarge { len: 600, max: 500 })));

        rig.connector
            .deliver(&[1u8; 10], Duration::from_secs(1))
            .unwrap();
        let writes = rig.link.writes();
        assert_eq!(writes.len(), 1);
        assert!(!writes[0].2);
    }

    #[test]
    fn test_transmit_is_single_unacknowledged_write() {
        let rig = connected(MockGattLink::new(), LinkConfig::default());
        rig.connector
            .transmit(b"hi", Duration::from_secs(1))
            .unwrap();
        assert_eq!(rig.link.writes().len(), 1);
        assert!(!rig.link.writes()[0].2);
        assert!(matches!(
            rig.connector.transmit(&[0u8; 501], Duration::from_secs(1)),
            Err(Error::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_transmit_retries_failed_write() {
        let link = MockGattLink::new();
        link.fail_next_writes(1);
        let rig = connected(link, LinkConfig::default());
        rig.connector
            .transmit(b"hi", Duration::from_secs(5))
            .unwrap();
        let writes = rig.link.writes();
        assert_eq!(writes.len(), 2);
        assert!(writes.iter().all(|(_, _, acknowledged)| !acknowledged));
    }

    #[test]
    fn test_transmit_never_splits_a_chunked_deliver() {
        let rig = connected(MockGattLink::new(), LinkConfig::default());
        let timeout = Duration::from_secs(5);

        thread::scope(|s| {
            s.spawn(|| {
                for _ in 0..30 {
                    rig.connector.deliver(&[7; 1400], timeout).unwrap();
                }
            });
            s.spawn(|| {
                for _ in 0..100 {
                    rig.connector.transmit(b"t", timeout).unwrap();
                }
            });
        });

        let writes = rig.link.writes();
        assert_eq!(writes.len(), 30 * 3 + 100);
        let mut i = 0;
        while i < writes.len() {
            let (_, data, acknowledged) = &writes[i];
            let header = ChunkHeader::decode(data).unwrap();
            if *acknowledged {
                assert_eq!(header.offset, 0, "write {i} starts mid-message");
                for (k, offset) in [(1, 500), (2, 1000)] {
                    let (_, next, next_acknowledged) = &writes[i + k];
                    let next_header = ChunkHeader::decode(next).unwrap();
                    assert!(next_acknowledged, "write {} interleaved", i + k);
                    assert_eq!(next_header.write_id, header.write_id);
                    assert_eq!(next_header.offset, offset);
                }
                i += 3;
            } else {
                assert_eq!(&data[CHUNK_HEADER_LEN..], b"t");
                i += 1;
            }
        }
    }

    #[test]
    fn test_request_read_follows_its_write() {
        let link = MockGattLink::new();
        for _ in 0..40 {
            link.push_read(Characteristic::Device, b"ok".to_vec());
        }
        let rig = connected(link, LinkConfig::default());
        let timeout = Duration::from_secs(5);

        thread::scope(|s| {
            s.spawn(|| {
                for _ in 0..40 {
                    rig.connector.request(b"q", true, timeout).unwrap();
                }
            });
            s.spawn(|| {
                for _ in 0..40 {
                    rig.connector.deliver(b"d", timeout).unwrap();
                }
            });
        });

        let log = rig.link.operations();
        for (i, op) in log.iter().enumerate() {
            if *op == (Characteristic::Device, LinkOp::Write) {
                assert_eq!(log[i + 1], (Characteristic::Device, LinkOp::Read));
            }
        }
    }

    #[test]
    fn test_failed_writes_are_retried_with_new_write_id() {
        let link = MockGattLink::new();
        link.fail_next_writes(1);
        let rig = connected(link, LinkConfig::default());
        rig.connector
            .deliver(b"abc", Duration::from_secs(5))
            .unwrap();

        let ids: Vec<u32> = rig
            .link
            .writes()
            .iter()
            .map(|(_, data, _)| ChunkHeader::decode(data).unwrap().write_id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
    }

    #[test]
    fn test_request_reads_until_short() {
        let link = MockGattLink::new().with_max_read(4);
        link.push_read(Characteristic::Device, b"abcd".to_vec());
        link.push_read(Characteristic::Device, b"efgh".to_vec());
        link.push_read(Characteristic::Device, b"ij".to_vec());
        let rig = connected(link, LinkConfig::default());

        let response = rig
            .connector
            .request(b"q", true, Duration::from_secs(2))
            .unwrap();
        assert_eq!(response.as_deref(), Some(&b"abcdefghij"[..]));
        assert_eq!(rig.link.writes()[0].0, Characteristic::Device);
    }

    #[test]
    fn test_inbound_network_chunks_reassembled() {
        let rig = connected(MockGattLink::new(), LinkConfig::default());
        let message: Vec<u8> = (0..30u8).collect();
        for piece in chunk::split(9, &message, 8) {
            rig.link.notify(Notification::Value {
                characteristic: Characteristic::Network,
                data: piece,
            });
        }
        wait_until(|| !rig.engine.executed().is_empty());
        assert_eq!(rig.engine.executed(), vec![message]);
    }

    #[test]
    fn test_unsolicited_clock_push_goes_to_engine() {
        let rig = connected(MockGattLink::new(), LinkConfig::default());
        let sample = ClockSample::with_context(5000, ClockContext {
            history_fingerprint: 7,
            ..ClockContext::default()
        });
        rig.link.notify(Notification::Value {
            characteristic: Characteristic::Clock,
            data: sample.encode(),
        });
        wait_until(|| !rig.engine.synchronized().is_empty());
        assert_eq!(rig.engine.synchronized(), vec![sample]);
    }

    #[test]
    fn test_get_clock_direct_read() {
        let link = MockGattLink::new();
        link.push_read(Characteristic::Clock, ClockSample::new(777).encode());
        let rig = connected(link, LinkConfig::default());
        assert_eq!(rig.connector.get_clock().unwrap().clock_ms, 777);
        assert!(rig.engine.synchronized().is_empty());
    }

    #[test]
    fn test_get_clock_falls_back_to_notification() {
        let link = MockGattLink::new();
        link.push_read(Characteristic::Clock, Vec::new());
        link.notify_after_read(Characteristic::Clock, Notification::Value {
            characteristic: Characteristic::Clock,
            data: ClockSample::new(31337).encode(),
        });
        let rig = connected(link, LinkConfig::default());

        assert_eq!(rig.connector.get_clock().unwrap().clock_ms, 31337);
        // Answer to the read, not a push
        assert!(rig.engine.synchronized().is_empty());
    }

    #[test]
    fn test_set_clock_failure_after_retries() {
        let link = MockGattLink::new();
        link.fail_next_writes(100);
        let rig = connected(link, LinkConfig::default());
        assert!(matches!(
            rig.connector.set_clock(&ClockSample::new(1)),
            Err(Error::ClockWriteFailed)
        ));
        assert_eq!(rig.link.writes().len(), 3);
    }

    #[test]
    fn test_link_closed_disconnects_once() {
        let rig = connected(MockGattLink::new(), LinkConfig::default());
        let events = rig.connector.events();
        rig.link.notify(Notification::LinkClosed);
        wait_until(|| rig.connector.state() != ConnectorState::Connected);
        rig.connector.disconnect();
        assert_eq!(events.try_iter().collect::<Vec<_>>(), vec![
            ConnectorEvent::Disconnected
        ]);
        assert!(matches!(
            rig.connector.deliver(b"x", Duration::from_secs(1)),
            Err(Error::DeviceDisconnected)
        ));
    }

    #[test]
    fn test_unanswered_write_forces_disconnect() {
        let link = MockGattLink::new();
        link.time_out_writes(true);
        let rig = connected(link, LinkConfig::default());
        assert!(matches!(
            rig.connector.deliver(b"x", Duration::from_secs(1)),
            Err(Error::ResponseTimeout { .. })
        ));
        assert_eq!(rig.connector.state(), ConnectorState::Selected);
        assert!(!rig.link.is_connected());
    }

    #[test]
    fn test_firmware_update_on_constrained_radio() {
        let rig = connected(
            MockGattLink::new(),
            LinkConfig::default().with_constrained_radio(true),
        );
        let events = rig.connector.events();
        let firmware = vec![0xA5u8; 4990];
        rig.connector
            .update_firmware(&firmware)
            .unwrap();

        // Reassemble each chunked command written to the device characteristic
        let mut reassembler = Reassembler::new();
        let mut commands = Vec::new();
        for (characteristic, data, _) in rig.link.writes() {
            assert_eq!(characteristic, Characteristic::Device);
            if let Some(message) = reassembler.push(&data).unwrap() {
                commands.push(OtaCommand::decode(&message).unwrap());
            }
        }
        let write_sizes: Vec<usize> = commands
            .iter()
            .filter_map(|c| match c {
                OtaCommand::Write { data, .. } => Some(data.len()),
                _ => None,
            })
            .collect();
        assert_eq!(write_sizes, vec![
            WIRELESS_CONSTRAINED_OTA_CHUNK_SIZE,
            WIRELESS_CONSTRAINED_OTA_CHUNK_SIZE,
            WIRELESS_CONSTRAINED_OTA_CHUNK_SIZE,
            WIRELESS_CONSTRAINED_OTA_CHUNK_SIZE,
            958
        ]);
        assert_eq!(commands.last(), Some(&OtaCommand::RebootRequest));

        let progress: Vec<f64> = events
            .try_iter()
            .filter_map(|e| match e {
                ConnectorEvent::OtaProgress(p) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(progress.len(), 5);
        assert!(progress[..4].iter().all(|p| *p < 100.0));
        assert!((progress[4] - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_firmware_update_fails_without_ack_support() {
        let rig = connected(
            MockGattLink::new().with_ack_support(false),
            LinkConfig::default(),
        );
        let events = rig.connector.events();
        let result = rig.connector.update_firmware(&[0u8; 4096]);
        assert!(matches!(result, Err(Error::UpdateFailed(_))));
        assert!(events
            .try_iter()
            .any(|e| e == ConnectorEvent::OtaStatus(OtaStatus::Fail)));
    }

    #[test]
    fn test_execute_not_echoed_to_source() {
        let rig = connected(MockGattLink::new(), LinkConfig::default());
        let peer = rig
            .connector
            .connected()
            .unwrap()
            .connection(TransportKind::ShortRangeWireless);
        rig.connector
            .send_execute(b"\x01", &peer)
            .unwrap();
        assert!(rig.link.writes().is_empty());
        rig.connector
            .send_execute(b"\x01", &Connection::local())
            .unwrap();
        assert_eq!(rig.link.writes().len(), 1);
    }
}
