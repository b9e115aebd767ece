//! In-memory fakes shared by the unit tests.

use {
    crate::{
        connection::Connection,
        connector::{Characteristic, ControllerInfo, GattLink, Notification},
        engine::Engine,
        error::{Error, Result},
        port::Port,
        protocol::{
            ClockSample, Frame, FrameError,
            frame::{self, HEADER_LEN},
            stream::DATA_TOKEN,
        },
    },
    std::{
        collections::{HashMap, VecDeque},
        io::{self, Read, Write},
        sync::{Arc, Mutex, MutexGuard},
        thread,
        time::Duration,
    },
};

/// Route library logs to the test harness output. Run with `RUST_LOG=trace`
/// to see the traffic of a failing test.
pub fn capture_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A `>>>DATA=` section carrying one frame, as the controller sends it.
pub fn data_section(frame_type: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = DATA_TOKEN.to_vec();
    out.extend_from_slice(&frame::encode(frame_type, payload, 100));
    out.extend_from_slice(b"<<<");
    out
}

type FrameResponder = Arc<dyn Fn(&Frame) -> Vec<u8> + Send + Sync>;

#[derive(Default)]
struct PortState {
    inbound: VecDeque<u8>,
    written: Vec<u8>,
    undecoded: Vec<u8>,
    frames: Vec<Frame>,
    lines: Vec<(&'static str, bool)>,
    closed: bool,
    responder: Option<FrameResponder>,
}

/// Serial port backed by shared buffers. Clones share state.
///
/// Host writes are decoded as frames; an optional responder turns each
/// frame into bytes queued for the host to read. Pending inbound bytes
/// survive `clear_buffers` so a test can stage the handshake up front.
#[derive(Clone)]
pub struct MockPort {
    name: String,
    state: Arc<Mutex<PortState>>,
}

impl MockPort {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(PortState::default())),
        }
    }

    pub fn with_frame_responder<F>(self, responder: F) -> Self
    where
        F: Fn(&Frame) -> Vec<u8> + Send + Sync + 'static,
    {
        self.lock().responder = Some(Arc::new(responder));
        self
    }

    fn lock(&self) -> MutexGuard<'_, PortState> {
        self.state.lock().unwrap()
    }

    pub fn push_inbound(&self, bytes: &[u8]) {
        self.lock().inbound.extend(bytes);
    }

    pub fn written_bytes(&self) -> Vec<u8> {
        self.lock().written.clone()
    }

    pub fn written_frames(&self) -> Vec<Frame> {
        self.lock().frames.clone()
    }

    pub fn line_log(&self) -> Vec<(&'static str, bool)> {
        self.lock().lines.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn decode_written(state: &mut PortState) {
        loop {
            match frame::decode(&state.undecoded) {
                Ok(frame) => {
                    state.undecoded.drain(..HEADER_LEN + frame.payload.len());
                    if let Some(responder) = state.responder.clone() {
                        let reply = responder(&frame);
                        state.inbound.extend(reply);
                    }
                    state.frames.push(frame);
                },
                Err(FrameError::Truncated { .. }) => return,
                Err(_) => {
                    state.undecoded.clear();
                    return;
                },
            }
        }
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.lock();
        if state.closed {
            return Err(io::ErrorKind::NotConnected.into());
        }
        if state.inbound.is_empty() {
            return Err(io::ErrorKind::TimedOut.into());
        }
        let n = buf.len().min(state.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.lock();
        if state.closed {
            return Err(io::ErrorKind::NotConnected.into());
        }
        state.written.extend_from_slice(buf);
        state.undecoded.extend_from_slice(buf);
        Self::decode_written(&mut state);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for MockPort {
    fn clear_buffers(&mut self) -> Result<()> {
        self.lock().undecoded.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.lock().lines.push(("dtr", level));
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.lock().lines.push(("rts", level));
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.lock().closed = true;
        Ok(())
    }
}

/// A call made on [`MockGattLink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOp {
    Write,
    Read,
}

struct GattState {
    operations: Vec<(Characteristic, LinkOp)>,
    controllers: Vec<ControllerInfo>,
    acknowledged: bool,
    connected: bool,
    max_read: usize,
    writes: Vec<(Characteristic, Vec<u8>, bool)>,
    failing_writes: u32,
    silent_writes: bool,
    reads: HashMap<Characteristic, VecDeque<Vec<u8>>>,
    after_read: HashMap<Characteristic, Vec<Notification>>,
    notifications: VecDeque<Notification>,
}

/// Radio link backed by shared queues. Clones share state.
#[derive(Clone)]
pub struct MockGattLink {
    state: Arc<Mutex<GattState>>,
}

impl MockGattLink {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(GattState {
                operations: Vec::new(),
                controllers: Vec::new(),
                acknowledged: true,
                connected: false,
                max_read: 512,
                writes: Vec::new(),
                failing_writes: 0,
                silent_writes: false,
                reads: HashMap::new(),
                after_read: HashMap::new(),
                notifications: VecDeque::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GattState> {
        self.state.lock().unwrap()
    }

    pub fn with_controllers(self, controllers: Vec<ControllerInfo>) -> Self {
        self.lock().controllers = controllers;
        self
    }

    pub fn with_ack_support(self, acknowledged: bool) -> Self {
        self.lock().acknowledged = acknowledged;
        self
    }

    pub fn with_max_read(self, max_read: usize) -> Self {
        self.lock().max_read = max_read;
        self
    }

    /// Reject the next `count` writes.
    pub fn fail_next_writes(&self, count: u32) {
        self.lock().failing_writes = count;
    }

    /// Leave every write unanswered.
    pub fn time_out_writes(&self, silent: bool) {
        self.lock().silent_writes = silent;
    }

    pub fn push_read(&self, characteristic: Characteristic, value: Vec<u8>) {
        self.lock()
            .reads
            .entry(characteristic)
            .or_default()
            .push_back(value);
    }

    pub fn notify(&self, notification: Notification) {
        self.lock().notifications.push_back(notification);
    }

    /// Queue `notification` once `characteristic` has been read.
    pub fn notify_after_read(&self, characteristic: Characteristic, notification: Notification) {
        self.lock()
            .after_read
            .entry(characteristic)
            .or_default()
            .push(notification);
    }

    /// Every write attempt, failed ones included.
    pub fn writes(&self) -> Vec<(Characteristic, Vec<u8>, bool)> {
        self.lock().writes.clone()
    }

    /// Writes and reads in the order the link saw them.
    pub fn operations(&self) -> Vec<(Characteristic, LinkOp)> {
        self.lock().operations.clone()
    }
}

impl GattLink for MockGattLink {
    fn scan(&self, _timeout: Duration) -> Result<Vec<ControllerInfo>> {
        Ok(self.lock().controllers.clone())
    }

    fn connect(&self, _controller: &ControllerInfo, _timeout: Duration) -> Result<()> {
        self.lock().connected = true;
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        self.lock().connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    fn supports_acknowledged_writes(&self) -> bool {
        self.lock().acknowledged
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write(
        &self,
        characteristic: Characteristic,
        data: &[u8],
        acknowledged: bool,
        timeout: Duration,
    ) -> Result<()> {
        let mut state = self.lock();
        if !state.connected {
            return Err(Error::DeviceDisconnected);
        }
        if acknowledged && !state.acknowledged {
            return Err(Error::Unsupported("acknowledged writes".into()));
        }
        state
            .writes
            .push((characteristic, data.to_vec(), acknowledged));
        state.operations.push((characteristic, LinkOp::Write));
        if state.silent_writes {
            return Err(Error::ResponseTimeout {
                elapsed_ms: timeout.as_millis() as u64,
            });
        }
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(Error::Protocol("write rejected".into()));
        }
        Ok(())
    }

    fn read(&self, characteristic: Characteristic, _timeout: Duration) -> Result<Vec<u8>> {
        let mut state = self.lock();
        if !state.connected {
            return Err(Error::DeviceDisconnected);
        }
        state.operations.push((characteristic, LinkOp::Read));
        let value = state
            .reads
            .get_mut(&characteristic)
            .and_then(VecDeque::pop_front)
            .unwrap_or_default();
        if let Some(queued) = state.after_read.remove(&characteristic) {
            state.notifications.extend(queued);
        }
        Ok(value)
    }

    fn max_read_size(&self) -> usize {
        self.lock().max_read
    }

    fn poll_notification(&self, timeout: Duration) -> Option<Notification> {
        let next = {
            let mut state = self.lock();
            let next = state.notifications.pop_front();
            if next == Some(Notification::LinkClosed) {
                state.connected = false;
            }
            next
        };
        if next.is_none() {
            thread::sleep(timeout.min(Duration::from_millis(2)));
        }
        next
    }
}

/// Engine that records what it is handed.
#[derive(Default)]
pub struct RecordingEngine {
    executed: Mutex<Vec<Vec<u8>>>,
    requests: Mutex<Vec<Vec<u8>>>,
    synchronized: Mutex<Vec<ClockSample>>,
    response: Vec<u8>,
}

impl RecordingEngine {
    /// Answer every request with `response`.
    pub fn with_response(mut self, response: Vec<u8>) -> Self {
        self.response = response;
        self
    }

    pub fn executed(&self) -> Vec<Vec<u8>> {
        self.executed.lock().unwrap().clone()
    }

    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.requests.lock().unwrap().clone()
    }

    pub fn synchronized(&self) -> Vec<ClockSample> {
        self.synchronized.lock().unwrap().clone()
    }
}

impl Engine for RecordingEngine {
    fn execute(&self, bytes: &[u8], _source: &Connection) -> Result<()> {
        self.executed.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }

    fn request(&self, bytes: &[u8], _source: &Connection) -> Result<Vec<u8>> {
        self.requests.lock().unwrap().push(bytes.to_vec());
        Ok(self.response.clone())
    }

    fn synchronize(&self, sample: &ClockSample, _source: &Connection) -> Result<()> {
        self.synchronized.lock().unwrap().push(*sample);
        Ok(())
    }
}
