//! Connector events.
//!
//! Every connector owns an [`EventBus`]; consumers call
//! [`EventBus::subscribe`] and receive typed [`ConnectorEvent`]s over a
//! `std::sync::mpsc` channel.

use {
    crate::connection::MacAddress,
    log::trace,
    std::{
        fmt,
        sync::{
            Mutex, PoisonError,
            atomic::{AtomicBool, Ordering},
            mpsc::{self, Receiver, Sender},
        },
    },
};

/// Firmware update status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaStatus {
    /// Session started.
    Begin,
    /// Session completed.
    Success,
    /// Session abandoned.
    Fail,
}

impl fmt::Display for OtaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            Self::Begin => "begin",
            Self::Success => "success",
            Self::Fail => "fail",
        };
        write!(f, "ota_status: {status}")
    }
}

/// Something a connector reports to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectorEvent {
    /// The link came up.
    Connected,
    /// The link went down.
    Disconnected,
    /// A controller joined the network behind the link.
    PeerConnected(MacAddress),
    /// A controller left the network behind the link.
    PeerDisconnected(MacAddress),
    /// Firmware update status change.
    OtaStatus(OtaStatus),
    /// Firmware update progress in percent, two decimals.
    OtaProgress(f64),
    /// A log line printed by the controller.
    ControllerLog(String),
}

/// Fan-out of connector events to any number of subscribers.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<ConnectorEvent>>>,
}

impl EventBus {
    /// Create a bus without subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> Receiver<ConnectorEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Deliver an event to every live subscriber.
    pub fn emit(&self, event: ConnectorEvent) {
        trace!("event: {event:?}");
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Connected flag that reports each transition exactly once.
#[derive(Debug, Default)]
pub struct LinkFlag {
    connected: AtomicBool,
}

impl LinkFlag {
    /// Create a flag in the disconnected state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Mark the link up; emits `Connected` if it was down.
    pub fn set_connected(&self, events: &EventBus) -> bool {
        let changed = !self.connected.swap(true, Ordering::SeqCst);
        if changed {
            events.emit(ConnectorEvent::Connected);
        }
        changed
    }

    /// Mark the link down; emits `Disconnected` if it was up.
    ///
    /// Concurrent callers race on one swap, so only one of them emits.
    pub fn set_disconnected(&self, events: &EventBus) -> bool {
        let changed = self.connected.swap(false, Ordering::SeqCst);
        if changed {
            events.emit(ConnectorEvent::Disconnected);
        }
        changed
    }
}
