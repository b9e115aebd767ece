//! # ctlink
//!
//! Connector protocol layer for embedded controllers.
//!
//! This crate carries network bytecode, device requests, clock samples and
//! firmware images between a host application and its controllers over
//! unreliable transports, behind one [`Connector`] contract:
//!
//! - Serial frames with header and payload CRC-32, interleaved with text
//!   markers and controller log lines
//! - Chunked writes with a 12-byte sub-header for short-range wireless links
//! - Request/response correlation with adaptive timeouts and bounded retries
//! - Clock synchronisation with unsolicited push handling
//! - A five-phase OTA firmware update sequencer
//! - An in-process simulated network for tests and demos
//!
//! The bytecode itself is interpreted by an external [`Engine`]; connectors
//! only route bytes to it through a shared [`LinkContext`].
//!
//! ## Features
//!
//! - `native` (default): native serial ports via the `serialport` crate
//! - `serde`: serialization for configuration, clock samples and simulated
//!   network definitions
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::{sync::Arc, time::Duration};
//! use ctlink::{
//!     ClockSample, Connection, Connector, Engine, LinkConfig, LinkContext, Result,
//!     SimulatedConnector,
//! };
//!
//! struct Echo;
//!
//! impl Engine for Echo {
//!     fn execute(&self, _bytes: &[u8], _source: &Connection) -> Result<()> {
//!         Ok(())
//!     }
//!     fn request(&self, bytes: &[u8], _source: &Connection) -> Result<Vec<u8>> {
//!         Ok(bytes.to_vec())
//!     }
//!     fn synchronize(&self, _sample: &ClockSample, _source: &Connection) -> Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     let ctx = Arc::new(LinkContext::new(Arc::new(Echo), LinkConfig::default()));
//!     ctx.init();
//!
//!     let connector = SimulatedConnector::new(Arc::clone(&ctx));
//!     connector.auto_select(&[], Duration::from_secs(1))?;
//!     connector.connect(Duration::from_secs(1))?;
//!
//!     connector.deliver(&[0x01, 0x02], Duration::from_secs(1))?;
//!     connector.set_clock(&ClockSample::new(60_000))?;
//!     println!("clock: {} ms", connector.get_clock()?.clock_ms);
//!
//!     connector.disconnect();
//!     ctx.teardown();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connection;
pub mod connector;
pub mod device;
pub mod engine;
pub mod error;
pub mod event;
pub mod exchange;
pub mod monitor;
pub mod port;
pub mod protocol;
pub mod retry;
pub mod sync;
pub mod updater;

#[cfg(test)]
mod testing;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::NativePort;
pub use {
    config::LinkConfig,
    connection::{Connection, MacAddress, PeerAddress, TransportKind},
    connector::{
        Connector, ConnectorKind, ConnectorRegistry, ConnectorState, ControllerInfo,
        NetworkDefinition, SelectionCriteria, SerialConnector, SimulatedConnector,
        WirelessConnector,
    },
    device::{Bridge, DetectedPort},
    engine::{Engine, LinkContext},
    error::{Error, ErrorCategory, Result},
    event::{ConnectorEvent, OtaStatus},
    monitor::{clean_log_text, format_log_line},
    port::{Port, PortSettings},
    protocol::{Channel, ClockContext, ClockSample, Frame, FrameError, OtaCommand},
    retry::RetryPolicy,
    updater::{OtaPhase, OtaSequencer},
};
