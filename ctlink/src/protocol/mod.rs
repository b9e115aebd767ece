//! Wire codecs.
//!
//! - [`frame`]: 20-byte header serial frames with header and payload CRCs
//! - [`stream`]: dual-mode text/binary parser for the serial byte stream
//! - [`chunk`]: fragmentation with a 12-byte sub-header for wireless writes
//! - [`clock`]: clock sample layouts
//! - [`ota`]: firmware update commands

pub mod chunk;
pub mod clock;
pub mod frame;
pub mod ota;
pub mod stream;

pub use {
    chunk::{ChunkError, ChunkHeader, Reassembler, WriteIdCounter},
    clock::{ClockContext, ClockSample},
    frame::{Channel, Frame, FrameError, FrameHeader, FrameKind},
    ota::OtaCommand,
    stream::{Marker, StreamEvent, StreamParser},
};
