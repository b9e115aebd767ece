//! Receive-side parser for the serial link.
//!
//! The controller interleaves free-running log text, link-level control
//! markers and binary frames on one byte stream:
//!
//! ```text
//! boot log line\n
//! >>>BEGIN<<<
//! >>>DATA=<20-byte header><payload><<<
//! >>>SUCCESS<<<
//! ```
//!
//! The parser starts in text mode. Only the full `>>>DATA=` token switches it
//! into binary mode, where exactly one header and the declared number of
//! payload bytes are consumed without looking for markers. A closing `<<<`
//! (or `DATA<<<`) directly after the payload is swallowed.

use {
    crate::{
        monitor::clean_log_text,
        protocol::frame::{Frame, FrameError, FrameHeader, HEADER_LEN},
    },
    log::trace,
};

/// Token that switches the parser into binary mode.
pub const DATA_TOKEN: &[u8] = b">>>DATA=";

/// Accepted tokens closing a data section.
const CLOSING_TOKENS: [&[u8]; 2] = [b"DATA<<<", b"<<<"];

/// Longest text line kept before it is flushed as a log line.
const MAX_LINE_LEN: usize = 4096;

/// Link-level control markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// Controller started a serial session.
    Begin,
    /// Controller ended the serial session.
    End,
    /// Controller is ready for the next unit.
    Ready,
    /// Last unit accepted.
    Success,
    /// Last unit rejected.
    Fail,
    /// Controller-side error.
    Error,
}

impl Marker {
    /// All markers.
    pub const ALL: [Self; 6] = [
        Self::Begin,
        Self::End,
        Self::Ready,
        Self::Success,
        Self::Fail,
        Self::Error,
    ];

    /// Wire token for this marker.
    pub fn token(self) -> &'static str {
        match self {
            Self::Begin => ">>>BEGIN<<<",
            Self::End => ">>>END<<<",
            Self::Ready => ">>>READY<<<",
            Self::Success => ">>>SUCCESS<<<",
            Self::Fail => ">>>FAIL<<<",
            Self::Error => ">>>ERROR<<<",
        }
    }
}

/// One parsed unit of the serial stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A control marker.
    Marker(Marker),
    /// A line of controller log text.
    Log(String),
    /// A verified binary frame.
    Frame(Frame),
    /// A binary unit that failed verification and was dropped.
    Corrupt(FrameError),
}

#[derive(Debug)]
enum Mode {
    Text,
    Header,
    Payload(FrameHeader),
    Closing,
}

/// Stateful dual-mode stream parser.
#[derive(Debug)]
pub struct StreamParser {
    mode: Mode,
    line: Vec<u8>,
    binary: Vec<u8>,
    /// Text after a corrupt header is garbage until the next marker or newline.
    discarding: bool,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser {
    /// Create a parser in text mode.
    pub fn new() -> Self {
        Self {
            mode: Mode::Text,
            line: Vec::new(),
            binary: Vec::new(),
            discarding: false,
        }
    }

    /// Whether the parser is inside a binary data section.
    pub fn in_binary_mode(&self) -> bool {
        matches!(self.mode, Mode::Header | Mode::Payload(_))
    }

    /// Drop all partial state and return to text mode.
    pub fn reset(&mut self) {
        self.mode = Mode::Text;
        self.line.clear();
        self.binary.clear();
        self.discarding = false;
    }

    /// Feed received bytes and collect the completed events.
    pub fn feed(&mut self, data: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        let mut pending: Vec<u8> = data.to_vec();

        while !pending.is_empty() {
            pending = self.step(&pending, &mut events);
        }

        events
    }

    /// Consume as much of `data` as the current mode allows; return the rest.
    fn step(&mut self, data: &[u8], events: &mut Vec<StreamEvent>) -> Vec<u8> {
        match self.mode {
            Mode::Text => {
                for (i, &byte) in data.iter().enumerate() {
                    self.line.push(byte);
                    if self.scan_text(events) {
                        return data[i + 1..].to_vec();
                    }
                }
                Vec::new()
            },
            Mode::Header => {
                let take = (HEADER_LEN - self.binary.len()).min(data.len());
                self.binary.extend_from_slice(&data[..take]);
                if self.binary.len() == HEADER_LEN {
                    match FrameHeader::decode(&self.binary) {
                        Ok(header) => {
                            trace!(
                                "frame header: type {} length {}",
                                header.frame_type, header.length
                            );
                            self.binary.clear();
                            self.mode = Mode::Payload(header);
                            if header.length == 0 {
                                self.finish_payload(header, events);
                            }
                        },
                        Err(err) => {
                            trace!("dropping frame: {err}");
                            events.push(StreamEvent::Corrupt(err));
                            // Rescan the header bytes as text so a marker
                            // hiding inside them is not lost.
                            let mut rest = std::mem::take(&mut self.binary);
                            rest.drain(..1);
                            rest.extend_from_slice(&data[take..]);
                            self.mode = Mode::Text;
                            self.discarding = true;
                            return rest;
                        },
                    }
                }
                data[take..].to_vec()
            },
            Mode::Payload(header) => {
                let take = (header.payload_len() - self.binary.len()).min(data.len());
                self.binary.extend_from_slice(&data[..take]);
                if self.binary.len() == header.payload_len() {
                    self.finish_payload(header, events);
                }
                data[take..].to_vec()
            },
            Mode::Closing => {
                let mut consumed = 0;
                for &byte in data {
                    self.binary.push(byte);
                    consumed += 1;
                    if CLOSING_TOKENS.iter().any(|t| *t == self.binary.as_slice()) {
                        self.binary.clear();
                        self.mode = Mode::Text;
                        return data[consumed..].to_vec();
                    }
                    if !CLOSING_TOKENS.iter().any(|t| t.starts_with(&self.binary)) {
                        // Not a closing token; hand everything back to text mode.
                        let mut rest = std::mem::take(&mut self.binary);
                        rest.extend_from_slice(&data[consumed..]);
                        self.mode = Mode::Text;
                        return rest;
                    }
                }
                Vec::new()
            },
        }
    }

    fn finish_payload(&mut self, header: FrameHeader, events: &mut Vec<StreamEvent>) {
        let payload = std::mem::take(&mut self.binary);
        match header.verify_payload(&payload) {
            Ok(()) => events.push(StreamEvent::Frame(Frame {
                frame_type: header.frame_type,
                timeout_ms: header.timeout_ms,
                payload,
            })),
            Err(err) => {
                trace!("dropping frame payload: {err}");
                events.push(StreamEvent::Corrupt(err));
            },
        }
        self.mode = Mode::Closing;
    }

    /// Inspect the text line after a new byte. Returns true on a mode switch.
    fn scan_text(&mut self, events: &mut Vec<StreamEvent>) -> bool {
        if self.line.ends_with(DATA_TOKEN) {
            let text_len = self.line.len() - DATA_TOKEN.len();
            self.flush_text(text_len, events);
            self.line.clear();
            self.discarding = false;
            self.binary.clear();
            self.mode = Mode::Header;
            return true;
        }

        if self.line.ends_with(b"<<<") {
            for marker in Marker::ALL {
                let token = marker.token().as_bytes();
                if self.line.ends_with(token) {
                    let text_len = self.line.len() - token.len();
                    self.flush_text(text_len, events);
                    self.line.clear();
                    self.discarding = false;
                    events.push(StreamEvent::Marker(marker));
                    return false;
                }
            }
        }

        if self.line.last() == Some(&b'\n') || self.line.len() >= MAX_LINE_LEN {
            let len = self.line.len();
            self.flush_text(len, events);
            self.line.clear();
            self.discarding = false;
        }

        false
    }

    fn flush_text(&mut self, len: usize, events: &mut Vec<StreamEvent>) {
        if self.discarding || len == 0 {
            return;
        }
        let text = clean_log_text(&String::from_utf8_lossy(&self.line[..len]));
        let text = text.trim();
        if !text.is_empty() {
            events.push(StreamEvent::Log(text.to_string()));
        }
    }
}
