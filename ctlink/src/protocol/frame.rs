//! Serial frame codec.
//!
//! Every binary unit on the serial link starts with a fixed 20-byte header
//! protected by its own CRC, followed by the raw payload.
//!
//! ## Frame Format
//!
//! ```text
//! +--------+--------+---------+-------------+------------+-----------+
//! |  Type  | Length | Timeout | Payload CRC | Header CRC |  Payload  |
//! +--------+--------+---------+-------------+------------+-----------+
//! | 4 bytes| 4 bytes| 4 bytes |   4 bytes   |  4 bytes   |  Length   |
//! +--------+--------+---------+-------------+------------+-----------+
//! ```
//!
//! All integers are little-endian. The header CRC covers the first 16 header
//! bytes; the payload CRC covers the payload only. Both are CRC-32 (IEEE).

use {
    byteorder::{ByteOrder, LittleEndian, WriteBytesExt},
    thiserror::Error,
};

/// Size of the frame header in bytes.
pub const HEADER_LEN: usize = 20;

/// Number of header bytes covered by the header CRC.
const HEADER_CRC_SPAN: usize = 16;

/// Largest payload the decoder accepts.
pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;

/// Base code for host-to-controller writes.
pub const CODE_WRITE: u32 = 100;

/// Base code for host-to-controller read requests.
pub const CODE_READ: u32 = 200;

/// Offset added to a read code for the data carrying the answer.
pub const CODE_DATA: u32 = 10;

/// Integrity and framing failures reported by the codec.
///
/// These never cross the connector boundary: the corrupt unit is dropped and
/// the stream parser resynchronises on the next frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Header CRC mismatch, header fields are not trustworthy.
    #[error("header corrupt: expected crc {expected:#010x}, got {actual:#010x}")]
    HeaderCorrupt {
        /// CRC carried in the header.
        expected: u32,
        /// CRC computed over the received header bytes.
        actual: u32,
    },

    /// Payload CRC mismatch.
    #[error("payload corrupt: expected crc {expected:#010x}, got {actual:#010x}")]
    PayloadCorrupt {
        /// CRC carried in the header.
        expected: u32,
        /// CRC computed over the received payload.
        actual: u32,
    },

    /// Not enough bytes for the declared frame.
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes present.
        available: usize,
    },

    /// Declared payload length exceeds [`MAX_PAYLOAD_LEN`].
    #[error("payload length {len} exceeds {max}")]
    PayloadTooLarge {
        /// Declared length.
        len: usize,
        /// Largest accepted length.
        max: usize,
    },
}

/// Logical channel addressed by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Channel {
    /// Network execute traffic.
    Network = 1,
    /// Device request/response traffic.
    Device = 2,
    /// Clock synchronisation traffic.
    Clock = 3,
}

impl Channel {
    /// All channels in code order.
    pub const ALL: [Self; 3] = [Self::Network, Self::Device, Self::Clock];

    /// Code of a host write on this channel (`100 + channel`).
    pub fn write_code(self) -> u32 {
        CODE_WRITE + self as u32
    }

    /// Code of a host read request on this channel (`200 + channel`).
    pub fn read_code(self) -> u32 {
        CODE_READ + self as u32
    }

    /// Code of the data frame answering a read (`210 + channel`).
    pub fn read_data_code(self) -> u32 {
        CODE_READ + CODE_DATA + self as u32
    }

    /// Channel for a raw channel number.
    pub fn from_number(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Network),
            2 => Some(Self::Device),
            3 => Some(Self::Clock),
            _ => None,
        }
    }
}

/// Meaning of a frame type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// A write on a channel.
    Write(Channel),
    /// A read request on a channel.
    Read(Channel),
    /// Data answering a read on a channel.
    ReadData(Channel),
    /// Anything else.
    Unknown(u32),
}

impl FrameKind {
    /// Classify a type code.
    pub fn from_code(code: u32) -> Self {
        let channel = Channel::from_number(code % 10);
        match (code / 10, channel) {
            (10, Some(ch)) => Self::Write(ch),
            (20, Some(ch)) => Self::Read(ch),
            (21, Some(ch)) => Self::ReadData(ch),
            _ => Self::Unknown(code),
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame type code.
    pub frame_type: u32,
    /// Payload length in bytes.
    pub length: u32,
    /// Receive timeout budget in milliseconds.
    pub timeout_ms: u32,
    /// CRC-32 of the payload.
    pub payload_crc: u32,
}

impl FrameHeader {
    /// Build a header describing `payload`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn for_payload(frame_type: u32, payload: &[u8], timeout_ms: u32) -> Self {
        Self {
            frame_type,
            // Payloads are bounded well below 4 GiB by MAX_PAYLOAD_LEN
            length: payload.len() as u32,
            timeout_ms,
            payload_crc: crc32fast::hash(payload),
        }
    }

    /// Serialize the header, computing the header CRC.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        buf.write_u32::<LittleEndian>(self.frame_type).unwrap();
        buf.write_u32::<LittleEndian>(self.length).unwrap();
        buf.write_u32::<LittleEndian>(self.timeout_ms).unwrap();
        buf.write_u32::<LittleEndian>(self.payload_crc).unwrap();
        let header_crc = crc32fast::hash(&buf);
        buf.write_u32::<LittleEndian>(header_crc).unwrap();

        let mut out = [0u8; HEADER_LEN];
        out.copy_from_slice(&buf);
        out
    }

    /// Parse and validate a header.
    ///
    /// Fields are only returned once the header CRC matches.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_LEN {
            return Err(FrameError::Truncated {
                needed: HEADER_LEN,
                available: bytes.len(),
            });
        }

        let expected = LittleEndian::read_u32(&bytes[16..20]);
        let actual = crc32fast::hash(&bytes[..HEADER_CRC_SPAN]);
        if expected != actual {
            return Err(FrameError::HeaderCorrupt { expected, actual });
        }

        let header = Self {
            frame_type: LittleEndian::read_u32(&bytes[0..4]),
            length: LittleEndian::read_u32(&bytes[4..8]),
            timeout_ms: LittleEndian::read_u32(&bytes[8..12]),
            payload_crc: LittleEndian::read_u32(&bytes[12..16]),
        };

        if header.payload_len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge {
                len: header.payload_len(),
                max: MAX_PAYLOAD_LEN,
            });
        }

        Ok(header)
    }

    /// Payload length as `usize`.
    pub fn payload_len(&self) -> usize {
        self.length as usize
    }

    /// Check a payload against this header.
    pub fn verify_payload(&self, payload: &[u8]) -> Result<(), FrameError> {
        let actual = crc32fast::hash(payload);
        if actual == self.payload_crc {
            Ok(())
        } else {
            Err(FrameError::PayloadCorrupt {
                expected: self.payload_crc,
                actual,
            })
        }
    }

    /// Meaning of the type code.
    pub fn kind(&self) -> FrameKind {
        FrameKind::from_code(self.frame_type)
    }
}

/// A complete, verified serial frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type code.
    pub frame_type: u32,
    /// Receive timeout budget in milliseconds.
    pub timeout_ms: u32,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame.
    pub fn new(frame_type: u32, payload: impl Into<Vec<u8>>, timeout_ms: u32) -> Self {
        Self {
            frame_type,
            timeout_ms,
            payload: payload.into(),
        }
    }

    /// Meaning of the type code.
    pub fn kind(&self) -> FrameKind {
        FrameKind::from_code(self.frame_type)
    }

    /// Serialize header and payload.
    pub fn encode(&self) -> Vec<u8> {
        encode(self.frame_type, &self.payload, self.timeout_ms)
    }
}

/// Encode a frame with both CRCs populated.
pub fn encode(frame_type: u32, payload: &[u8], timeout_ms: u32) -> Vec<u8> {
    let header = FrameHeader::for_payload(frame_type, payload, timeout_ms);
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}

/// Decode one frame from the start of `bytes`.
///
/// Trailing bytes beyond the declared payload are ignored.
pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
    let header = FrameHeader::decode(bytes)?;
    let end = HEADER_LEN + header.payload_len();
    if bytes.len() < end {
        return Err(FrameError::Truncated {
            needed: end,
            available: bytes.len(),
        });
    }

    let payload = &bytes[HEADER_LEN..end];
    header.verify_payload(payload)?;

    Ok(Frame {
        frame_type: header.frame_type,
        timeout_ms: header.timeout_ms,
        payload: payload.to_vec(),
    })
}
