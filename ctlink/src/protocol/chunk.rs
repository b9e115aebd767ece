//! Chunk transfer codec.
//!
//! Payloads larger than a transport's single-write limit are fragmented.
//! On the wireless link each fragment carries a 12-byte sub-header:
//!
//! ```text
//! +----------+--------+-------------+-----------------+
//! | Write ID | Offset | Total Len   |     Payload     |
//! +----------+--------+-------------+-----------------+
//! |  4 bytes | 4 bytes|   4 bytes   | <= max payload  |
//! +----------+--------+-------------+-----------------+
//! ```
//!
//! The serial link needs no sub-header (the frame header already carries
//! the length) and is split into plain sequential writes.

use {
    crate::error::{Error, Result},
    byteorder::{ByteOrder, LittleEndian, WriteBytesExt},
    log::{debug, trace},
    thiserror::Error,
};

/// Size of the chunk sub-header in bytes.
pub const CHUNK_HEADER_LEN: usize = 12;

/// Chunk reassembly failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChunkError {
    /// Fragment shorter than the sub-header.
    #[error("chunk too short: {0} bytes")]
    TooShort(usize),

    /// Fragment does not continue the message being assembled.
    #[error("unexpected offset {actual}, expected {expected}")]
    UnexpectedOffset {
        /// Offset the reassembler was waiting for.
        expected: u32,
        /// Offset carried by the fragment.
        actual: u32,
    },

    /// Fragment would overrun the declared total length.
    #[error("chunk overruns message: {end} > {total}")]
    Overrun {
        /// End offset of the fragment.
        end: usize,
        /// Declared total length.
        total: usize,
    },
}

/// Chunk sub-header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Identifier shared by all fragments of one logical message.
    pub write_id: u32,
    /// Byte offset of this fragment within the message.
    pub offset: u32,
    /// Total message length.
    pub total_len: u32,
}

impl ChunkHeader {
    /// Serialize the sub-header.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn encode(&self) -> [u8; CHUNK_HEADER_LEN] {
        let mut buf = Vec::with_capacity(CHUNK_HEADER_LEN);
        buf.write_u32::<LittleEndian>(self.write_id).unwrap();
        buf.write_u32::<LittleEndian>(self.offset).unwrap();
        buf.write_u32::<LittleEndian>(self.total_len).unwrap();
        let mut out = [0u8; CHUNK_HEADER_LEN];
        out.copy_from_slice(&buf);
        out
    }

    /// Parse a sub-header from the start of `bytes`.
    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, ChunkError> {
        if bytes.len() < CHUNK_HEADER_LEN {
            return Err(ChunkError::TooShort(bytes.len()));
        }
        Ok(Self {
            write_id: LittleEndian::read_u32(&bytes[0..4]),
            offset: LittleEndian::read_u32(&bytes[4..8]),
            total_len: LittleEndian::read_u32(&bytes[8..12]),
        })
    }
}

/// Monotonic write-id source. Wraps from `u32::MAX` back to 1; 0 is never
/// handed out.
#[derive(Debug, Default)]
pub struct WriteIdCounter {
    last: u32,
}

impl WriteIdCounter {
    /// Create a counter whose first id is 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a counter that continues after `last`.
    pub fn starting_after(last: u32) -> Self {
        Self { last }
    }

    /// Next write id.
    pub fn next_id(&mut self) -> u32 {
        self.last = if self.last == u32::MAX { 1 } else { self.last + 1 };
        self.last
    }
}

/// Fragment `payload` into encoded chunks stamped with `write_id`.
///
/// Produces `ceil(len / max_chunk_payload)` chunks in increasing offset
/// order; an empty payload still yields one header-only chunk so the peer
/// observes the message.
#[allow(clippy::cast_possible_truncation)]
pub fn split(write_id: u32, payload: &[u8], max_chunk_payload: usize) -> Vec<Vec<u8>> {
    assert!(max_chunk_payload > 0, "chunk payload size must be positive");

    // Logical messages are far below 4 GiB
    let total_len = payload.len() as u32;
    if payload.is_empty() {
        let header = ChunkHeader {
            write_id,
            offset: 0,
            total_len,
        };
        return vec![header.encode().to_vec()];
    }

    payload
        .chunks(max_chunk_payload)
        .enumerate()
        .map(|(index, part)| {
            let header = ChunkHeader {
                write_id,
                offset: (index * max_chunk_payload) as u32,
                total_len,
            };
            let mut chunk = Vec::with_capacity(CHUNK_HEADER_LEN + part.len());
            chunk.extend_from_slice(&header.encode());
            chunk.extend_from_slice(part);
            chunk
        })
        .collect()
}

/// Split a payload into plain sequential writes (serial variant).
pub fn split_raw(payload: &[u8], max_write: usize) -> impl Iterator<Item = &[u8]> {
    assert!(max_write > 0, "write size must be positive");
    payload.chunks(max_write)
}

/// Reassembles chunked messages fragment by fragment.
#[derive(Debug, Default)]
pub struct Reassembler {
    write_id: Option<u32>,
    total_len: usize,
    buffer: Vec<u8>,
}

impl Reassembler {
    /// Create an idle reassembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a message is partially assembled.
    pub fn in_progress(&self) -> bool {
        self.write_id.is_some()
    }

    /// Feed one encoded chunk. Returns the full message once complete.
    ///
    /// A fragment with a new write id abandons any partial message.
    pub fn push(&mut self, chunk: &[u8]) -> std::result::Result<Option<Vec<u8>>, ChunkError> {
        let header = ChunkHeader::decode(chunk)?;
        let body = &chunk[CHUNK_HEADER_LEN..];

        if self.write_id != Some(header.write_id) {
            if self.in_progress() {
                debug!(
                    "abandoning partial message {:?} ({} of {} bytes)",
                    self.write_id,
                    self.buffer.len(),
                    self.total_len
                );
            }
            self.write_id = Some(header.write_id);
            self.total_len = header.total_len as usize;
            self.buffer.clear();
        }

        if header.offset as usize != self.buffer.len() {
            let expected = u32::try_from(self.buffer.len()).unwrap_or(u32::MAX);
            self.clear();
            return Err(ChunkError::UnexpectedOffset {
                expected,
                actual: header.offset,
            });
        }

        let end = self.buffer.len() + body.len();
        if end > self.total_len {
            let total = self.total_len;
            self.clear();
            return Err(ChunkError::Overrun { end, total });
        }

        self.buffer.extend_from_slice(body);
        trace!(
            "chunk {} offset {}: {}/{} bytes",
            header.write_id,
            header.offset,
            self.buffer.len(),
            self.total_len
        );

        if self.buffer.len() == self.total_len {
            self.write_id = None;
            Ok(Some(std::mem::take(&mut self.buffer)))
        } else {
            Ok(None)
        }
    }

    /// Drop any partial message.
    pub fn clear(&mut self) {
        self.write_id = None;
        self.total_len = 0;
        self.buffer.clear();
    }
}

/// Keep reading while reads come back full-sized.
///
/// A read returning exactly `max_read_size` bytes means the transport has
/// more to deliver; the logical value ends at the first short (or empty)
/// read.
pub fn read_until_short<F>(max_read_size: usize, mut read: F) -> Result<Vec<u8>>
where
    F: FnMut() -> Result<Vec<u8>>,
{
    if max_read_size == 0 {
        return Err(Error::Config("read size must be positive".into()));
    }

    let mut value = Vec::new();
    loop {
        let part = read()?;
        let full = part.len() == max_read_size;
        if part.len() > max_read_size {
            return Err(Error::Protocol(format!(
                "read returned {} bytes, limit is {max_read_size}",
                part.len()
            )));
        }
        value.extend_from_slice(&part);
        if !full {
            return Ok(value);
        }
        trace!("full-sized read ({max_read_size} bytes), continuing");
    }
}
