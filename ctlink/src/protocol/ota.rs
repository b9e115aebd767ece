//! Firmware update command encoding.
//!
//! Every OTA command travels on the device channel as
//!
//! ```text
//! +--------+----------+----------------+-----------------+
//! | Opcode | Reserved | Offset/Length  | Payload (WRITE) |
//! +--------+----------+----------------+-----------------+
//! | 1 byte |  1 byte  |  4 bytes (LE)  |    variable     |
//! +--------+----------+----------------+-----------------+
//! ```

use {
    crate::error::{Error, Result},
    byteorder::{ByteOrder, LittleEndian, WriteBytesExt},
};

/// Length of the fixed command prefix.
pub const OTA_PREFIX_LEN: usize = 6;

/// OTA opcodes.
pub mod opcode {
    /// Abort any session and prepare for a new one.
    pub const RESET: u8 = 252;
    /// Start a session; field carries the firmware length.
    pub const BEGIN: u8 = 255;
    /// Write a chunk; field carries its offset.
    pub const WRITE: u8 = 254;
    /// Finish a session; field carries the bytes written.
    pub const END: u8 = 253;
    /// Ask the controller to reboot into the new image.
    pub const REBOOT_REQUEST: u8 = 251;
}

/// One firmware update command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaCommand {
    /// `RESET`.
    Reset,
    /// `BEGIN(total_len)`.
    Begin {
        /// Firmware length in bytes.
        total_len: u32,
    },
    /// `WRITE(offset, chunk)`.
    Write {
        /// Offset of the chunk in the image.
        offset: u32,
        /// Chunk bytes.
        data: Vec<u8>,
    },
    /// `END(written)`.
    End {
        /// Bytes written in the session.
        written: u32,
    },
    /// `REBOOT_REQUEST`.
    RebootRequest,
}

impl OtaCommand {
    /// Opcode of this command.
    pub fn opcode(&self) -> u8 {
        match self {
            Self::Reset => opcode::RESET,
            Self::Begin { .. } => opcode::BEGIN,
            Self::Write { .. } => opcode::WRITE,
            Self::End { .. } => opcode::END,
            Self::RebootRequest => opcode::REBOOT_REQUEST,
        }
    }

    fn field(&self) -> u32 {
        match self {
            Self::Reset | Self::RebootRequest => 0,
            Self::Begin { total_len } => *total_len,
            Self::Write { offset, .. } => *offset,
            Self::End { written } => *written,
        }
    }

    /// Serialize the command.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn encode(&self) -> Vec<u8> {
        let payload: &[u8] = match self {
            Self::Write { data, .. } => data,
            _ => &[],
        };
        let mut buf = Vec::with_capacity(OTA_PREFIX_LEN + payload.len());
        buf.push(self.opcode());
        buf.push(0);
        buf.write_u32::<LittleEndian>(self.field()).unwrap();
        buf.extend_from_slice(payload);
        buf
    }

    /// Parse a command.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < OTA_PREFIX_LEN {
            return Err(Error::Protocol(format!(
                "OTA command too short: {} bytes",
                bytes.len()
            )));
        }

        let field = LittleEndian::read_u32(&bytes[2..6]);
        let command = match bytes[0] {
            opcode::RESET => Self::Reset,
            opcode::BEGIN => Self::Begin { total_len: field },
            opcode::WRITE => Self::Write {
                offset: field,
                data: bytes[OTA_PREFIX_LEN..].to_vec(),
            },
            opcode::END => Self::End { written: field },
            opcode::REBOOT_REQUEST => Self::RebootRequest,
            other => {
                return Err(Error::Protocol(format!("unknown OTA opcode {other}")));
            },
        };
        Ok(command)
    }

    /// Whether `bytes` start with an OTA opcode.
    pub fn is_ota(bytes: &[u8]) -> bool {
        matches!(
            bytes.first(),
            Some(&(opcode::RESET | opcode::BEGIN | opcode::WRITE | opcode::END | opcode::REBOOT_REQUEST))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_layout() {
        let cmd = OtaCommand::Write {
            offset: 0x0000_1000,
            data: vec![0xAA, 0xBB],
        };
        assert_eq!(cmd.encode(), vec![254, 0, 0x00, 0x10, 0x00, 0x00, 0xAA, 0xBB]);
    }

    #[test]
    fn test_fixed_commands() {
        assert_eq!(OtaCommand::Reset.encode(), vec![252, 0, 0, 0, 0, 0]);
        assert_eq!(
            OtaCommand::Begin { total_len: 4990 }.encode(),
            vec![255, 0, 0x7E, 0x13, 0, 0]
        );
        assert_eq!(
            OtaCommand::End { written: 1 }.encode(),
            vec![253, 0, 1, 0, 0, 0]
        );
        assert_eq!(OtaCommand::RebootRequest.encode(), vec![251, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_decode() {
        let cmd = OtaCommand::Write {
            offset: 16,
            data: vec![1, 2, 3],
        };
        assert_eq!(OtaCommand::decode(&cmd.encode()).unwrap(), cmd);
        assert_eq!(
            OtaCommand::decode(&[255, 0, 10, 0, 0, 0]).unwrap(),
            OtaCommand::Begin { total_len: 10 }
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(OtaCommand::decode(&[1, 2]).is_err());
        assert!(OtaCommand::decode(&[7, 0, 0, 0, 0, 0]).is_err());
        assert!(!OtaCommand::is_ota(&[7]));
        assert!(OtaCommand::is_ota(&[251]));
    }
}
