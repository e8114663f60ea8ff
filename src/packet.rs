//! RFC 1350 packet codec: the five opcodes, nothing else.
//!
//! Block size is fixed at 512 bytes (§1 non-goals: no RFC 2347/2348/2349
//! option negotiation), so unlike most TFTP crates this one carries no
//! `blksize`/`tsize`/`windowsize` option parsing.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Result, TftpError};

/// Data payload carried per DATA packet, per RFC 1350.
pub const BLOCK_SIZE: usize = 512;

/// Maximum bytes a filename, mode string, or error message may occupy
/// before its NUL terminator. Bounds the terminator scan so a datagram
/// with no NUL cannot force an unbounded search.
const MAX_STRING_LEN: usize = 255;

/// The five RFC 1350 opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
}

impl Opcode {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(Opcode::Rrq),
            2 => Some(Opcode::Wrq),
            3 => Some(Opcode::Data),
            4 => Some(Opcode::Ack),
            5 => Some(Opcode::Error),
            _ => None,
        }
    }
}

/// Wire error codes, per §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    FileNotFound = 1,
    AccessViolation = 2,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileAlreadyExists = 6,
}

/// A fully parsed TFTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Rrq { filename: String, mode: String },
    Wrq { filename: String, mode: String },
    Data { block: u16, payload: Vec<u8> },
    Ack { block: u16 },
    Error { code: u16, message: String },
}

impl Packet {
    /// Parse a raw UDP datagram into a `Packet`.
    ///
    /// Fails with `MalformedPacket` if the opcode is out of `{1..5}`, the
    /// header is truncated, or a required NUL terminator is missing.
    pub fn parse(datagram: &[u8]) -> Result<Self> {
        if datagram.len() < 2 {
            return Err(TftpError::MalformedPacket("datagram too short".into()));
        }
        let mut bytes = BytesMut::from(datagram);
        let opcode = bytes.get_u16();
        match Opcode::from_u16(opcode) {
            Some(Opcode::Rrq) => {
                let filename = parse_string(&mut bytes)?;
                let mode = parse_string(&mut bytes)?;
                Ok(Packet::Rrq { filename, mode })
            }
            Some(Opcode::Wrq) => {
                let filename = parse_string(&mut bytes)?;
                let mode = parse_string(&mut bytes)?;
                Ok(Packet::Wrq { filename, mode })
            }
            Some(Opcode::Data) => {
                if bytes.len() < 2 {
                    return Err(TftpError::MalformedPacket("DATA header truncated".into()));
                }
                let block = bytes.get_u16();
                let payload = bytes.to_vec();
                if payload.len() > BLOCK_SIZE {
                    return Err(TftpError::MalformedPacket("DATA payload too long".into()));
                }
                Ok(Packet::Data { block, payload })
            }
            Some(Opcode::Ack) => {
                if bytes.len() < 2 {
                    return Err(TftpError::MalformedPacket("ACK too short".into()));
                }
                let block = bytes.get_u16();
                Ok(Packet::Ack { block })
            }
            Some(Opcode::Error) => {
                if bytes.len() < 2 {
                    return Err(TftpError::MalformedPacket("ERROR header truncated".into()));
                }
                let code = bytes.get_u16();
                let message = parse_string(&mut bytes)?;
                Ok(Packet::Error { code, message })
            }
            None => Err(TftpError::UnknownOpcode(opcode)),
        }
    }

    /// Serialize this packet to its exact wire layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Packet::Rrq { filename, mode } => encode_request(Opcode::Rrq, filename, mode),
            Packet::Wrq { filename, mode } => encode_request(Opcode::Wrq, filename, mode),
            Packet::Data { block, payload } => {
                let mut buf = BytesMut::with_capacity(4 + payload.len());
                buf.put_u16(Opcode::Data as u16);
                buf.put_u16(*block);
                buf.put_slice(payload);
                buf.to_vec()
            }
            Packet::Ack { block } => {
                let mut buf = BytesMut::with_capacity(4);
                buf.put_u16(Opcode::Ack as u16);
                buf.put_u16(*block);
                buf.to_vec()
            }
            Packet::Error { code, message } => {
                let mut buf = BytesMut::with_capacity(5 + message.len());
                buf.put_u16(Opcode::Error as u16);
                buf.put_u16(*code);
                buf.put_slice(message.as_bytes());
                buf.put_u8(0);
                buf.to_vec()
            }
        }
    }

    /// Build the wire ERROR packet for a given code and message.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Packet::Error {
            code: code as u16,
            message: message.into(),
        }
    }
}

fn encode_request(opcode: Opcode, filename: &str, mode: &str) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(4 + filename.len() + mode.len());
    buf.put_u16(opcode as u16);
    buf.put_slice(filename.as_bytes());
    buf.put_u8(0);
    buf.put_slice(mode.as_bytes());
    buf.put_u8(0);
    buf.to_vec()
}

/// Parse a NUL-terminated string, bounded at `MAX_STRING_LEN` bytes before
/// the terminator so an unterminated datagram cannot force an unbounded scan.
fn parse_string(bytes: &mut BytesMut) -> Result<String> {
    let scan_len = bytes.len().min(MAX_STRING_LEN + 1);
    let null_pos = bytes[..scan_len]
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| TftpError::MalformedPacket("no NUL terminator found".to_string()))?;

    let field = bytes.split_to(null_pos);
    bytes.advance(1); // consume the terminator

    String::from_utf8(field.to_vec())
        .map_err(|e| TftpError::MalformedPacket(format!("invalid UTF-8: {e}")))
}
