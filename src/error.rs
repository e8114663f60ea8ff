use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::packet::ErrorCode;

/// Error kinds internal to the TFTP core.
///
/// Each variant that can occur while a session is live knows how to render
/// itself as a wire ERROR packet via [`TftpError::to_wire`]; variants that
/// can only occur outside a session (I/O setup, config, CLI glue) do not.
#[derive(Error, Debug)]
pub enum TftpError {
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),

    #[error("path escapes root: {0}")]
    PathEscapesRoot(String),

    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("can not open file: {0}")]
    FileOpen(PathBuf),

    #[error("can not write file: {0}")]
    FileWrite(PathBuf),

    #[error("file already exists: {0}")]
    FileExists(PathBuf),

    #[error("unknown transfer id from {0}")]
    UnknownTid(SocketAddr),

    #[error("{0}")]
    Tftp(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, TftpError>;

impl TftpError {
    /// The (code, message) pair this error should be reported as on the wire,
    /// per §6/§7: errors with no session-facing meaning (I/O setup, config)
    /// return `None` and are only logged.
    pub fn to_wire(&self) -> Option<(ErrorCode, String)> {
        match self {
            TftpError::MalformedPacket(_) | TftpError::UnknownOpcode(_) => Some((
                ErrorCode::IllegalOperation,
                "Illegal TFTP operation".to_string(),
            )),
            TftpError::PathEscapesRoot(_) => Some((
                ErrorCode::IllegalOperation,
                "Illegal TFTP operation".to_string(),
            )),
            TftpError::FileNotFound(_) => {
                Some((ErrorCode::FileNotFound, "File not found".to_string()))
            }
            TftpError::FileOpen(_) => {
                Some((ErrorCode::AccessViolation, "Can not open file".to_string()))
            }
            TftpError::FileWrite(_) => Some((
                ErrorCode::AccessViolation,
                "Can not write file".to_string(),
            )),
            TftpError::FileExists(_) => Some((
                ErrorCode::FileAlreadyExists,
                "File already exists".to_string(),
            )),
            TftpError::UnknownTid(_) => Some((
                ErrorCode::UnknownTransferId,
                "Unknown transfer ID".to_string(),
            )),
            TftpError::Tftp(msg) => Some((ErrorCode::IllegalOperation, msg.clone())),
            TftpError::Io(_) | TftpError::Other(_) => None,
        }
    }
}
