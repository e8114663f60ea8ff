//! A minimal RFC 1350 TFTP server: fixed 512-byte blocks, no option
//! negotiation, a single shared UDP socket instead of per-transfer
//! ephemeral ports, and a session map keyed by `(remote_ip, remote_port)`.

pub mod audit;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod packet;
pub mod path;
pub mod privilege;
pub mod session;
pub mod watchdog;

pub use config::TftpConfig;
pub use dispatcher::Dispatcher;
pub use error::{Result, TftpError};
pub use packet::{ErrorCode, Opcode, Packet, BLOCK_SIZE};
