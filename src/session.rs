//! Per-session protocol state machine (§3, §4.3).
//!
//! A `Session` owns exactly one open file handle and is driven by the
//! dispatcher (on packet receipt) and by its own [`crate::watchdog`] (on
//! timer tick). Both callers go through [`Session::step`] /
//! [`Session::retransmit`] / [`Session::close`], which serialize on the
//! session's internal lock — the synchronization discipline required by §5.

use std::net::SocketAddr;
use std::path::PathBuf;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, TftpError};
use crate::packet::{BLOCK_SIZE, ErrorCode, Packet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Sending,
    AwaitFinalAck,
    Receiving,
}

/// What a session step (or watchdog tick) asks the dispatcher to do.
pub enum StepOutcome {
    /// Send this datagram; the session stays open.
    Reply(Vec<u8>),
    /// Send this datagram, then tear the session down.
    ReplyAndClose(Vec<u8>),
    /// Tear the session down; nothing to send.
    Close,
    /// Duplicate or out-of-window packet: do nothing.
    Ignore,
}

struct Inner {
    direction: Direction,
    state: State,
    file: File,
    path: PathBuf,
    expected_block: u16,
    bytes_transferred: u64,
    last_sent: Vec<u8>,
    eof_sent: bool,
}

/// One active RRQ or WRQ transfer, keyed by `(remote_ip, remote_port)` in
/// the dispatcher's session map.
pub struct Session {
    peer: SocketAddr,
    inner: Mutex<Inner>,
}

impl Session {
    /// Open `path` for reading and produce the initial `DATA(1, ...)` datagram.
    ///
    /// Per §9's resolved open question: bail out on open failure before any
    /// read is attempted (the Python source's subtle bug is not replicated).
    pub async fn open_read(peer: SocketAddr, path: PathBuf) -> Result<(Self, Vec<u8>)> {
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {}
            _ => return Err(TftpError::FileNotFound(path)),
        }
        let mut file = File::open(&path)
            .await
            .map_err(|_| TftpError::FileOpen(path.clone()))?;

        let payload = read_block(&mut file).await;
        let eof_sent = payload.len() < BLOCK_SIZE;
        let packet = Packet::Data {
            block: 1,
            payload: payload.clone(),
        }
        .to_bytes();

        let inner = Inner {
            direction: Direction::Read,
            state: if eof_sent {
                State::AwaitFinalAck
            } else {
                State::Sending
            },
            file,
            path,
            expected_block: 1,
            bytes_transferred: payload.len() as u64,
            last_sent: packet.clone(),
            eof_sent,
        };

        Ok((
            Self {
                peer,
                inner: Mutex::new(inner),
            },
            packet,
        ))
    }

    /// Open `path` for writing (caller has already confirmed it does not
    /// exist — §4.3 rejects overwrite before this is called) and produce the
    /// initial `ACK(0)` datagram.
    pub async fn open_write(peer: SocketAddr, path: PathBuf) -> Result<(Self, Vec<u8>)> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|_| TftpError::FileOpen(path.clone()))?;

        let packet = Packet::Ack { block: 0 }.to_bytes();

        let inner = Inner {
            direction: Direction::Write,
            state: State::Receiving,
            file,
            path,
            expected_block: 1,
            bytes_transferred: 0,
            last_sent: packet.clone(),
            eof_sent: false,
        };

        Ok((
            Self {
                peer,
                inner: Mutex::new(inner),
            },
            packet,
        ))
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn path(&self) -> PathBuf {
        self.inner.lock().await.path.clone()
    }

    pub async fn direction(&self) -> Direction {
        self.inner.lock().await.direction
    }

    pub async fn bytes_transferred(&self) -> u64 {
        self.inner.lock().await.bytes_transferred
    }

    /// The most recently sent datagram, verbatim, for watchdog retransmit
    /// (§4.4: retransmit the cached bytes, never a fresh file read).
    pub async fn last_sent(&self) -> Vec<u8> {
        self.inner.lock().await.last_sent.clone()
    }

    /// Advance the state machine by one inbound packet.
    pub async fn step(&self, packet: &Packet) -> StepOutcome {
        if let Packet::Error { code, message } = packet {
            info!(peer = %self.peer, code, message, "peer sent ERROR, closing session");
            return StepOutcome::Close;
        }

        let mut inner = self.inner.lock().await;
        let outcome = match (inner.direction, inner.state) {
            (Direction::Read, State::Sending) => inner.step_read_sending(packet).await,
            (Direction::Read, State::AwaitFinalAck) => inner.step_read_final_ack(packet),
            (Direction::Write, State::Receiving) => inner.step_write_receiving(packet).await,
            _ => unreachable!("session direction/state pairs are exhaustive"),
        };

        if let StepOutcome::Reply(bytes) | StepOutcome::ReplyAndClose(bytes) = &outcome {
            inner.last_sent = bytes.clone();
        }

        outcome
    }
}

impl Inner {
    async fn step_read_sending(&mut self, packet: &Packet) -> StepOutcome {
        let Packet::Ack { block } = packet else {
            warn!(path = %self.path.display(), "unexpected packet on read session");
            return illegal_op();
        };

        if *block != self.expected_block {
            return StepOutcome::Ignore;
        }

        let payload = read_block(&mut self.file).await;
        self.expected_block = self.expected_block.wrapping_add(1);
        self.bytes_transferred += payload.len() as u64;
        let is_final = payload.len() < BLOCK_SIZE;

        let reply = Packet::Data {
            block: self.expected_block,
            payload,
        }
        .to_bytes();

        if is_final {
            self.eof_sent = true;
            self.state = State::AwaitFinalAck;
        }

        StepOutcome::Reply(reply)
    }

    fn step_read_final_ack(&mut self, packet: &Packet) -> StepOutcome {
        if matches!(packet, Packet::Ack { .. }) {
            debug!(path = %self.path.display(), bytes = self.bytes_transferred, "read transfer complete");
            StepOutcome::Close
        } else {
            illegal_op()
        }
    }

    async fn step_write_receiving(&mut self, packet: &Packet) -> StepOutcome {
        let Packet::Data { block, payload } = packet else {
            warn!(path = %self.path.display(), "unexpected packet on write session");
            return illegal_op();
        };

        if *block != self.expected_block {
            // Duplicate/out-of-order block: rely on the peer's own retransmit
            // rather than re-ACKing (§4.3, §9 open question: silent drop).
            return StepOutcome::Ignore;
        }

        if let Err(e) = self.file.write_all(payload).await {
            warn!(path = %self.path.display(), error = %e, "write failed");
            let reply = Packet::error(ErrorCode::AccessViolation, "Can not write file").to_bytes();
            return StepOutcome::ReplyAndClose(reply);
        }

        self.bytes_transferred += payload.len() as u64;
        let is_final = payload.len() < BLOCK_SIZE;
        self.expected_block = self.expected_block.wrapping_add(1);

        let reply = Packet::Ack {
            block: *block,
        }
        .to_bytes();

        if is_final {
            debug!(path = %self.path.display(), bytes = self.bytes_transferred, "write transfer complete");
            StepOutcome::ReplyAndClose(reply)
        } else {
            StepOutcome::Reply(reply)
        }
    }
}

fn illegal_op() -> StepOutcome {
    let reply = Packet::error(ErrorCode::IllegalOperation, "Illegal TFTP operation").to_bytes();
    StepOutcome::ReplyAndClose(reply)
}

/// Read up to one block. A read I/O failure is treated as an empty payload,
/// i.e. end-of-transfer (§4.3) rather than propagated as an error.
async fn read_block(file: &mut File) -> Vec<u8> {
    let mut buf = vec![0u8; BLOCK_SIZE];
    let n = file.read(&mut buf).await.unwrap_or(0);
    buf.truncate(n);
    buf
}
