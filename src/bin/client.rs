use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use tftpd::error::{Result, TftpError};
use tftpd::packet::{Packet, BLOCK_SIZE};

/// A minimal RFC 1350 TFTP client: fixed 512-byte blocks, lock-step ACKs,
/// no option negotiation. Intended for manual testing against `tftpd`.
#[derive(Parser, Debug)]
#[command(name = "tftp-client", about = "A minimal RFC 1350 TFTP client")]
struct Cli {
    /// TFTP server address (e.g. 127.0.0.1:6969).
    #[arg(short, long)]
    server: SocketAddr,

    /// Fetch a file from the server.
    #[arg(short, long, conflicts_with = "put")]
    get: Option<String>,

    /// Upload a file to the server.
    #[arg(short, long, conflicts_with = "get")]
    put: Option<String>,

    /// Local file path (destination for --get, source for --put).
    #[arg(short, long)]
    file: PathBuf,

    /// Per-datagram retransmit timeout in seconds.
    #[arg(short, long, default_value_t = 5)]
    timeout: u64,

    /// Maximum retransmits before giving up.
    #[arg(short = 'r', long, default_value_t = 5)]
    max_retries: u32,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_target(false)
        .init();

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let timeout_dur = Duration::from_secs(cli.timeout);

    match (cli.get, cli.put) {
        (Some(remote), None) => get(&socket, cli.server, &remote, &cli.file, timeout_dur, cli.max_retries).await,
        (None, Some(remote)) => put(&socket, cli.server, &remote, &cli.file, timeout_dur, cli.max_retries).await,
        _ => Err(TftpError::Tftp("specify exactly one of --get or --put".to_string())),
    }
}

async fn get(
    socket: &UdpSocket,
    server: SocketAddr,
    remote_name: &str,
    local_path: &PathBuf,
    timeout_dur: Duration,
    max_retries: u32,
) -> Result<()> {
    let request = Packet::Rrq {
        filename: remote_name.to_string(),
        mode: "octet".to_string(),
    }
    .to_bytes();
    socket.send_to(&request, server).await?;

    let mut file = File::create(local_path).await?;
    let mut expected_block: u16 = 1;
    let mut peer = server;
    let mut total: u64 = 0;

    loop {
        let packet = recv_with_retry(socket, &request, peer, timeout_dur, max_retries).await?;
        match packet {
            (from, Packet::Data { block, payload }) if block == expected_block => {
                peer = from;
                file.write_all(&payload).await?;
                total += payload.len() as u64;
                let ack = Packet::Ack { block }.to_bytes();
                socket.send_to(&ack, peer).await?;
                debug!(block, bytes = payload.len(), "received block");

                if payload.len() < BLOCK_SIZE {
                    info!(bytes = total, "transfer complete");
                    return Ok(());
                }
                expected_block = expected_block.wrapping_add(1);
            }
            (_, Packet::Data { block, .. }) => {
                warn!(expected_block, got = block, "ignoring out-of-order block");
            }
            (_, Packet::Error { code, message }) => {
                return Err(TftpError::Tftp(format!("server error {code}: {message}")));
            }
            (_, other) => {
                return Err(TftpError::Tftp(format!("unexpected packet: {other:?}")));
            }
        }
    }
}

async fn put(
    socket: &UdpSocket,
    server: SocketAddr,
    remote_name: &str,
    local_path: &PathBuf,
    timeout_dur: Duration,
    max_retries: u32,
) -> Result<()> {
    let request = Packet::Wrq {
        filename: remote_name.to_string(),
        mode: "octet".to_string(),
    }
    .to_bytes();
    socket.send_to(&request, server).await?;

    let (peer, ack) = recv_with_retry(socket, &request, server, timeout_dur, max_retries).await?;
    match ack {
        Packet::Ack { block: 0 } => {}
        Packet::Error { code, message } => {
            return Err(TftpError::Tftp(format!("server error {code}: {message}")));
        }
        other => return Err(TftpError::Tftp(format!("expected ACK(0), got {other:?}"))),
    }

    let mut file = File::open(local_path).await?;
    let mut block: u16 = 1;
    let mut total: u64 = 0;

    loop {
        let mut buf = vec![0u8; BLOCK_SIZE];
        let n = file.read(&mut buf).await?;
        buf.truncate(n);
        total += n as u64;

        let data = Packet::Data { block, payload: buf.clone() }.to_bytes();
        let (_, reply) = recv_with_retry(socket, &data, peer, timeout_dur, max_retries).await?;
        match reply {
            Packet::Ack { block: acked } if acked == block => {
                debug!(block, bytes = n, "block acknowledged");
            }
            Packet::Error { code, message } => {
                return Err(TftpError::Tftp(format!("server error {code}: {message}")));
            }
            other => return Err(TftpError::Tftp(format!("expected ACK({block}), got {other:?}"))),
        }

        if n < BLOCK_SIZE {
            info!(bytes = total, "transfer complete");
            return Ok(());
        }
        block = block.wrapping_add(1);
    }
}

/// Send `datagram` to `peer`, waiting for a reply; retransmit on timeout up
/// to `max_retries` times before giving up.
async fn recv_with_retry(
    socket: &UdpSocket,
    datagram: &[u8],
    peer: SocketAddr,
    timeout_dur: Duration,
    max_retries: u32,
) -> Result<(SocketAddr, Packet)> {
    let mut buf = vec![0u8; 65536];
    for attempt in 0..=max_retries {
        if attempt > 0 {
            warn!(attempt, "retransmitting after timeout");
            socket.send_to(datagram, peer).await?;
        }
        match timeout(timeout_dur, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => return Ok((from, Packet::parse(&buf[..len])?)),
            Ok(Err(e)) => return Err(TftpError::Io(e)),
            Err(_) => continue,
        }
    }
    Err(TftpError::Tftp("no reply after max retries".to_string()))
}
