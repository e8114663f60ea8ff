//! Single-socket dispatcher (§4.5, §5): the one piece that owns the UDP
//! socket, maps inbound datagrams to sessions by `(remote_ip, remote_port)`,
//! and creates a session on a first-seen RRQ/WRQ.
//!
//! This departs from the common TFTP server shape of one ephemeral socket
//! per transfer (RFC 1350's suggested TID scheme): every reply, including
//! retransmits, goes out the same bound socket the initial request arrived
//! on. The session map is the substitute for per-transfer ports.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::audit::AuditLogger;
use crate::config::TftpConfig;
use crate::error::{Result, TftpError};
use crate::packet::{ErrorCode, Packet};
use crate::path;
use crate::session::Session;
use crate::watchdog::{self, WatchdogEvent, WatchdogHandle};

struct SessionEntry {
    session: Arc<Session>,
    watchdog: WatchdogHandle,
}

/// Owns the bound socket and the live session map. `run` does not return
/// until its socket errors or the process is asked to stop.
pub struct Dispatcher {
    socket: UdpSocket,
    config: Arc<TftpConfig>,
    root_dir: PathBuf,
    sessions: Mutex<HashMap<SocketAddr, SessionEntry>>,
}

impl Dispatcher {
    pub async fn bind(config: Arc<TftpConfig>) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        let root_dir = config
            .root_dir
            .canonicalize()
            .map_err(|e| TftpError::Tftp(format!("root_dir canonicalize failed: {e}")))?;
        info!(bind_addr = %config.bind_addr, root_dir = %root_dir.display(), "tftp dispatcher bound");
        Ok(Self {
            socket,
            config,
            root_dir,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Drive the server loop. Returns only on a socket I/O error.
    ///
    /// Datagrams are handled inline rather than spawned onto their own task:
    /// §5 requires that packets on a single session be processed in receive
    /// order, and a fresh task per datagram gives the scheduler no such
    /// guarantee even with the per-session lock (two tasks racing to
    /// acquire it can enter in either order). Handling inline makes receive
    /// order the only order, at the cost of one slow transfer's file I/O
    /// momentarily delaying datagrams for other sessions — an acceptable
    /// trade for a lock-step, low-throughput protocol.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<WatchdogEvent>();
        let mut buf = vec![0u8; 65536];

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    let (len, peer) = result?;
                    let datagram = buf[..len].to_vec();
                    self.handle_datagram(peer, datagram, events_tx.clone()).await;
                }
                Some(event) = events_rx.recv() => {
                    self.handle_watchdog_event(event).await;
                }
            }
        }
    }

    async fn handle_datagram(
        &self,
        peer: SocketAddr,
        datagram: Vec<u8>,
        events_tx: mpsc::UnboundedSender<WatchdogEvent>,
    ) {
        let packet = match Packet::parse(&datagram) {
            Ok(packet) => packet,
            Err(err) => {
                self.handle_parse_error(peer, err).await;
                return;
            }
        };

        let existing = {
            let sessions = self.sessions.lock().await;
            sessions.get(&peer).map(|entry| {
                entry.watchdog.reset();
                Arc::clone(&entry.session)
            })
        };

        match existing {
            Some(session) => {
                let outcome = session.step(&packet).await;
                self.apply_outcome(peer, outcome).await;
            }
            None => self.handle_initial(peer, packet, events_tx).await,
        }
    }

    async fn handle_parse_error(&self, peer: SocketAddr, err: TftpError) {
        let had_session = {
            let mut sessions = self.sessions.lock().await;
            sessions.remove(&peer)
        };

        let Some(entry) = had_session else {
            debug!(%peer, %err, "dropping unparseable datagram from unknown peer");
            return;
        };

        entry.watchdog.stop();
        if let Some((code, message)) = err.to_wire() {
            AuditLogger::protocol_violation(&peer, &message);
            let reply = Packet::error(code, message).to_bytes();
            let _ = self.socket.send_to(&reply, peer).await;
        }
    }

    async fn handle_initial(
        &self,
        peer: SocketAddr,
        packet: Packet,
        events_tx: mpsc::UnboundedSender<WatchdogEvent>,
    ) {
        match packet {
            Packet::Rrq { filename, mode: _ } => self.start_read(peer, filename, events_tx).await,
            Packet::Wrq { filename, mode: _ } => self.start_write(peer, filename, events_tx).await,
            _ => {
                // A well-formed packet from a peer with no session of its own:
                // the RFC 1350 response to an unexpected TID (§7).
                warn!(%peer, "packet from peer with no active session");
                let reply =
                    Packet::error(ErrorCode::UnknownTransferId, "Unknown transfer ID").to_bytes();
                let _ = self.socket.send_to(&reply, peer).await;
            }
        }
    }

    async fn start_read(
        &self,
        peer: SocketAddr,
        filename: String,
        events_tx: mpsc::UnboundedSender<WatchdogEvent>,
    ) {
        let resolved = path::resolve(
            &self.root_dir,
            self.config.get_template(),
            &filename,
            peer.ip(),
            peer.port(),
        );
        let target = match resolved {
            Ok(target) => target,
            Err(err) => {
                AuditLogger::path_traversal_attempt(&peer, &filename);
                self.deny(peer, &err).await;
                return;
            }
        };

        if self.config.max_file_size_bytes > 0 {
            if let Ok(meta) = tokio::fs::metadata(&target).await {
                if meta.len() > self.config.max_file_size_bytes {
                    AuditLogger::read_denied(&peer, &filename, "file exceeds max_file_size_bytes");
                    let reply =
                        Packet::error(ErrorCode::AccessViolation, "Can not open file").to_bytes();
                    let _ = self.socket.send_to(&reply, peer).await;
                    return;
                }
            }
        }

        match Session::open_read(peer, target).await {
            Ok((session, first)) => {
                AuditLogger::transfer_started(&peer, &filename, "read");
                self.insert_session(peer, session, first, events_tx).await;
            }
            Err(err) => {
                AuditLogger::read_denied(&peer, &filename, &err.to_string());
                self.deny(peer, &err).await;
            }
        }
    }

    async fn start_write(
        &self,
        peer: SocketAddr,
        filename: String,
        events_tx: mpsc::UnboundedSender<WatchdogEvent>,
    ) {
        if !self.config.write_config.enabled {
            AuditLogger::write_request_denied(&peer, &filename, "writes are disabled");
            let reply = Packet::error(ErrorCode::IllegalOperation, "Illegal TFTP operation")
                .to_bytes();
            let _ = self.socket.send_to(&reply, peer).await;
            return;
        }

        if !self.is_write_allowed(&filename) {
            AuditLogger::write_request_denied(&peer, &filename, "no matching allowed_patterns");
            let reply = Packet::error(ErrorCode::IllegalOperation, "Illegal TFTP operation")
                .to_bytes();
            let _ = self.socket.send_to(&reply, peer).await;
            return;
        }

        let resolved = path::resolve(
            &self.root_dir,
            self.config.put_template(),
            &filename,
            peer.ip(),
            peer.port(),
        );
        let target = match resolved {
            Ok(target) => target,
            Err(err) => {
                AuditLogger::path_traversal_attempt(&peer, &filename);
                self.deny(peer, &err).await;
                return;
            }
        };

        if tokio::fs::metadata(&target).await.is_ok() {
            let err = TftpError::FileExists(target);
            AuditLogger::write_request_denied(&peer, &filename, "target already exists");
            self.deny(peer, &err).await;
            return;
        }

        match Session::open_write(peer, target).await {
            Ok((session, first)) => {
                AuditLogger::transfer_started(&peer, &filename, "write");
                self.insert_session(peer, session, first, events_tx).await;
            }
            Err(err) => {
                AuditLogger::write_request_denied(&peer, &filename, &err.to_string());
                self.deny(peer, &err).await;
            }
        }
    }

    fn is_write_allowed(&self, filename: &str) -> bool {
        self.config
            .write_config
            .allowed_patterns
            .iter()
            .filter_map(|p| glob::Pattern::new(p).ok())
            .any(|pattern| pattern.matches(filename))
    }

    async fn insert_session(
        &self,
        peer: SocketAddr,
        session: Session,
        first: Vec<u8>,
        events_tx: mpsc::UnboundedSender<WatchdogEvent>,
    ) {
        let session = Arc::new(session);
        let watchdog = watchdog::spawn(Arc::clone(&session), events_tx);

        {
            let mut sessions = self.sessions.lock().await;
            sessions.insert(peer, SessionEntry { session, watchdog });
        }

        let _ = self.socket.send_to(&first, peer).await;
    }

    async fn apply_outcome(&self, peer: SocketAddr, outcome: crate::session::StepOutcome) {
        use crate::session::StepOutcome;
        match outcome {
            StepOutcome::Reply(bytes) => {
                let _ = self.socket.send_to(&bytes, peer).await;
            }
            StepOutcome::ReplyAndClose(bytes) => {
                let _ = self.socket.send_to(&bytes, peer).await;
                self.remove_session(peer, "transfer finished").await;
            }
            StepOutcome::Close => {
                self.remove_session(peer, "peer closed transfer").await;
            }
            StepOutcome::Ignore => {}
        }
    }

    async fn handle_watchdog_event(&self, event: WatchdogEvent) {
        match event {
            WatchdogEvent::Retransmit(peer, bytes) => {
                let _ = self.socket.send_to(&bytes, peer).await;
            }
            WatchdogEvent::TimedOut(peer) => {
                AuditLogger::transfer_failed(&peer, "idle timeout");
                self.remove_session(peer, "idle timeout").await;
            }
        }
    }

    async fn remove_session(&self, peer: SocketAddr, reason: &str) {
        let removed = {
            let mut sessions = self.sessions.lock().await;
            sessions.remove(&peer)
        };
        if let Some(entry) = removed {
            entry.watchdog.stop();
            let bytes = entry.session.bytes_transferred().await;
            debug!(%peer, reason, bytes, "session removed");
            AuditLogger::transfer_completed(&peer, bytes, reason);
        }
    }

    async fn deny(&self, peer: SocketAddr, err: &TftpError) {
        if let Some((code, message)) = err.to_wire() {
            let reply = Packet::error(code, message).to_bytes();
            let _ = self.socket.send_to(&reply, peer).await;
        } else {
            warn!(%peer, %err, "request denied with no wire representation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::net::UdpSocket as ClientSocket;

    fn temp_root() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("snow_owl_tftp_dispatcher_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    async fn spawn_dispatcher(config: TftpConfig) -> (Arc<Dispatcher>, SocketAddr) {
        let mut config = config;
        config.bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let dispatcher = Arc::new(Dispatcher::bind(Arc::new(config)).await.unwrap());
        let addr = dispatcher.local_addr().unwrap();
        let run_handle = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            let _ = run_handle.run().await;
        });
        (dispatcher, addr)
    }

    #[tokio::test]
    async fn serves_a_small_file_over_rrq() {
        let root = temp_root();
        std::fs::write(root.join("hello.txt"), b"hi there").unwrap();
        let mut config = TftpConfig::default();
        config.root_dir = root;
        let (_dispatcher, addr) = spawn_dispatcher(config).await;

        let client = ClientSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(
                &Packet::Rrq { filename: "hello.txt".into(), mode: "octet".into() }.to_bytes(),
                addr,
            )
            .await
            .unwrap();

        let mut buf = [0u8; 1024];
        let (len, server_addr) = client.recv_from(&mut buf).await.unwrap();
        match Packet::parse(&buf[..len]).unwrap() {
            Packet::Data { block: 1, payload } => assert_eq!(payload, b"hi there"),
            other => panic!("expected DATA(1), got {other:?}"),
        }

        client
            .send_to(&Packet::Ack { block: 1 }.to_bytes(), server_addr)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rrq_for_missing_file_returns_file_not_found() {
        let root = temp_root();
        let mut config = TftpConfig::default();
        config.root_dir = root;
        let (_dispatcher, addr) = spawn_dispatcher(config).await;

        let client = ClientSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(
                &Packet::Rrq { filename: "nope.txt".into(), mode: "octet".into() }.to_bytes(),
                addr,
            )
            .await
            .unwrap();

        let mut buf = [0u8; 1024];
        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        match Packet::parse(&buf[..len]).unwrap() {
            Packet::Error { code, .. } => assert_eq!(code, ErrorCode::FileNotFound as u16),
            other => panic!("expected ERROR(FileNotFound), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wrq_is_refused_when_writes_disabled() {
        let root = temp_root();
        let mut config = TftpConfig::default();
        config.root_dir = root;
        config.write_config.enabled = false;
        let (_dispatcher, addr) = spawn_dispatcher(config).await;

        let client = ClientSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(
                &Packet::Wrq { filename: "upload.bin".into(), mode: "octet".into() }.to_bytes(),
                addr,
            )
            .await
            .unwrap();

        let mut buf = [0u8; 1024];
        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        match Packet::parse(&buf[..len]).unwrap() {
            Packet::Error { code, .. } => assert_eq!(code, ErrorCode::IllegalOperation as u16),
            other => panic!("expected ERROR(IllegalOperation), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wrq_succeeds_for_a_matching_pattern() {
        let root = temp_root();
        let mut config = TftpConfig::default();
        config.root_dir = root.clone();
        config.write_config.enabled = true;
        config.write_config.allowed_patterns = vec!["*.bin".to_string()];
        let (_dispatcher, addr) = spawn_dispatcher(config).await;

        let client = ClientSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(
                &Packet::Wrq { filename: "upload.bin".into(), mode: "octet".into() }.to_bytes(),
                addr,
            )
            .await
            .unwrap();

        let mut buf = [0u8; 1024];
        let (len, server_addr) = client.recv_from(&mut buf).await.unwrap();
        match Packet::parse(&buf[..len]).unwrap() {
            Packet::Ack { block: 0 } => {}
            other => panic!("expected ACK(0), got {other:?}"),
        }

        client
            .send_to(
                &Packet::Data { block: 1, payload: b"contents".to_vec() }.to_bytes(),
                server_addr,
            )
            .await
            .unwrap();

        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        match Packet::parse(&buf[..len]).unwrap() {
            Packet::Ack { block: 1 } => {}
            other => panic!("expected ACK(1), got {other:?}"),
        }

        assert_eq!(std::fs::read(root.join("upload.bin")).unwrap(), b"contents");
    }

    #[tokio::test]
    async fn wrq_refused_for_non_matching_pattern() {
        let root = temp_root();
        let mut config = TftpConfig::default();
        config.root_dir = root;
        config.write_config.enabled = true;
        config.write_config.allowed_patterns = vec!["*.bin".to_string()];
        let (_dispatcher, addr) = spawn_dispatcher(config).await;

        let client = ClientSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(
                &Packet::Wrq { filename: "upload.txt".into(), mode: "octet".into() }.to_bytes(),
                addr,
            )
            .await
            .unwrap();

        let mut buf = [0u8; 1024];
        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        match Packet::parse(&buf[..len]).unwrap() {
            Packet::Error { code, .. } => assert_eq!(code, ErrorCode::IllegalOperation as u16),
            other => panic!("expected ERROR(IllegalOperation), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn path_traversal_is_rejected_with_illegal_operation() {
        let root = temp_root();
        let mut config = TftpConfig::default();
        config.root_dir = root;
        let (_dispatcher, addr) = spawn_dispatcher(config).await;

        let client = ClientSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(
                &Packet::Rrq { filename: "../../etc/passwd".into(), mode: "octet".into() }
                    .to_bytes(),
                addr,
            )
            .await
            .unwrap();

        let mut buf = [0u8; 1024];
        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        match Packet::parse(&buf[..len]).unwrap() {
            Packet::Error { code, .. } => assert_eq!(code, ErrorCode::IllegalOperation as u16),
            other => panic!("expected ERROR(IllegalOperation), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unsolicited_ack_from_unknown_peer_gets_unknown_tid() {
        // An ACK with no matching session is well-formed but unattributable,
        // so it is answered (not silently dropped) with ERROR(UnknownTid).
        let root = temp_root();
        let mut config = TftpConfig::default();
        config.root_dir = root;
        let (_dispatcher, addr) = spawn_dispatcher(config).await;

        let client = ClientSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&Packet::Ack { block: 1 }.to_bytes(), addr)
            .await
            .unwrap();

        let mut buf = [0u8; 1024];
        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        match Packet::parse(&buf[..len]).unwrap() {
            Packet::Error { code, .. } => assert_eq!(code, ErrorCode::UnknownTransferId as u16),
            other => panic!("expected ERROR(UnknownTransferId), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unparseable_datagram_from_unknown_peer_is_dropped_silently() {
        let root = temp_root();
        let mut config = TftpConfig::default();
        config.root_dir = root;
        let (_dispatcher, addr) = spawn_dispatcher(config).await;

        let client = ClientSocket::bind("127.0.0.1:0").await.unwrap();
        // Opcode 9 doesn't exist; unparseable and unattributable to any
        // session, so it is dropped with no reply at all.
        client.send_to(&[0u8, 9, 1, 2], addr).await.unwrap();

        let mut buf = [0u8; 1024];
        let result =
            tokio::time::timeout(std::time::Duration::from_millis(200), client.recv_from(&mut buf))
                .await;
        assert!(result.is_err(), "expected no reply to an unparseable datagram");
    }
}
