//! End-to-end tests driving a real `Dispatcher` over loopback UDP.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tftpd::config::TftpConfig;
use tftpd::packet::{ErrorCode, Packet, BLOCK_SIZE};
use tftpd::Dispatcher;
use tokio::net::UdpSocket;

fn temp_root() -> PathBuf {
    let mut dir = std::env::temp_dir();
    dir.push(format!("tftpd_integration_test_{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

async fn start_server(mut config: TftpConfig) -> SocketAddr {
    config.bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
    let dispatcher = Arc::new(Dispatcher::bind(Arc::new(config)).await.unwrap());
    let addr = dispatcher.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = dispatcher.run().await;
    });
    addr
}

#[tokio::test]
async fn full_read_transfer_spanning_multiple_blocks() {
    let root = temp_root();
    let contents = vec![b'z'; BLOCK_SIZE * 2 + 37];
    std::fs::write(root.join("big.bin"), &contents).unwrap();

    let mut config = TftpConfig::default();
    config.root_dir = root;
    let addr = start_server(config).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(
            &Packet::Rrq { filename: "big.bin".into(), mode: "octet".into() }.to_bytes(),
            addr,
        )
        .await
        .unwrap();

    let mut received = Vec::new();
    let mut buf = [0u8; 65536];
    let mut block: u16 = 1;
    loop {
        let (len, server) = client.recv_from(&mut buf).await.unwrap();
        match Packet::parse(&buf[..len]).unwrap() {
            Packet::Data { block: b, payload } => {
                assert_eq!(b, block);
                let is_final = payload.len() < BLOCK_SIZE;
                received.extend_from_slice(&payload);
                client
                    .send_to(&Packet::Ack { block: b }.to_bytes(), server)
                    .await
                    .unwrap();
                if is_final {
                    break;
                }
                block = block.wrapping_add(1);
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    assert_eq!(received, contents);
}

#[tokio::test]
async fn write_then_read_back_round_trip() {
    let root = temp_root();
    let mut config = TftpConfig::default();
    config.root_dir = root;
    config.write_config.enabled = true;
    config.write_config.allowed_patterns = vec!["*.dat".to_string()];
    let addr = start_server(config).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let payload = vec![b'q'; 900];

    client
        .send_to(
            &Packet::Wrq { filename: "roundtrip.dat".into(), mode: "octet".into() }.to_bytes(),
            addr,
        )
        .await
        .unwrap();

    let mut buf = [0u8; 65536];
    let (len, server) = client.recv_from(&mut buf).await.unwrap();
    assert_eq!(Packet::parse(&buf[..len]).unwrap(), Packet::Ack { block: 0 });

    let mut remaining = payload.as_slice();
    let mut block: u16 = 1;
    loop {
        let chunk_len = remaining.len().min(BLOCK_SIZE);
        let chunk = remaining[..chunk_len].to_vec();
        remaining = &remaining[chunk_len..];

        client
            .send_to(&Packet::Data { block, payload: chunk.clone() }.to_bytes(), server)
            .await
            .unwrap();
        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(Packet::parse(&buf[..len]).unwrap(), Packet::Ack { block });

        if chunk_len < BLOCK_SIZE {
            break;
        }
        block = block.wrapping_add(1);
    }

    client
        .send_to(
            &Packet::Rrq { filename: "roundtrip.dat".into(), mode: "octet".into() }.to_bytes(),
            addr,
        )
        .await
        .unwrap();
    let (len, server) = client.recv_from(&mut buf).await.unwrap();
    match Packet::parse(&buf[..len]).unwrap() {
        Packet::Data { block: 1, payload: received } => assert_eq!(received, payload),
        other => panic!("unexpected packet: {other:?}"),
    }
    client
        .send_to(&Packet::Ack { block: 1 }.to_bytes(), server)
        .await
        .unwrap();
}

#[tokio::test]
async fn wrq_against_existing_file_is_rejected() {
    let root = temp_root();
    std::fs::write(root.join("exists.dat"), b"already here").unwrap();
    let mut config = TftpConfig::default();
    config.root_dir = root;
    config.write_config.enabled = true;
    config.write_config.allowed_patterns = vec!["*.dat".to_string()];
    let addr = start_server(config).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(
            &Packet::Wrq { filename: "exists.dat".into(), mode: "octet".into() }.to_bytes(),
            addr,
        )
        .await
        .unwrap();

    let mut buf = [0u8; 65536];
    let (len, _) = client.recv_from(&mut buf).await.unwrap();
    match Packet::parse(&buf[..len]).unwrap() {
        Packet::Error { code, .. } => assert_eq!(code, ErrorCode::FileAlreadyExists as u16),
        other => panic!("unexpected packet: {other:?}"),
    }
}

#[tokio::test]
async fn idle_session_is_retransmitted_then_torn_down() {
    let root = temp_root();
    std::fs::write(root.join("slow.txt"), b"abc").unwrap();
    let mut config = TftpConfig::default();
    config.root_dir = root;
    let addr = start_server(config).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(
            &Packet::Rrq { filename: "slow.txt".into(), mode: "octet".into() }.to_bytes(),
            addr,
        )
        .await
        .unwrap();

    let mut buf = [0u8; 65536];
    let (len, _) = client.recv_from(&mut buf).await.unwrap();
    let first = buf[..len].to_vec();

    // Don't ACK. The watchdog should resend the same DATA(1) after 5s.
    let (len2, _) = tokio::time::timeout(Duration::from_secs(7), client.recv_from(&mut buf))
        .await
        .expect("expected a retransmit within 7s")
        .unwrap();
    assert_eq!(&buf[..len2], first.as_slice());
}
