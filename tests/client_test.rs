//! End-to-end transfer scenarios against a scripted peer.
//!
//! Each test binds real UDP sockets on loopback and plays the server side of
//! RFC 1350 by hand, so the whole engine is exercised: socket, deadlines,
//! retransmission, transfer-ID tracking, and the local file.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tempdir::TempDir;
use tftpc::client::{ClientError, ClientSession, Direction};
use tftpc::tftp::{ErrorCode, FileMode, Packet, TftpSocket};

/// Generous bound for scripted receives; the tests finish far quicker.
const RECV_TTL: Duration = Duration::from_secs(5);

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Receives until the wanted ack arrives. The client retransmits its last
/// packet whenever we are slow, so duplicates of earlier acks are fine.
async fn recv_ack(sock: &mut TftpSocket, want: u16) {
    loop {
        let (packet, _) = sock.recv_with_timeout(RECV_TTL).await.unwrap();
        match packet {
            Packet::Ack { block } if block == want => return,
            Packet::Ack { block } => assert!(block < want, "ack for unsent block {block}"),
            other => panic!("expected an ack, got {other:?}"),
        }
    }
}

/// Receives until the wanted data block arrives, skipping retransmitted
/// copies of earlier blocks.
async fn recv_data(sock: &mut TftpSocket, want: u16) -> Vec<u8> {
    loop {
        let (packet, _) = sock.recv_with_timeout(RECV_TTL).await.unwrap();
        match packet {
            Packet::Data { block, data } if block == want => return data,
            Packet::Data { block, .. } => assert!(block < want, "data for unsent block {block}"),
            other => panic!("expected data block {want}, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_download_single_block() {
    let tmpdir = TempDir::new("scratch").unwrap();
    let local = tmpdir.path().join("small");

    let mut listen = TftpSocket::bind(loopback()).unwrap();
    let port = listen.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (req, client_addr) = listen.recv_with_timeout(RECV_TTL).await.unwrap();
        assert_eq!(req, Packet::ReadReq { path: "small".to_string(), mode: FileMode::Octet });

        // Reply from a fresh socket: the server chooses a new transfer ID.
        let mut tid = TftpSocket::bind(loopback()).unwrap();
        tid.send(&Packet::Data { block: 1, data: vec![0xAA; 100] }, client_addr)
            .await
            .unwrap();
        recv_ack(&mut tid, 1).await;
    });

    let mut session =
        ClientSession::connect("127.0.0.1", port, Direction::Read, "small", &local, FileMode::Octet)
            .await
            .unwrap();
    session.run().await.unwrap();
    server.await.unwrap();

    assert_eq!(std::fs::read(&local).unwrap(), vec![0xAA; 100]);
}

#[tokio::test]
async fn test_download_two_blocks_with_empty_final_block() {
    let tmpdir = TempDir::new("scratch").unwrap();
    let local = tmpdir.path().join("big");

    let mut listen = TftpSocket::bind(loopback()).unwrap();
    let port = listen.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (req, client_addr) = listen.recv_with_timeout(RECV_TTL).await.unwrap();
        assert_eq!(req, Packet::ReadReq { path: "big".to_string(), mode: FileMode::Octet });

        let mut tid = TftpSocket::bind(loopback()).unwrap();
        tid.send(&Packet::Data { block: 1, data: vec![0x01; 512] }, client_addr)
            .await
            .unwrap();
        recv_ack(&mut tid, 1).await;
        tid.send(&Packet::Data { block: 2, data: vec![] }, client_addr)
            .await
            .unwrap();
        recv_ack(&mut tid, 2).await;
    });

    let mut session =
        ClientSession::connect("127.0.0.1", port, Direction::Read, "big", &local, FileMode::Octet)
            .await
            .unwrap();
    session.run().await.unwrap();
    server.await.unwrap();

    assert_eq!(std::fs::read(&local).unwrap(), vec![0x01; 512]);
}

#[tokio::test]
async fn test_upload_two_blocks() {
    let tmpdir = TempDir::new("scratch").unwrap();
    let local = tmpdir.path().join("big");
    let mut contents = vec![0x02; 512];
    contents.extend_from_slice(&[0x03; 88]);
    std::fs::write(&local, &contents).unwrap();

    let mut listen = TftpSocket::bind(loopback()).unwrap();
    let port = listen.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (req, client_addr) = listen.recv_with_timeout(RECV_TTL).await.unwrap();
        assert_eq!(req, Packet::WriteReq { path: "big".to_string(), mode: FileMode::Octet });

        let mut tid = TftpSocket::bind(loopback()).unwrap();
        tid.send(&Packet::Ack { block: 0 }, client_addr).await.unwrap();

        assert_eq!(recv_data(&mut tid, 1).await, vec![0x02; 512]);
        tid.send(&Packet::Ack { block: 1 }, client_addr).await.unwrap();

        assert_eq!(recv_data(&mut tid, 2).await, vec![0x03; 88]);
        tid.send(&Packet::Ack { block: 2 }, client_addr).await.unwrap();
    });

    let mut session =
        ClientSession::connect("127.0.0.1", port, Direction::Write, "big", &local, FileMode::Octet)
            .await
            .unwrap();
    session.run().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_retransmits_request_until_server_answers() {
    let tmpdir = TempDir::new("scratch").unwrap();
    let local = tmpdir.path().join("slow");

    let mut listen = TftpSocket::bind(loopback()).unwrap();
    let port = listen.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        // Stay deaf for the first two copies of the request.
        let mut client_addr = None;
        for _ in 0..3 {
            let (req, src) = listen.recv_with_timeout(RECV_TTL).await.unwrap();
            assert!(matches!(req, Packet::ReadReq { .. }));
            client_addr = Some(src);
        }

        let mut tid = TftpSocket::bind(loopback()).unwrap();
        tid.send(&Packet::Data { block: 1, data: vec![0x42; 10] }, client_addr.unwrap())
            .await
            .unwrap();
        recv_ack(&mut tid, 1).await;
    });

    let mut session =
        ClientSession::connect("127.0.0.1", port, Direction::Read, "slow", &local, FileMode::Octet)
            .await
            .unwrap();
    let started = Instant::now();
    session.run().await.unwrap();
    server.await.unwrap();

    // The third copy cannot have gone out before the 50 ms and 100 ms
    // backoff windows both expired.
    assert!(started.elapsed() >= Duration::from_millis(140), "retransmitted too eagerly");
    assert_eq!(std::fs::read(&local).unwrap(), vec![0x42; 10]);
}

#[tokio::test]
async fn test_server_error_is_reported() {
    let tmpdir = TempDir::new("scratch").unwrap();
    let local = tmpdir.path().join("absent");

    let mut listen = TftpSocket::bind(loopback()).unwrap();
    let port = listen.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (req, client_addr) = listen.recv_with_timeout(RECV_TTL).await.unwrap();
        assert_eq!(req, Packet::ReadReq { path: "absent".to_string(), mode: FileMode::Octet });

        let tid = TftpSocket::bind(loopback()).unwrap();
        tid.send(
            &Packet::Error { code: ErrorCode::FileNotFound, message: "File not found".to_string() },
            client_addr,
        )
        .await
        .unwrap();
    });

    let mut session =
        ClientSession::connect("127.0.0.1", port, Direction::Read, "absent", &local, FileMode::Octet)
            .await
            .unwrap();
    let err = session.run().await.unwrap_err();
    server.await.unwrap();

    match err {
        ClientError::Peer { code, message } => {
            assert_eq!(code, ErrorCode::FileNotFound);
            assert_eq!(message, "File not found");
        }
        other => panic!("expected a peer error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_stranger_tid_is_rejected() {
    let tmpdir = TempDir::new("scratch").unwrap();
    let local = tmpdir.path().join("guarded");

    let mut listen = TftpSocket::bind(loopback()).unwrap();
    let port = listen.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (_, client_addr) = listen.recv_with_timeout(RECV_TTL).await.unwrap();

        let mut tid = TftpSocket::bind(loopback()).unwrap();
        tid.send(&Packet::Data { block: 1, data: vec![0x11; 512] }, client_addr)
            .await
            .unwrap();
        recv_ack(&mut tid, 1).await;

        // The client's transfer ID is locked to us now. A stranger barging
        // in with the next block must get an error and change nothing.
        let mut stranger = TftpSocket::bind(loopback()).unwrap();
        stranger
            .send(&Packet::Data { block: 2, data: vec![0x99; 4] }, client_addr)
            .await
            .unwrap();
        let (reply, _) = stranger.recv_with_timeout(RECV_TTL).await.unwrap();
        assert!(
            matches!(reply, Packet::Error { code: ErrorCode::UnknownTid, .. }),
            "stranger got {reply:?}"
        );

        tid.send(&Packet::Data { block: 2, data: vec![0x22; 7] }, client_addr)
            .await
            .unwrap();
        recv_ack(&mut tid, 2).await;
    });

    let mut session =
        ClientSession::connect("127.0.0.1", port, Direction::Read, "guarded", &local, FileMode::Octet)
            .await
            .unwrap();
    session.run().await.unwrap();
    server.await.unwrap();

    let mut want = vec![0x11; 512];
    want.extend_from_slice(&[0x22; 7]);
    assert_eq!(std::fs::read(&local).unwrap(), want);
}

#[tokio::test]
async fn test_gives_up_when_server_stays_silent() {
    let tmpdir = TempDir::new("scratch").unwrap();
    let local = tmpdir.path().join("void");

    let mut listen = TftpSocket::bind(loopback()).unwrap();
    let port = listen.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        // Swallow every copy of the request and count them. The last
        // inter-send gap is 1600 ms, so a 2 s lull means the client is done.
        let mut copies = 0;
        while let Ok((req, _)) = listen.recv_with_timeout(Duration::from_secs(2)).await {
            assert!(matches!(req, Packet::ReadReq { .. }));
            copies += 1;
        }
        copies
    });

    let mut session =
        ClientSession::connect("127.0.0.1", port, Direction::Read, "void", &local, FileMode::Octet)
            .await
            .unwrap();
    let started = Instant::now();
    let err = session.run().await.unwrap_err();

    assert!(matches!(err, ClientError::TimedOut), "got {err:?}");
    // 50 + 100 + 200 + 400 + 800 + 1600 ms of waiting before giving up.
    assert!(started.elapsed() >= Duration::from_millis(3000), "gave up too early");
    assert_eq!(server.await.unwrap(), 6);
}
