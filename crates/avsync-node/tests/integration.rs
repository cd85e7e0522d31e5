//! Integration tests for the avsync-node crate.
//!
//! Peers run over loopback on ephemeral ports with broadcast off and each
//! other as explicit targets, so nothing depends on the host's broadcast
//! routing.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use avsync_node::orchestrator::SyncOrchestrator;
use avsync_node::server::{PeerServer, ServerState};
use avsync_protocol::config::NetworkConfig;
use avsync_protocol::packets::SyncMessage;

fn loopback_config(name: &str) -> NetworkConfig {
    NetworkConfig {
        listen_port: 0,
        client_name: name.to_string(),
        enable_broadcast: false,
        heartbeat_interval_seconds: 1,
        client_timeout_seconds: 30,
        ..Default::default()
    }
}

fn port_of(orch: &SyncOrchestrator) -> u16 {
    orch.local_addr().expect("enabled").port()
}

async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

// ---------------------------------------------------------------------------
// 1. Two peers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn seek_cue_reaches_peer_once_and_never_echoes() {
    let a = SyncOrchestrator::with_identity(loopback_config("a"), 1, "a");
    let b = SyncOrchestrator::with_identity(loopback_config("b"), 2, "b");

    let (seek_tx, mut seek_rx) = mpsc::unbounded_channel();
    b.on_seek_cue(move |pos| {
        let _ = seek_tx.send(pos);
    });

    a.enable().await.unwrap();
    b.enable().await.unwrap();

    a.add_target("127.0.0.1", port_of(&b), "b");
    // B targets A and itself, so its own cues come straight back
    b.add_target("127.0.0.1", port_of(&a), "a");
    b.add_target("127.0.0.1", port_of(&b), "b-self");

    assert!(a.send_seek(42.5).await);
    let pos = tokio::time::timeout(Duration::from_secs(2), seek_rx.recv())
        .await
        .expect("seek cue not delivered")
        .unwrap();
    assert_eq!(pos, 42.5);

    assert!(b.send_seek(7.0).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(seek_rx.try_recv().is_err(), "seek delivered more than once or echoed");

    a.disable().await;
    b.disable().await;
}

#[tokio::test]
async fn every_cue_kind_round_trips() {
    let a = SyncOrchestrator::with_identity(loopback_config("a"), 10, "a");
    let b = SyncOrchestrator::with_identity(loopback_config("b"), 20, "b");

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    {
        let tx = tx.clone();
        b.on_sync_cue(move |frame| {
            let _ = tx.send(format!("sync {}", frame));
        });
    }
    {
        let tx = tx.clone();
        b.on_pause_cue(move || {
            let _ = tx.send("pause".into());
        });
    }
    {
        let tx = tx.clone();
        b.on_resume_cue(move || {
            let _ = tx.send("resume".into());
        });
    }
    b.on_client_announced(move |peer| {
        let _ = tx.send(format!("announce {} {} {}", peer.id, peer.name, peer.ip));
    });

    a.enable().await.unwrap();
    b.enable().await.unwrap();
    a.add_target("127.0.0.1", port_of(&b), "b");

    assert!(a.send_sync(1234).await);
    assert!(a.send_pause().await);
    assert!(a.send_resume().await);
    assert!(a.send_announce().await);

    let mut seen = Vec::new();
    for _ in 0..4 {
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("cue not delivered")
            .unwrap();
        seen.push(event);
    }
    seen.sort();
    assert_eq!(
        seen,
        vec!["announce 10 a 127.0.0.1", "pause", "resume", "sync 1234"]
    );

    a.disable().await;
    b.disable().await;
}

#[tokio::test]
async fn heartbeats_register_peer() {
    let a = SyncOrchestrator::with_identity(loopback_config("a"), 100, "alpha");
    let b = SyncOrchestrator::with_identity(loopback_config("b"), 200, "beta");
    a.enable().await.unwrap();
    b.enable().await.unwrap();

    // the heartbeat loop picks up the new target on its next beat (1 s)
    a.add_target("127.0.0.1", port_of(&b), "b");

    assert!(wait_until(Duration::from_secs(3), || b.peer_count() == 1).await);
    let peers = b.connected_peers();
    assert_eq!(peers[0].id, 100);
    assert_eq!(peers[0].name, "alpha");
    assert_eq!(peers[0].ip, Ipv4Addr::LOCALHOST);

    a.disable().await;
    b.disable().await;
    assert_eq!(b.peer_count(), 0);
}

#[tokio::test]
async fn cue_with_failed_target_reports_failure() {
    let a = SyncOrchestrator::with_identity(loopback_config("a"), 1, "a");
    a.enable().await.unwrap();
    // port 0 is not a valid destination
    a.add_target("127.0.0.1", 0, "nowhere");
    assert!(!a.send_pause().await);
    a.disable().await;
}

#[tokio::test]
async fn dropping_enabled_orchestrator_frees_port() {
    let a = SyncOrchestrator::with_identity(loopback_config("a"), 1, "a");
    a.enable().await.unwrap();
    let port = port_of(&a);
    drop(a);

    assert!(wait_until(Duration::from_secs(2), || port_is_free(port)).await);
}

// ---------------------------------------------------------------------------
// 2. PeerServer over a real socket
// ---------------------------------------------------------------------------

async fn started_server(timeout: Duration, sweep: Duration) -> (PeerServer, SocketAddrV4) {
    let server = PeerServer::new(0, timeout).with_sweep_interval(sweep);
    server.start().unwrap();
    let port = server.local_addr().unwrap().port();
    (server, SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
}

#[tokio::test]
async fn stale_peer_swept_fresh_peer_kept() {
    let (server, addr) = started_server(Duration::from_millis(300), Duration::from_millis(50)).await;
    assert_eq!(server.state(), ServerState::Running);

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket
        .send_to(&SyncMessage::heartbeat(7, "quiet").to_bytes(), addr)
        .await
        .unwrap();

    // peer 8 keeps beating every 100 ms for 700 ms
    for _ in 0..7 {
        socket
            .send_to(&SyncMessage::heartbeat(8, "chatty").to_bytes(), addr)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let ids: Vec<u32> = server.connected_peers().iter().map(|p| p.id).collect();
    assert_eq!(ids, vec![8]);

    server.stop().await;
    assert_eq!(server.state(), ServerState::Stopped);
}

#[tokio::test]
async fn malformed_datagrams_are_counted_not_registered() {
    let (server, addr) = started_server(Duration::from_secs(30), Duration::from_secs(5)).await;
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let mut corrupt = SyncMessage::seek_cue(3, 5.0, "x").to_bytes();
    corrupt[20] ^= 0xFF;
    socket.send_to(&corrupt, addr).await.unwrap();
    socket.send_to(&[0u8; 70], addr).await.unwrap();
    socket.send_to(b"short", addr).await.unwrap();
    socket
        .send_to(&SyncMessage::pause_cue(4, "ok").to_bytes(), addr)
        .await
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || server.received_messages() == 1).await);
    assert!(wait_until(Duration::from_secs(2), || server.dropped_datagrams() == 3).await);
    assert_eq!(server.peer_count(), 1);
    assert!(server.peer(4).is_some());

    server.stop().await;
}

fn port_is_free(port: u16) -> bool {
    std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok()
}

#[tokio::test]
async fn dropping_running_server_releases_socket() {
    let (server, addr) = started_server(Duration::from_secs(30), Duration::from_secs(5)).await;
    assert!(!port_is_free(addr.port()));
    drop(server);

    assert!(wait_until(Duration::from_secs(2), || port_is_free(addr.port())).await);
}

#[tokio::test]
async fn restart_after_stop() {
    let (server, _) = started_server(Duration::from_secs(30), Duration::from_secs(5)).await;
    server.stop().await;
    server.stop().await;
    server.start().unwrap();
    assert!(server.is_running());
    assert!(server.local_addr().is_some());
    server.stop().await;
}

// ---------------------------------------------------------------------------
// 3. Remote cues driving playback
// ---------------------------------------------------------------------------

#[tokio::test]
async fn remote_seek_moves_playback() {
    use avsync_media::frame_cache::FrameCache;
    use avsync_media::playback::Playback;
    use avsync_media::source::{ingest, Decoder, ToneDecoder};

    let audio = Arc::new(FrameCache::new());
    let video = Arc::new(FrameCache::new());
    let mut decoder = ToneDecoder::new(3.0, 10.0).with_resolution(4, 4);
    ingest(&mut decoder, &audio, &video);
    let playback = Arc::new(Playback::new(video, audio, decoder.audio_format()));

    let a = SyncOrchestrator::with_identity(loopback_config("a"), 1, "a");
    let b = SyncOrchestrator::with_identity(loopback_config("b"), 2, "b");
    {
        let playback = Arc::clone(&playback);
        b.on_seek_cue(move |pos| {
            playback.seek_to(pos);
        });
    }
    {
        let playback = Arc::clone(&playback);
        b.on_pause_cue(move || playback.pause());
    }

    a.enable().await.unwrap();
    b.enable().await.unwrap();
    a.add_target("127.0.0.1", port_of(&b), "b");

    assert!(a.send_seek(2.0).await);
    assert!(a.send_pause().await);

    let pb = Arc::clone(&playback);
    assert!(wait_until(Duration::from_secs(2), move || pb.is_paused()).await);
    assert_eq!(playback.current_frame(), 20);

    a.disable().await;
    b.disable().await;
}
