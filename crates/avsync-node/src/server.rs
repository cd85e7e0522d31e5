/// Inbound side of the cueing protocol.
///
/// Binds the shared cueing port, validates every datagram (exact size, magic,
/// known kind, checksum) and keeps a registry of peers keyed by sender id.
/// Invalid datagrams are counted and otherwise ignored. Every valid message,
/// whatever its kind, goes to the registered callback together with the
/// source IP; filtering by kind happens downstream.
///
/// Two tasks run while started: the receive loop and the liveness sweep,
/// which evicts peers silent for longer than the peer timeout.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use avsync_protocol::packets::{MessageKind, SyncMessage};
use avsync_protocol::DEFAULT_SWEEP_INTERVAL_SECS;

/// Invoked on the receive task for every valid message.
pub type MessageCallback = Arc<dyn Fn(&SyncMessage, Ipv4Addr) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
}

/// A peer heard from recently.
#[derive(Debug, Clone, Serialize)]
pub struct PeerRecord {
    pub id: u32,
    pub name: String,
    pub ip: Ipv4Addr,
    pub port: u16,
    #[serde(skip)]
    pub last_seen: Instant,
}

impl PeerRecord {
    pub fn age(&self) -> Duration {
        self.last_seen.elapsed()
    }
}

struct Shared {
    peers: Mutex<HashMap<u32, PeerRecord>>,
    callback: RwLock<Option<MessageCallback>>,
    peer_timeout: Duration,
    received: AtomicU64,
    dropped: AtomicU64,
}

impl Shared {
    fn handle_datagram(&self, data: &[u8], src: SocketAddrV4) {
        let Some(msg) = SyncMessage::deserialize(data).filter(SyncMessage::validate_checksum) else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(from = %src, len = data.len(), "Dropped invalid datagram");
            return;
        };
        self.received.fetch_add(1, Ordering::Relaxed);

        self.record_peer(&msg, src);

        if msg.kind == MessageKind::Heartbeat {
            debug!(peer_id = msg.sender_id, from = %src, "Heartbeat");
        } else {
            debug!(peer_id = msg.sender_id, kind = ?msg.kind, from = %src, "Message received");
        }

        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            callback(&msg, *src.ip());
        }
    }

    fn record_peer(&self, msg: &SyncMessage, src: SocketAddrV4) {
        let name = msg.name();
        let mut peers = self.peers.lock();
        match peers.get_mut(&msg.sender_id) {
            Some(peer) => {
                peer.name = name;
                peer.ip = *src.ip();
                peer.port = src.port();
                peer.last_seen = Instant::now();
            }
            None => {
                info!(peer_id = msg.sender_id, name = %name, from = %src, "New peer");
                peers.insert(
                    msg.sender_id,
                    PeerRecord {
                        id: msg.sender_id,
                        name,
                        ip: *src.ip(),
                        port: src.port(),
                        last_seen: Instant::now(),
                    },
                );
            }
        }
    }

    fn sweep(&self, now: Instant) -> usize {
        let mut peers = self.peers.lock();
        let before = peers.len();
        peers.retain(|_, peer| {
            let alive = now.saturating_duration_since(peer.last_seen) <= self.peer_timeout;
            if !alive {
                info!(peer_id = peer.id, name = %peer.name, "Peer timed out");
            }
            alive
        });
        before - peers.len()
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    local_addr: SocketAddr,
}

pub struct PeerServer {
    port: u16,
    sweep_interval: Duration,
    shared: Arc<Shared>,
    state: Mutex<ServerState>,
    running: Mutex<Option<Running>>,
}

impl PeerServer {
    pub fn new(port: u16, peer_timeout: Duration) -> Self {
        Self {
            port,
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            shared: Arc::new(Shared {
                peers: Mutex::new(HashMap::new()),
                callback: RwLock::new(None),
                peer_timeout,
                received: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
            state: Mutex::new(ServerState::Stopped),
            running: Mutex::new(None),
        }
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn set_callback(&self, callback: MessageCallback) {
        *self.shared.callback.write() = Some(callback);
    }

    /// Bind and spawn the receive and sweep tasks. No-op unless stopped.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> std::io::Result<()> {
        {
            let mut state = self.state.lock();
            if *state != ServerState::Stopped {
                return Ok(());
            }
            *state = ServerState::Starting;
        }

        let bound = crate::bind_udp(self.port).and_then(|s| Ok((s.local_addr()?, s)));
        let (local_addr, socket) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                error!(port = self.port, "Failed to bind cueing socket: {}", e);
                *self.state.lock() = ServerState::Stopped;
                return Err(e);
            }
        };

        let (shutdown, rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(receive_loop(socket, Arc::clone(&self.shared), rx.clone())),
            tokio::spawn(sweep_loop(Arc::clone(&self.shared), self.sweep_interval, rx)),
        ];

        *self.running.lock() = Some(Running {
            shutdown,
            tasks,
            local_addr,
        });
        *self.state.lock() = ServerState::Running;

        info!(
            addr = %local_addr,
            peer_timeout_s = self.shared.peer_timeout.as_secs_f64(),
            "Peer server listening"
        );
        Ok(())
    }

    /// Stop both tasks, close the socket and clear the registry.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return;
        };

        let _ = running.shutdown.send(true);
        for task in running.tasks {
            let _ = task.await;
        }

        self.shared.peers.lock().clear();
        *self.state.lock() = ServerState::Stopped;
        info!("Peer server stopped");
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServerState::Running
    }

    /// Bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    pub fn peer_count(&self) -> usize {
        self.shared.peers.lock().len()
    }

    pub fn peer(&self, id: u32) -> Option<PeerRecord> {
        self.shared.peers.lock().get(&id).cloned()
    }

    /// Snapshot of the registry, sorted by peer id.
    pub fn connected_peers(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<PeerRecord> = self.shared.peers.lock().values().cloned().collect();
        peers.sort_by_key(|p| p.id);
        peers
    }

    /// Evict peers silent since before `now - peer_timeout`. Returns how many went.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        self.shared.sweep(now)
    }

    pub fn received_messages(&self) -> u64 {
        self.shared.received.load(Ordering::Relaxed)
    }

    pub fn dropped_datagrams(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

/// Signals both tasks without waiting on them. The receive task drops the
/// socket once it sees the signal.
impl Drop for PeerServer {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            let _ = running.shutdown.send(true);
            debug!(addr = %running.local_addr, "Peer server dropped while running");
        }
    }
}

async fn receive_loop(socket: UdpSocket, shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    // One spare byte so oversized datagrams are seen as oversized
    let mut buf = [0u8; SyncMessage::SIZE + 1];

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok((len, SocketAddr::V4(src))) => shared.handle_datagram(&buf[..len], src),
                Ok((_, src)) => {
                    shared.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(from = %src, "Ignoring non-IPv4 datagram");
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    error!("Cueing receive error: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            },
        }
    }
}

async fn sweep_loop(shared: Arc<Shared>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let removed = shared.sweep(Instant::now());
                if removed > 0 {
                    debug!(removed = removed, "Liveness sweep");
                }
            }
        }
    }
}
