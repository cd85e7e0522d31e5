/// Bridges local playback and the cueing network.
///
/// Outbound: each transport action becomes one `SyncMessage`, broadcast
/// and/or sent to every enabled target depending on the config. Inbound:
/// messages from other peers are matched by kind onto the registered cue
/// handlers. Our own messages (same sender id) are discarded, heartbeats only
/// feed the peer registry, and a discover request is answered with an
/// announce.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use avsync_protocol::config::NetworkConfig;
use avsync_protocol::packets::{MessageKind, SyncMessage};

use crate::sender::PeerSender;
use crate::server::{PeerRecord, PeerServer};

type Handler<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Cue handlers, each optional and replaceable at any time.
#[derive(Default)]
struct CueHandlers {
    sync: Option<Handler<u32>>,
    seek: Option<Handler<f64>>,
    pause: Option<Handler<()>>,
    resume: Option<Handler<()>>,
    announced: Option<Handler<AnnouncedPeer>>,
}

/// Passed to the client-announced handler.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnouncedPeer {
    pub id: u32,
    pub name: String,
    pub ip: Ipv4Addr,
}

struct Inner {
    config: RwLock<NetworkConfig>,
    local_id: u32,
    local_name: String,
    server: PeerServer,
    sender: Mutex<Option<Arc<PeerSender>>>,
    handlers: RwLock<CueHandlers>,
    destinations: watch::Sender<Vec<SocketAddrV4>>,
    /// Serialises enable/disable
    transition: tokio::sync::Mutex<()>,
}

pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl SyncOrchestrator {
    /// Identity from the config name (or `hostname-pid`) and a fresh id.
    pub fn new(config: NetworkConfig) -> Self {
        let name = if config.client_name.is_empty() {
            crate::default_local_name()
        } else {
            config.client_name.clone()
        };
        Self::with_identity(config, crate::generate_local_id(), &name)
    }

    pub fn with_identity(config: NetworkConfig, local_id: u32, local_name: &str) -> Self {
        let server = PeerServer::new(config.listen_port, config.peer_timeout());
        let (destinations, _) = watch::channel(heartbeat_destinations(&config));

        let inner = Arc::new(Inner {
            config: RwLock::new(config),
            local_id,
            local_name: local_name.to_string(),
            server,
            sender: Mutex::new(None),
            handlers: RwLock::new(CueHandlers::default()),
            destinations,
            transition: tokio::sync::Mutex::new(()),
        });

        // Weak: the server holding the callback is owned by `inner`
        let weak: Weak<Inner> = Arc::downgrade(&inner);
        inner.server.set_callback(Arc::new(move |msg: &SyncMessage, ip: Ipv4Addr| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_inbound(msg, ip);
            }
        }));

        Self { inner }
    }

    pub fn local_id(&self) -> u32 {
        self.inner.local_id
    }

    pub fn local_name(&self) -> &str {
        &self.inner.local_name
    }

    pub fn config(&self) -> NetworkConfig {
        self.inner.config.read().clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.sender.lock().is_some()
    }

    // -- Lifecycle --

    /// Start listening, announce, and begin heartbeats. Enabling twice is a no-op.
    pub async fn enable(&self) -> std::io::Result<()> {
        let _guard = self.inner.transition.lock().await;
        if self.is_enabled() {
            return Ok(());
        }

        let (port, broadcast_addr, enable_broadcast, heartbeat_interval) = {
            let config = self.inner.config.read();
            (
                config.listen_port,
                config.broadcast_address,
                config.enable_broadcast,
                config.heartbeat_interval(),
            )
        };

        self.inner.server.start()?;

        let sender = match PeerSender::new(
            self.inner.local_id,
            &self.inner.local_name,
            port,
            broadcast_addr,
        ) {
            Ok(sender) => Arc::new(sender),
            Err(e) => {
                self.inner.server.stop().await;
                return Err(e);
            }
        };

        if enable_broadcast {
            if let Err(e) = sender.initialize().await {
                warn!("Initial announce failed: {}", e);
            }
        }

        sender
            .start_heartbeat(heartbeat_interval, self.inner.destinations.subscribe())
            .await;
        *self.inner.sender.lock() = Some(sender);

        info!(
            id = self.inner.local_id,
            name = %self.inner.local_name,
            port = port,
            broadcast = enable_broadcast,
            "Network sync enabled"
        );
        Ok(())
    }

    /// Stop heartbeats, then the server. Disabling twice is a no-op.
    pub async fn disable(&self) {
        let _guard = self.inner.transition.lock().await;
        let sender = self.inner.sender.lock().take();
        let Some(sender) = sender else {
            return;
        };

        sender.stop_heartbeat().await;
        self.inner.server.stop().await;
        info!("Network sync disabled");
    }

    // -- Outbound cues --

    pub async fn send_sync(&self, frame: u32) -> bool {
        let msg = SyncMessage::sync_cue(self.inner.local_id, frame, &self.inner.local_name);
        self.dispatch(msg).await
    }

    pub async fn send_seek(&self, position: f64) -> bool {
        let msg = SyncMessage::seek_cue(self.inner.local_id, position, &self.inner.local_name);
        self.dispatch(msg).await
    }

    pub async fn send_pause(&self) -> bool {
        let msg = SyncMessage::pause_cue(self.inner.local_id, &self.inner.local_name);
        self.dispatch(msg).await
    }

    pub async fn send_resume(&self) -> bool {
        let msg = SyncMessage::resume_cue(self.inner.local_id, &self.inner.local_name);
        self.dispatch(msg).await
    }

    pub async fn send_announce(&self) -> bool {
        let msg = SyncMessage::client_announce(self.inner.local_id, &self.inner.local_name);
        self.dispatch(msg).await
    }

    pub async fn send_discover(&self) -> bool {
        let msg = SyncMessage::client_discover(self.inner.local_id, &self.inner.local_name);
        self.dispatch(msg).await
    }

    /// Broadcast and/or fan out to targets. False if sync is disabled, if
    /// there is nowhere to send, or if any individual send failed.
    async fn dispatch(&self, msg: SyncMessage) -> bool {
        let sender = self.inner.sender.lock().clone();
        let Some(sender) = sender else {
            debug!(kind = ?msg.kind, "Sync disabled, cue not sent");
            return false;
        };

        let (broadcast, targets) = {
            let config = self.inner.config.read();
            (config.enable_broadcast, config.enabled_targets())
        };

        if !broadcast && targets.is_empty() {
            warn!(kind = ?msg.kind, "No broadcast and no targets configured");
            return false;
        }

        let mut ok = true;
        if broadcast {
            if let Err(e) = sender.broadcast(&msg).await {
                warn!(kind = ?msg.kind, "Broadcast failed: {}", e);
                ok = false;
            }
        }
        if !targets.is_empty() {
            ok &= sender.send_to_many(&msg, &targets).await;
        }

        debug!(kind = ?msg.kind, targets = targets.len(), ok = ok, "Cue sent");
        ok
    }

    // -- Inbound handlers --

    pub fn on_sync_cue(&self, handler: impl Fn(u32) + Send + Sync + 'static) {
        self.inner.handlers.write().sync = Some(Arc::new(handler));
    }

    pub fn on_seek_cue(&self, handler: impl Fn(f64) + Send + Sync + 'static) {
        self.inner.handlers.write().seek = Some(Arc::new(handler));
    }

    pub fn on_pause_cue(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.inner.handlers.write().pause = Some(Arc::new(move |()| handler()));
    }

    pub fn on_resume_cue(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.inner.handlers.write().resume = Some(Arc::new(move |()| handler()));
    }

    pub fn on_client_announced(&self, handler: impl Fn(AnnouncedPeer) + Send + Sync + 'static) {
        self.inner.handlers.write().announced = Some(Arc::new(handler));
    }

    // -- Targets --

    pub fn add_target(&self, ip: &str, port: u16, name: &str) {
        self.inner.config.write().add_target(ip, port, name, true);
        self.inner.refresh_destinations();
        info!(ip = ip, port = port, "Target added");
    }

    pub fn remove_target(&self, ip: &str) -> usize {
        let removed = self.inner.config.write().remove_target(ip);
        self.inner.refresh_destinations();
        removed
    }

    // -- Peers --

    /// Known peers other than ourselves, sorted by id.
    pub fn connected_peers(&self) -> Vec<PeerRecord> {
        let mut peers = self.inner.server.connected_peers();
        peers.retain(|p| p.id != self.inner.local_id);
        peers
    }

    pub fn peer_count(&self) -> usize {
        self.connected_peers().len()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.server.local_addr()
    }

    pub fn server(&self) -> &PeerServer {
        &self.inner.server
    }
}

impl Inner {
    fn refresh_destinations(&self) {
        let destinations = heartbeat_destinations(&self.config.read());
        self.destinations.send_replace(destinations);
    }

    fn handle_inbound(&self, msg: &SyncMessage, ip: Ipv4Addr) {
        if msg.sender_id == self.local_id {
            return;
        }

        if msg.kind.is_cue() && !self.config.read().respond_to_external_cues {
            debug!(peer_id = msg.sender_id, kind = ?msg.kind, "Ignoring external cue");
            return;
        }

        match msg.kind {
            MessageKind::Heartbeat => {}
            MessageKind::SyncCue => {
                info!(peer_id = msg.sender_id, frame = msg.frame_number, "Sync cue");
                let handler = self.handlers.read().sync.clone();
                if let Some(handler) = handler {
                    handler(msg.frame_number);
                }
            }
            MessageKind::SeekCue => {
                info!(peer_id = msg.sender_id, position = msg.seek_position, "Seek cue");
                let handler = self.handlers.read().seek.clone();
                if let Some(handler) = handler {
                    handler(msg.seek_position);
                }
            }
            MessageKind::PauseCue => {
                info!(peer_id = msg.sender_id, "Pause cue");
                let handler = self.handlers.read().pause.clone();
                if let Some(handler) = handler {
                    handler(());
                }
            }
            MessageKind::ResumeCue => {
                info!(peer_id = msg.sender_id, "Resume cue");
                let handler = self.handlers.read().resume.clone();
                if let Some(handler) = handler {
                    handler(());
                }
            }
            MessageKind::ClientAnnounce => {
                let handler = self.handlers.read().announced.clone();
                if let Some(handler) = handler {
                    handler(AnnouncedPeer {
                        id: msg.sender_id,
                        name: msg.name(),
                        ip,
                    });
                }
            }
            MessageKind::ClientDiscover => self.answer_discover(msg.sender_id, ip),
        }
    }

    /// Unicast an announce back to a discovering peer on the shared port.
    fn answer_discover(&self, peer_id: u32, ip: Ipv4Addr) {
        let Some(sender) = self.sender.lock().clone() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let port = self
            .server
            .local_addr()
            .map_or(self.config.read().listen_port, |a| a.port());
        let announce = SyncMessage::client_announce(self.local_id, &self.local_name);

        runtime.spawn(async move {
            let to = SocketAddrV4::new(ip, port);
            match sender.send_to_addr(&announce, to).await {
                Ok(()) => debug!(peer_id = peer_id, to = %to, "Answered discover"),
                Err(e) => warn!(peer_id = peer_id, to = %to, "Discover reply failed: {}", e),
            }
        });
    }
}

/// Where heartbeats go: the broadcast address (if enabled) plus every enabled target.
fn heartbeat_destinations(config: &NetworkConfig) -> Vec<SocketAddrV4> {
    let mut destinations = Vec::new();
    if config.enable_broadcast {
        destinations.push(SocketAddrV4::new(config.broadcast_address, config.listen_port));
    }
    destinations.extend(config.enabled_targets());
    destinations
}
