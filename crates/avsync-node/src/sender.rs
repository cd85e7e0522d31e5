/// Outbound side of the cueing protocol.
///
/// One broadcast-capable socket for everything this peer sends: cues to the
/// broadcast address or to explicit targets, and the periodic heartbeat. The
/// heartbeat destinations come from a `watch` channel so targets added at
/// runtime are picked up on the next beat.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use avsync_protocol::packets::SyncMessage;

struct Heartbeat {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct PeerSender {
    socket: Arc<UdpSocket>,
    port: u16,
    broadcast_addr: Ipv4Addr,
    local_id: u32,
    local_name: String,
    heartbeat: Mutex<Option<Heartbeat>>,
}

impl PeerSender {
    /// Open the outbound socket on an ephemeral port. `port` is the cueing
    /// port peers listen on. Must be called from within a tokio runtime.
    pub fn new(
        local_id: u32,
        local_name: &str,
        port: u16,
        broadcast_addr: Ipv4Addr,
    ) -> io::Result<Self> {
        let socket = crate::bind_udp(0)?;
        Ok(Self {
            socket: Arc::new(socket),
            port,
            broadcast_addr,
            local_id,
            local_name: local_name.to_string(),
            heartbeat: Mutex::new(None),
        })
    }

    /// Announce this peer on the broadcast address.
    pub async fn initialize(&self) -> io::Result<()> {
        let announce = SyncMessage::client_announce(self.local_id, &self.local_name);
        self.broadcast(&announce).await?;
        info!(
            id = self.local_id,
            name = %self.local_name,
            broadcast = %self.broadcast_addr,
            port = self.port,
            "Announced on network"
        );
        Ok(())
    }

    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    pub fn broadcast_target(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.broadcast_addr, self.port)
    }

    // -- Sends --

    pub async fn send_to_addr(&self, msg: &SyncMessage, addr: SocketAddrV4) -> io::Result<()> {
        send_message(&self.socket, msg, addr).await
    }

    pub async fn broadcast(&self, msg: &SyncMessage) -> io::Result<()> {
        self.send_to_addr(msg, self.broadcast_target()).await
    }

    /// Send to one peer on the shared cueing port.
    pub async fn send_to(&self, msg: &SyncMessage, ip: Ipv4Addr) -> io::Result<()> {
        self.send_to_addr(msg, SocketAddrV4::new(ip, self.port)).await
    }

    /// Try every address. True only if all sends succeeded.
    pub async fn send_to_many(&self, msg: &SyncMessage, addrs: &[SocketAddrV4]) -> bool {
        let mut all_ok = true;
        for &addr in addrs {
            if let Err(e) = self.send_to_addr(msg, addr).await {
                warn!(to = %addr, kind = ?msg.kind, "Send failed: {}", e);
                all_ok = false;
            }
        }
        all_ok
    }

    // -- Heartbeat --

    /// Beat every `interval` to whatever `destinations` currently holds.
    /// Restarting replaces the running loop.
    pub async fn start_heartbeat(
        &self,
        interval: Duration,
        destinations: watch::Receiver<Vec<SocketAddrV4>>,
    ) {
        self.stop_heartbeat().await;

        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(heartbeat_loop(
            Arc::clone(&self.socket),
            self.local_id,
            self.local_name.clone(),
            interval,
            destinations,
            rx,
        ));
        *self.heartbeat.lock() = Some(Heartbeat { shutdown, task });

        info!(interval_s = interval.as_secs_f64(), "Heartbeat started");
    }

    pub async fn stop_heartbeat(&self) {
        let heartbeat = self.heartbeat.lock().take();
        let Some(heartbeat) = heartbeat else {
            return;
        };
        let _ = heartbeat.shutdown.send(true);
        let _ = heartbeat.task.await;
        debug!("Heartbeat stopped");
    }

    pub fn is_heartbeat_running(&self) -> bool {
        self.heartbeat.lock().is_some()
    }
}

impl Drop for PeerSender {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.get_mut().take() {
            let _ = heartbeat.shutdown.send(true);
        }
    }
}

async fn send_message(socket: &UdpSocket, msg: &SyncMessage, addr: SocketAddrV4) -> io::Result<()> {
    let buf = msg.to_bytes();
    let sent = socket.send_to(&buf, addr).await?;
    if sent != buf.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("short datagram: {} of {} bytes", sent, buf.len()),
        ));
    }
    Ok(())
}

async fn heartbeat_loop(
    socket: Arc<UdpSocket>,
    local_id: u32,
    local_name: String,
    interval: Duration,
    destinations: watch::Receiver<Vec<SocketAddrV4>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let msg = SyncMessage::heartbeat(local_id, &local_name);
                let targets = destinations.borrow().clone();
                for addr in targets {
                    if let Err(e) = send_message(&socket, &msg, addr).await {
                        debug!(to = %addr, "Heartbeat send failed: {}", e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn listener() -> (UdpSocket, SocketAddrV4) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        (socket, SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }

    async fn recv_msg(socket: &UdpSocket) -> SyncMessage {
        let mut buf = [0u8; 128];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("timed out")
            .unwrap();
        SyncMessage::deserialize(&buf[..len]).unwrap()
    }

    #[tokio::test]
    async fn send_to_addr_delivers_full_record() {
        let (rx, addr) = listener().await;
        let sender = PeerSender::new(3, "booth", addr.port(), Ipv4Addr::LOCALHOST).unwrap();

        sender
            .send_to_addr(&SyncMessage::seek_cue(3, 12.0, "booth"), addr)
            .await
            .unwrap();

        let msg = recv_msg(&rx).await;
        assert_eq!(msg.sender_id, 3);
        assert_eq!(msg.seek_position, 12.0);
        assert!(msg.is_valid());
    }

    #[tokio::test]
    async fn send_to_uses_cueing_port() {
        let (rx, addr) = listener().await;
        let sender = PeerSender::new(3, "booth", addr.port(), Ipv4Addr::BROADCAST).unwrap();
        sender
            .send_to(&SyncMessage::pause_cue(3, "booth"), Ipv4Addr::LOCALHOST)
            .await
            .unwrap();
        assert_eq!(recv_msg(&rx).await.kind, avsync_protocol::packets::MessageKind::PauseCue);
    }

    #[tokio::test]
    async fn send_to_many_reaches_every_target() {
        let (rx1, a1) = listener().await;
        let (rx2, a2) = listener().await;
        let sender = PeerSender::new(1, "a", 9999, Ipv4Addr::BROADCAST).unwrap();

        assert!(sender.send_to_many(&SyncMessage::resume_cue(1, "a"), &[a1, a2]).await);
        recv_msg(&rx1).await;
        recv_msg(&rx2).await;
    }

    #[tokio::test]
    async fn heartbeat_follows_destinations_and_stops() {
        let (rx, addr) = listener().await;
        let sender = PeerSender::new(5, "hb", addr.port(), Ipv4Addr::BROADCAST).unwrap();
        let (dest_tx, dest_rx) = watch::channel(vec![addr]);

        sender.start_heartbeat(Duration::from_millis(20), dest_rx).await;
        assert!(sender.is_heartbeat_running());

        let first = recv_msg(&rx).await;
        assert_eq!(first.kind, avsync_protocol::packets::MessageKind::Heartbeat);
        assert_eq!(first.name(), "hb");
        recv_msg(&rx).await;

        // stop must not wait out a long interval
        sender.start_heartbeat(Duration::from_secs(3600), dest_tx.subscribe()).await;
        let started = std::time::Instant::now();
        sender.stop_heartbeat().await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!sender.is_heartbeat_running());
        drop(dest_tx);
    }

    #[tokio::test]
    async fn dropping_sender_ends_heartbeat() {
        let (rx, addr) = listener().await;
        let sender = PeerSender::new(6, "gone", addr.port(), Ipv4Addr::BROADCAST).unwrap();
        let (_dest_tx, dest_rx) = watch::channel(vec![addr]);

        sender.start_heartbeat(Duration::from_millis(20), dest_rx).await;
        recv_msg(&rx).await;
        drop(sender);

        // let a beat already in flight land, then drain it
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut buf = [0u8; 128];
        while rx.try_recv_from(&mut buf).is_ok() {}

        let late = tokio::time::timeout(Duration::from_millis(200), rx.recv_from(&mut buf)).await;
        assert!(late.is_err(), "heartbeat kept running after drop");
    }
}
