pub mod orchestrator;
pub mod sender;
pub mod server;

use std::net::{Ipv4Addr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};

/// UDP socket with address reuse and broadcast enabled, bound to
/// `0.0.0.0:port` and ready for tokio. Port 0 picks an ephemeral port.
pub fn bind_udp(port: u16) -> std::io::Result<tokio::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    #[cfg(any(target_os = "macos", target_os = "freebsd"))]
    socket.set_reuse_port(true)?;

    socket.set_broadcast(true)?;
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;

    tokio::net::UdpSocket::from_std(socket.into())
}

/// Process-unique peer id: clock nanos folded with the pid.
pub fn generate_local_id() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u32;
    (seed ^ (seed >> 16)) ^ std::process::id().rotate_left(16)
}

/// `hostname-pid`, the display name used when none is configured.
pub fn default_local_name() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "avsync".to_string());
    format!("{}-{}", host, std::process::id())
}
