use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, warn};

use avsync_node::sender::PeerSender;
use avsync_node::server::{PeerRecord, PeerServer};
use avsync_protocol::packets::{MessageKind, SyncMessage};
use avsync_protocol::{DEFAULT_BROADCAST_ADDR, DEFAULT_PEER_TIMEOUT_SECS, DEFAULT_PORT};

#[derive(Parser, Debug)]
#[command(name = "avsync", about = "A/V sync cueing CLI", version)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Cueing port
    #[arg(short, long, default_value_t = DEFAULT_PORT, global = true)]
    port: u16,

    /// Send to this peer (ip or ip:port) instead of broadcasting. Repeatable.
    #[arg(short, long = "target", global = true)]
    targets: Vec<String>,

    /// Name carried in outgoing messages
    #[arg(long, default_value = "avsync-cli", global = true)]
    name: String,

    /// Sender id (random when omitted)
    #[arg(long, global = true)]
    id: Option<u32>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Seek every peer to a position in seconds
    Seek { seconds: f64 },
    /// Pause every peer
    Pause,
    /// Resume every peer
    Resume,
    /// Align every peer to a frame number
    Sync { frame: u32 },
    /// Announce this CLI as a peer
    Announce,
    /// Print inbound messages and the peer table
    Listen {
        /// Stop after this many seconds (0 = until ctrl-c)
        #[arg(long, default_value_t = 0)]
        seconds: u64,

        /// One JSON object per line
        #[arg(long)]
        json: bool,

        /// Ask peers to announce themselves first
        #[arg(long)]
        discover: bool,
    },
}

#[derive(Serialize)]
struct MessageLine {
    kind: MessageKind,
    from: Ipv4Addr,
    id: u32,
    name: String,
    timestamp_us: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    frame: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    position: Option<f64>,
}

impl MessageLine {
    fn new(msg: &SyncMessage, from: Ipv4Addr) -> Self {
        Self {
            kind: msg.kind,
            from,
            id: msg.sender_id,
            name: msg.name(),
            timestamp_us: msg.timestamp_us,
            frame: (msg.kind == MessageKind::SyncCue).then_some(msg.frame_number),
            position: (msg.kind == MessageKind::SeekCue).then_some(msg.seek_position),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let id = args.id.unwrap_or_else(avsync_node::generate_local_id);
    let targets = args
        .targets
        .iter()
        .map(|t| parse_target(t, args.port))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let msg = match args.command {
        Commands::Seek { seconds } => SyncMessage::seek_cue(id, seconds, &args.name),
        Commands::Pause => SyncMessage::pause_cue(id, &args.name),
        Commands::Resume => SyncMessage::resume_cue(id, &args.name),
        Commands::Sync { frame } => SyncMessage::sync_cue(id, frame, &args.name),
        Commands::Announce => SyncMessage::client_announce(id, &args.name),
        Commands::Listen { seconds, json, discover } => {
            return listen(&args, id, &targets, seconds, json, discover).await;
        }
    };

    let sender = PeerSender::new(id, &args.name, args.port, DEFAULT_BROADCAST_ADDR)?;
    send(&sender, &msg, &targets).await?;
    debug!(kind = ?msg.kind, id = id, targets = targets.len(), "Cue sent");
    println!(
        "Sent {:?} as #{} to {}",
        msg.kind,
        id,
        describe_destinations(&sender, &targets)
    );

    Ok(())
}

/// `ip` or `ip:port`; a bare ip uses the cueing port.
fn parse_target(s: &str, default_port: u16) -> anyhow::Result<SocketAddrV4> {
    if let Ok(addr) = s.parse::<SocketAddrV4>() {
        return Ok(addr);
    }
    let ip: Ipv4Addr = s
        .parse()
        .with_context(|| format!("invalid target '{}', expected ip or ip:port", s))?;
    Ok(SocketAddrV4::new(ip, default_port))
}

async fn send(sender: &PeerSender, msg: &SyncMessage, targets: &[SocketAddrV4]) -> anyhow::Result<()> {
    if targets.is_empty() {
        sender.broadcast(msg).await.context("broadcast failed")?;
    } else if !sender.send_to_many(msg, targets).await {
        anyhow::bail!("send failed for one or more targets");
    }
    Ok(())
}

fn describe_destinations(sender: &PeerSender, targets: &[SocketAddrV4]) -> String {
    if targets.is_empty() {
        return format!("{} (broadcast)", sender.broadcast_target());
    }
    targets
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

async fn listen(
    args: &Args,
    id: u32,
    targets: &[SocketAddrV4],
    seconds: u64,
    json: bool,
    discover: bool,
) -> anyhow::Result<()> {
    let server = PeerServer::new(args.port, Duration::from_secs(DEFAULT_PEER_TIMEOUT_SECS));
    server.set_callback(Arc::new(move |msg: &SyncMessage, from: Ipv4Addr| {
        print_message(msg, from, json);
    }));
    server
        .start()
        .with_context(|| format!("failed to listen on port {}", args.port))?;

    if !json {
        println!("Listening on {} (ctrl-c to stop)", describe_bound(&server));
    }

    if discover {
        let sender = PeerSender::new(id, &args.name, args.port, DEFAULT_BROADCAST_ADDR)?;
        send(&sender, &SyncMessage::client_discover(id, &args.name), targets).await?;
    }

    let mut table = tokio::time::interval(Duration::from_secs(5));
    table.tick().await;
    let deadline = async {
        if seconds == 0 {
            std::future::pending::<()>().await;
        } else {
            tokio::time::sleep(Duration::from_secs(seconds)).await;
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
            _ = &mut deadline => break,
            _ = table.tick() => {
                if !json {
                    print_peers(&server.connected_peers());
                }
            }
        }
    }

    let peers = server.connected_peers();
    if json {
        println!(
            "{}",
            serde_json::json!({
                "peers": peers,
                "received": server.received_messages(),
                "dropped": server.dropped_datagrams(),
            })
        );
    } else {
        print_peers(&peers);
        println!(
            "  {} messages received, {} datagrams dropped",
            server.received_messages(),
            server.dropped_datagrams()
        );
    }

    server.stop().await;
    debug!(port = args.port, "Listener stopped");
    Ok(())
}

fn describe_bound(server: &PeerServer) -> String {
    server
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|| "?".to_string())
}

fn print_message(msg: &SyncMessage, from: Ipv4Addr, json: bool) {
    let line = MessageLine::new(msg, from);
    if json {
        match serde_json::to_string(&line) {
            Ok(s) => println!("{}", s),
            Err(e) => warn!("Failed to encode message: {}", e),
        }
        return;
    }

    let detail = match (line.frame, line.position) {
        (Some(frame), _) => format!(" frame={}", frame),
        (_, Some(position)) => format!(" position={:.3}s", position),
        _ => String::new(),
    };
    println!(
        "{:<15} #{:<10} {:<16} {:?}{}",
        line.from, line.id, line.name, line.kind, detail
    );
}

fn print_peers(peers: &[PeerRecord]) {
    println!("Peers");
    println!("══════════════════════════════");
    if peers.is_empty() {
        println!("  No peers seen");
    }
    for p in peers {
        println!(
            "  #{} {} ({}:{}) last seen {:.1}s ago",
            p.id,
            p.name,
            p.ip,
            p.port,
            p.age().as_secs_f64()
        );
    }
}
