//! Network configuration for a cueing peer.
//!
//! Loaded once at startup, either from the line-oriented key=value format
//! (`listen_port=9999`, repeated `target=ip:port:name:enabled` lines) or from
//! TOML when the file name ends in `.toml`. Validation collects every problem
//! instead of stopping at the first so operators can fix a file in one pass.

use std::fmt::Write as _;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    DEFAULT_BROADCAST_ADDR, DEFAULT_HEARTBEAT_INTERVAL_SECS, DEFAULT_PEER_TIMEOUT_SECS,
    DEFAULT_PORT, DEFAULT_SYNC_INTERVAL_SECS,
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// A peer that receives cues directly, in addition to (or instead of) broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerTarget {
    pub ip: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl PeerTarget {
    pub fn new(ip: impl Into<String>, port: u16, name: impl Into<String>, enabled: bool) -> Self {
        let ip = ip.into();
        let name = name.into();
        let name = if name.is_empty() { ip.clone() } else { name };
        Self { ip, port, name, enabled }
    }

    /// Resolved socket address, or None if the IP is malformed.
    pub fn addr(&self) -> Option<SocketAddrV4> {
        let ip: Ipv4Addr = self.ip.parse().ok()?;
        Some(SocketAddrV4::new(ip, self.port))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_port")]
    pub listen_port: u16,
    #[serde(default)]
    pub client_name: String,
    #[serde(default = "default_true")]
    pub auto_discover: bool,
    #[serde(default = "default_true")]
    pub enable_broadcast: bool,
    #[serde(default = "default_broadcast_address")]
    pub broadcast_address: Ipv4Addr,
    #[serde(default)]
    pub targets: Vec<PeerTarget>,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    #[serde(default = "default_client_timeout")]
    pub client_timeout_seconds: u64,
    #[serde(default)]
    pub auto_sync_on_startup: bool,
    #[serde(default)]
    pub auto_master_on_startup: bool,
    #[serde(default = "default_true")]
    pub respond_to_external_cues: bool,
    #[serde(default = "default_sync_interval")]
    pub sync_interval_seconds: u64,
}

fn default_port() -> u16 { DEFAULT_PORT }
fn default_true() -> bool { true }
fn default_broadcast_address() -> Ipv4Addr { DEFAULT_BROADCAST_ADDR }
fn default_heartbeat_interval() -> u64 { DEFAULT_HEARTBEAT_INTERVAL_SECS }
fn default_client_timeout() -> u64 { DEFAULT_PEER_TIMEOUT_SECS }
fn default_sync_interval() -> u64 { DEFAULT_SYNC_INTERVAL_SECS }

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: default_port(),
            client_name: String::new(),
            auto_discover: true,
            enable_broadcast: true,
            broadcast_address: default_broadcast_address(),
            targets: Vec::new(),
            heartbeat_interval_seconds: default_heartbeat_interval(),
            client_timeout_seconds: default_client_timeout(),
            auto_sync_on_startup: false,
            auto_master_on_startup: false,
            respond_to_external_cues: true,
            sync_interval_seconds: default_sync_interval(),
        }
    }
}

impl NetworkConfig {
    /// Load and validate a config file. `.toml` files go through serde,
    /// anything else is read as key=value lines.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config: Self = if path.extension().is_some_and(|ext| ext == "toml") {
            toml::from_str(&text)?
        } else {
            Self::parse_kv(&text)?
        };
        // unnamed targets go by their address, same as `PeerTarget::new`
        for target in &mut config.targets {
            if target.name.is_empty() {
                target.name = target.ip.clone();
            }
        }
        config.validate()?;

        info!(
            path = %path.display(),
            listen_port = config.listen_port,
            targets = config.targets.len(),
            auto_discover = config.auto_discover,
            "Loaded network config"
        );

        Ok(config)
    }

    /// Parse the key=value format. Does not validate ranges.
    pub fn parse_kv(text: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                debug!(line = line_no, "Ignoring config line without '='");
                continue;
            };
            let key = key.trim();
            let value = value.trim();

            match key {
                "listen_port" => config.listen_port = parse_num(value, line_no, key)?,
                "client_name" => config.client_name = value.to_string(),
                "auto_discover" => config.auto_discover = parse_bool(value),
                "enable_broadcast" => config.enable_broadcast = parse_bool(value),
                "broadcast_address" => config.broadcast_address = parse_num(value, line_no, key)?,
                "heartbeat_interval" => {
                    config.heartbeat_interval_seconds = parse_num(value, line_no, key)?
                }
                "client_timeout" => config.client_timeout_seconds = parse_num(value, line_no, key)?,
                "auto_sync" => config.auto_sync_on_startup = parse_bool(value),
                "auto_master" => config.auto_master_on_startup = parse_bool(value),
                "respond_to_cues" => config.respond_to_external_cues = parse_bool(value),
                "sync_interval" => config.sync_interval_seconds = parse_num(value, line_no, key)?,
                "target" => config.targets.push(parse_target(value, line_no)?),
                _ => debug!(line = line_no, key = key, "Ignoring unknown config key"),
            }
        }

        Ok(config)
    }

    /// Render in the key=value format understood by `parse_kv`.
    pub fn to_kv_string(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Network configuration for synchronized playback");
        let _ = writeln!(out, "# Lines starting with # are comments\n");

        let _ = writeln!(out, "# Local settings");
        let _ = writeln!(out, "listen_port={}", self.listen_port);
        if !self.client_name.is_empty() {
            let _ = writeln!(out, "client_name={}", self.client_name);
        }
        let _ = writeln!(out, "auto_discover={}", self.auto_discover);
        let _ = writeln!(out, "enable_broadcast={}", self.enable_broadcast);
        let _ = writeln!(out, "broadcast_address={}\n", self.broadcast_address);

        let _ = writeln!(out, "# Timing settings");
        let _ = writeln!(out, "heartbeat_interval={}", self.heartbeat_interval_seconds);
        let _ = writeln!(out, "client_timeout={}", self.client_timeout_seconds);
        let _ = writeln!(out, "sync_interval={}\n", self.sync_interval_seconds);

        let _ = writeln!(out, "# Sync behavior");
        let _ = writeln!(out, "auto_sync={}", self.auto_sync_on_startup);
        let _ = writeln!(out, "auto_master={}", self.auto_master_on_startup);
        let _ = writeln!(out, "respond_to_cues={}\n", self.respond_to_external_cues);

        let _ = writeln!(out, "# Target clients (ip:port:name:enabled)");
        for target in &self.targets {
            let _ = writeln!(
                out,
                "target={}:{}:{}:{}",
                target.ip, target.port, target.name, target.enabled
            );
        }

        out
    }

    pub fn save_kv(&self, path: &Path) -> Result<(), ConfigError> {
        std::fs::write(path, self.to_kv_string()).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "Saved network config");
        Ok(())
    }

    /// Every rule violation, in file order. Empty means valid.
    pub fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.listen_port < 1024 {
            errors.push("listen_port must be between 1024 and 65535".to_string());
        }

        if !(1..=300).contains(&self.heartbeat_interval_seconds) {
            errors.push("heartbeat_interval must be between 1 and 300 seconds".to_string());
        }

        if self.client_timeout_seconds < self.heartbeat_interval_seconds.saturating_mul(2) {
            errors.push("client_timeout must be at least 2x heartbeat_interval".to_string());
        }

        for target in &self.targets {
            if Ipv4Addr::from_str(&target.ip).is_err() {
                errors.push(format!("Invalid IP address: {}", target.ip));
                continue;
            }
            if target.port < 1024 {
                errors.push(format!("Invalid port for {}: {}", target.ip, target.port));
            }
        }

        errors
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let errors = self.validation_errors();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    pub fn add_target(&mut self, ip: &str, port: u16, name: &str, enabled: bool) {
        self.targets.push(PeerTarget::new(ip, port, name, enabled));
    }

    /// Remove every target with this IP. Returns how many were removed.
    pub fn remove_target(&mut self, ip: &str) -> usize {
        let before = self.targets.len();
        self.targets.retain(|t| t.ip != ip);
        before - self.targets.len()
    }

    /// Addresses of enabled targets with well-formed IPs.
    pub fn enabled_targets(&self) -> Vec<SocketAddrV4> {
        self.targets
            .iter()
            .filter(|t| t.enabled)
            .filter_map(PeerTarget::addr)
            .collect()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_seconds)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_seconds.max(1))
    }
}

fn parse_bool(value: &str) -> bool {
    value == "true" || value == "1"
}

fn parse_num<T: FromStr>(value: &str, line: usize, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Parse {
        line,
        message: format!("invalid value for {}: {:?}", key, value),
    })
}

/// `ip:port[:name[:enabled]]`
fn parse_target(value: &str, line: usize) -> Result<PeerTarget, ConfigError> {
    let parts: Vec<&str> = value.split(':').map(str::trim).collect();
    if parts.len() < 2 {
        return Err(ConfigError::Parse {
            line,
            message: format!("invalid target {:?} (expected ip:port:name:enabled)", value),
        });
    }

    let port = parse_num(parts[1], line, "target port")?;
    let name = parts.get(2).copied().unwrap_or("");
    let enabled = parts.get(3).map_or(true, |s| parse_bool(s));

    Ok(PeerTarget::new(parts[0], port, name, enabled))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_file() {
        let text = "\
# comment
listen_port = 10000
client_name=wall-left
enable_broadcast=false
heartbeat_interval=5
client_timeout=20
auto_master=1
target=192.168.1.20:9999:wall-right:true
target=192.168.1.21:9998
target=192.168.1.22:9999::false
";
        let config = NetworkConfig::parse_kv(text).unwrap();
        assert_eq!(config.listen_port, 10000);
        assert_eq!(config.client_name, "wall-left");
        assert!(!config.enable_broadcast);
        assert!(config.auto_discover);
        assert_eq!(config.heartbeat_interval_seconds, 5);
        assert_eq!(config.client_timeout_seconds, 20);
        assert!(config.auto_master_on_startup);
        assert_eq!(config.targets.len(), 3);
        assert_eq!(config.targets[0].name, "wall-right");
        assert_eq!(config.targets[1].name, "192.168.1.21");
        assert!(config.targets[1].enabled);
        assert!(!config.targets[2].enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn enabled_targets_skip_disabled() {
        let mut config = NetworkConfig::default();
        config.add_target("10.0.0.1", 9999, "", true);
        config.add_target("10.0.0.2", 9999, "", false);
        let addrs = config.enabled_targets();
        assert_eq!(addrs, vec![SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 9999)]);
    }

    #[test]
    fn validation_collects_all_errors() {
        let mut config = NetworkConfig {
            listen_port: 80,
            heartbeat_interval_seconds: 0,
            ..Default::default()
        };
        config.add_target("300.1.1.1", 9999, "", true);
        config.add_target("10.0.0.1", 22, "", true);

        let errors = config.validation_errors();
        assert_eq!(errors.len(), 4, "{:?}", errors);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn timeout_must_cover_two_heartbeats() {
        let config = NetworkConfig {
            heartbeat_interval_seconds: 10,
            client_timeout_seconds: 19,
            ..Default::default()
        };
        assert_eq!(config.validation_errors().len(), 1);

        let config = NetworkConfig { client_timeout_seconds: 20, ..config };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn bad_number_reports_line() {
        let err = NetworkConfig::parse_kv("\nlisten_port=abc\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { line: 2, .. }));
    }

    #[test]
    fn target_without_port_rejected() {
        assert!(NetworkConfig::parse_kv("target=10.0.0.1").is_err());
    }

    #[test]
    fn kv_roundtrip() {
        let mut config = NetworkConfig {
            client_name: "booth".to_string(),
            auto_sync_on_startup: true,
            ..Default::default()
        };
        config.add_target("10.1.2.3", 9999, "proj-a", true);
        config.add_target("10.1.2.4", 10001, "proj-b", false);

        let parsed = NetworkConfig::parse_kv(&config.to_kv_string()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn remove_target_by_ip() {
        let mut config = NetworkConfig::default();
        config.add_target("10.0.0.1", 9999, "a", true);
        config.add_target("10.0.0.2", 9999, "b", true);
        assert_eq!(config.remove_target("10.0.0.1"), 1);
        assert_eq!(config.targets.len(), 1);
        assert_eq!(config.remove_target("10.0.0.9"), 0);
    }

    #[test]
    fn toml_uses_defaults() {
        let text = r#"
listen_port = 12000
client_name = "foyer"

[[targets]]
ip = "10.0.0.5"
"#;
        let config: NetworkConfig = toml::from_str(text).unwrap();
        assert_eq!(config.listen_port, 12000);
        assert_eq!(config.heartbeat_interval_seconds, DEFAULT_HEARTBEAT_INTERVAL_SECS);
        assert_eq!(config.targets[0].port, DEFAULT_PORT);
        assert!(config.targets[0].enabled);
        assert!(config.validate().is_ok());
    }
}
