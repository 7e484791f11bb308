//! Load config from file and environment.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use serde::Deserialize;
use tracing::warn;

/// Daemon configuration. File: ~/.config/bitshare/config.toml or /etc/bitshare/config.toml.
/// Env overrides: BITSHARE_LOCAL_PORT, BITSHARE_DISCOVERY_PORT, BITSHARE_TRANSFER_PORT.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Local control TCP port, loopback only (default 45780).
    #[serde(default = "default_local_port")]
    pub local_port: u16,
    /// Remote discovery UDP port (default 45781).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Remote transfer-announce TCP port (default 45782).
    #[serde(default = "default_transfer_port")]
    pub transfer_port: u16,
}

fn default_local_port() -> u16 {
    45780
}
fn default_discovery_port() -> u16 {
    45781
}
fn default_transfer_port() -> u16 {
    45782
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_port: default_local_port(),
            discovery_port: default_discovery_port(),
            transfer_port: default_transfer_port(),
        }
    }
}

impl Config {
    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.local_port)
    }

    pub fn discovery_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.discovery_port)
    }

    pub fn transfer_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.transfer_port)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

/// Parse a config file body; missing keys take their defaults.
pub fn parse(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(s)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    let overrides: [(&str, &mut u16); 3] = [
        ("BITSHARE_LOCAL_PORT", &mut c.local_port),
        ("BITSHARE_DISCOVERY_PORT", &mut c.discovery_port),
        ("BITSHARE_TRANSFER_PORT", &mut c.transfer_port),
    ];
    for (key, slot) in overrides {
        if let Some(s) = var(key) {
            match s.parse::<u16>() {
                Ok(p) => *slot = p,
                Err(_) => warn!(%key, value = %s, "ignoring invalid port override"),
            }
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/bitshare/config.toml"));
    }
    out.push(PathBuf::from("/etc/bitshare/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match parse(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => warn!(path = %p.display(), error = %e, "ignoring malformed config"),
                },
                Err(e) => warn!(path = %p.display(), error = %e, "cannot read config"),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.local_addr().to_string(), "127.0.0.1:45780");
        assert_eq!(c.discovery_addr().to_string(), "0.0.0.0:45781");
        assert_eq!(c.transfer_addr().to_string(), "0.0.0.0:45782");
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let c = parse("discovery_port = 9000\n").unwrap();
        assert_eq!(c.discovery_port, 9000);
        assert_eq!(c.local_port, 45780);
        assert_eq!(c.transfer_port, 45782);
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(parse("proxy_port = 3128\n").is_err());
    }

    #[test]
    fn env_overrides_valid_ports_only() {
        let mut c = Config::default();
        apply_env(&mut c, |key| match key {
            "BITSHARE_LOCAL_PORT" => Some("5000".to_string()),
            "BITSHARE_TRANSFER_PORT" => Some("not-a-port".to_string()),
            _ => None,
        });
        assert_eq!(c.local_port, 5000);
        assert_eq!(c.discovery_port, 45781);
        assert_eq!(c.transfer_port, 45782);
    }
}
