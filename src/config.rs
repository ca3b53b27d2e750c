//! Line-oriented configuration with transactional reload.
//!
//! The file format is plain `key = value` lines; `#` starts a comment and
//! lines without `=` are skipped. Every recognized key runs through a typed
//! parser, and a load either applies completely or not at all: on any parse
//! error, unknown key, or shortfall of required keys the previous
//! configuration is kept unchanged.
//!
//! The loader itself is not synchronized. Reloading is the service thread's
//! job; everyone else reads snapshot copies.

use std::fs;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;

use thiserror::Error;

const KEY_DST_IP: &str = "trackmanager_dst_ip";
const KEY_DST_PORT: &str = "trackmanager_dst_port";
const KEY_RECV_PORT: &str = "trackmanager_recv_port";
const KEY_RECV_FILTERS: &str = "trackmanager_recv_filters";

/// Number of keys a file must supply for a load to succeed.
const REQUIRED_KEYS: usize = 4;

/// Configuration load failures. Any of these leaves the previous
/// configuration in place.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid IPv4 address for {key}: {value:?}")]
    InvalidIp { key: &'static str, value: String },

    #[error("invalid port for {key}: {value:?} (expected 1-65535)")]
    InvalidPort { key: &'static str, value: String },

    #[error("no usable filter in {value:?}")]
    EmptyFilters { value: String },

    #[error("unrecognized config key {key:?}")]
    UnknownKey { key: String },

    #[error("only {found} of {required} required keys present")]
    MissingKeys { found: usize, required: usize },
}

/// Runtime configuration of the transport endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackConfig {
    /// Destination for outbound track state.
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
    /// Local port the command receiver binds.
    pub recv_port: u16,
    /// Substrings an inbound packet id must contain to be accepted.
    pub recv_filters: Vec<String>,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            dst_ip: Ipv4Addr::LOCALHOST,
            dst_port: 5555,
            recv_port: 5556,
            recv_filters: vec!["TRACK_MERGE_COMMAND".to_string()],
        }
    }
}

impl TrackConfig {
    /// Load a configuration from scratch. First-time failure is fatal to the
    /// system; callers surface it rather than falling back to defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.reload(path)?;
        Ok(config)
    }

    /// Re-read the file, replacing `self` only if every key parses and the
    /// required count is met. On failure `self` is untouched.
    pub fn reload(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let mut next = self.clone();
        let mut applied = 0;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };

            next.apply(key.trim(), value.trim())?;
            applied += 1;
        }

        if applied < REQUIRED_KEYS {
            return Err(ConfigError::MissingKeys {
                found: applied,
                required: REQUIRED_KEYS,
            });
        }

        *self = next;
        Ok(())
    }

    /// Pre-resolved destination socket address.
    pub fn dst_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.dst_ip, self.dst_port))
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            KEY_DST_IP => self.dst_ip = parse_ip(KEY_DST_IP, value)?,
            KEY_DST_PORT => self.dst_port = parse_port(KEY_DST_PORT, value)?,
            KEY_RECV_PORT => self.recv_port = parse_port(KEY_RECV_PORT, value)?,
            KEY_RECV_FILTERS => self.recv_filters = parse_filters(value)?,
            unknown => {
                return Err(ConfigError::UnknownKey {
                    key: unknown.to_string(),
                })
            }
        }
        Ok(())
    }
}

fn parse_ip(key: &'static str, value: &str) -> Result<Ipv4Addr, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidIp {
        key,
        value: value.to_string(),
    })
}

fn parse_port(key: &'static str, value: &str) -> Result<u16, ConfigError> {
    match value.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(ConfigError::InvalidPort {
            key,
            value: value.to_string(),
        }),
    }
}

fn parse_filters(value: &str) -> Result<Vec<String>, ConfigError> {
    let filters: Vec<String> = value
        .split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_string)
        .collect();

    if filters.is_empty() {
        return Err(ConfigError::EmptyFilters {
            value: value.to_string(),
        });
    }
    Ok(filters)
}
