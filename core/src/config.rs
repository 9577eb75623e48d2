// Kernel configuration
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{KernelError, Result};

/// Length of an AES-256-GCM key.
pub const KEY_LEN: usize = 32;

/// Wire serializer for envelope fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SerializerKind {
    #[default]
    Json,
    Protobuf,
}

impl SerializerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SerializerKind::Json => "json",
            SerializerKind::Protobuf => "protobuf",
        }
    }
}

impl std::str::FromStr for SerializerKind {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(SerializerKind::Json),
            "protobuf" | "proto" => Ok(SerializerKind::Protobuf),
            other => Err(KernelError::Config(format!("unknown serializer '{other}'"))),
        }
    }
}

/// Kernel configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Endpoint the transport publishes on. Port 0 picks a free port.
    pub publish_uri: String,
    /// Publishers to subscribe to at start.
    pub peers: Vec<String>,
    /// 32-byte AES-256-GCM key; envelopes travel in clear without one.
    pub encryption_key: Option<String>,
    pub serializer: SerializerKind,
    pub connect_timeout_ms: u64,
    pub poll_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    /// Subscribe to every topic of each peer instead of the known contexts only.
    pub subscribe_all: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            publish_uri: "tcp://127.0.0.1:0".to_string(),
            peers: Vec::new(),
            encryption_key: None,
            serializer: SerializerKind::Json,
            connect_timeout_ms: 5000,
            poll_timeout_ms: 100,
            shutdown_grace_ms: 2000,
            subscribe_all: false,
        }
    }
}

/// Parses a set variable; a value that does not parse is reported and ignored.
fn env_parse<T>(name: &str) -> Option<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(
                target: "config",
                var = name,
                value = %raw,
                error = %e,
                "Ignoring unparsable setting"
            );
            None
        }
    }
}

impl KernelConfig {
    /// Reads `LOOM_KERNEL_*` variables, after loading `.env` when present.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();
        Self {
            publish_uri: std::env::var("LOOM_KERNEL_PUBLISH_URI")
                .unwrap_or(defaults.publish_uri),
            peers: std::env::var("LOOM_KERNEL_PEERS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            encryption_key: std::env::var("LOOM_KERNEL_ENCRYPTION_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
            serializer: env_parse("LOOM_KERNEL_SERIALIZER").unwrap_or(defaults.serializer),
            connect_timeout_ms: env_parse("LOOM_KERNEL_CONNECT_TIMEOUT_MS")
                .unwrap_or(defaults.connect_timeout_ms),
            poll_timeout_ms: env_parse("LOOM_KERNEL_POLL_TIMEOUT_MS")
                .unwrap_or(defaults.poll_timeout_ms),
            shutdown_grace_ms: env_parse("LOOM_KERNEL_SHUTDOWN_GRACE_MS")
                .unwrap_or(defaults.shutdown_grace_ms),
            subscribe_all: env_parse("LOOM_KERNEL_SUBSCRIBE_ALL")
                .unwrap_or(defaults.subscribe_all),
        }
    }

    pub fn validate(&self) -> Result<()> {
        endpoint(&self.publish_uri)?;
        for peer in &self.peers {
            endpoint(peer)?;
        }
        if let Some(key) = &self.encryption_key {
            if key.len() != KEY_LEN {
                return Err(KernelError::Config(format!(
                    "encryption key must be {KEY_LEN} bytes, got {}",
                    key.len()
                )));
            }
        }
        if self.poll_timeout_ms == 0 {
            return Err(KernelError::Config("poll timeout must be positive".into()));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Socket address of a `tcp://host:port` endpoint. `*` stands for every interface.
pub fn endpoint(uri: &str) -> Result<String> {
    let rest = uri
        .strip_prefix("tcp://")
        .ok_or_else(|| KernelError::InvalidUri(uri.to_string()))?;
    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| KernelError::InvalidUri(uri.to_string()))?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(KernelError::InvalidUri(uri.to_string()));
    }
    let host = if host == "*" { "0.0.0.0" } else { host };
    Ok(format!("{host}:{port}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = KernelConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.poll_timeout(), Duration::from_millis(100));
    }

    #[test]
    fn endpoints() {
        assert_eq!(endpoint("tcp://127.0.0.1:5555").unwrap(), "127.0.0.1:5555");
        assert_eq!(endpoint("tcp://*:7000").unwrap(), "0.0.0.0:7000");
        assert!(matches!(endpoint("udp://x:1"), Err(KernelError::InvalidUri(_))));
        assert!(endpoint("tcp://host").is_err());
        assert!(endpoint("tcp://host:http").is_err());
    }

    #[test]
    fn short_key_is_rejected() {
        let cfg = KernelConfig {
            encryption_key: Some("too short".into()),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(KernelError::Config(_))));
    }

    #[test]
    fn serializer_names() {
        assert_eq!("JSON".parse::<SerializerKind>().unwrap(), SerializerKind::Json);
        assert_eq!("protobuf".parse::<SerializerKind>().unwrap(), SerializerKind::Protobuf);
        assert!("xml".parse::<SerializerKind>().is_err());
    }

    #[test]
    fn unparsable_env_values_fall_back_to_defaults() {
        std::env::set_var("LOOM_KERNEL_SERIALIZER", "xml");
        std::env::set_var("LOOM_KERNEL_POLL_TIMEOUT_MS", "soon");
        std::env::set_var("LOOM_KERNEL_SUBSCRIBE_ALL", "yes");
        std::env::set_var("LOOM_KERNEL_SHUTDOWN_GRACE_MS", " 750 ");

        let cfg = KernelConfig::from_env();
        assert_eq!(cfg.serializer, SerializerKind::Json);
        assert_eq!(cfg.poll_timeout_ms, 100);
        assert!(!cfg.subscribe_all);
        assert_eq!(cfg.shutdown_grace_ms, 750);
        assert_eq!(env_parse::<u64>("LOOM_KERNEL_POLL_TIMEOUT_MS"), None);

        for name in [
            "LOOM_KERNEL_SERIALIZER",
            "LOOM_KERNEL_POLL_TIMEOUT_MS",
            "LOOM_KERNEL_SUBSCRIBE_ALL",
            "LOOM_KERNEL_SHUTDOWN_GRACE_MS",
        ] {
            std::env::remove_var(name);
        }
    }
}
