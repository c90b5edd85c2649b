use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::node::driver::DriverKind;

/// Connection settings for one backend node.
#[derive(Clone, Deserialize, Serialize)]
pub struct NodeOptions {
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Static credential sent as the `Authorization` header
    pub auth: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub driver: DriverKind,
}

impl NodeOptions {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16, auth: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            auth: auth.into(),
            secure: false,
            driver: DriverKind::default(),
        }
    }
}

impl std::fmt::Debug for NodeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeOptions")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("auth", &"[REDACTED]")
            .field("secure", &self.secure)
            .field("driver", &self.driver)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub nodes: Vec<NodeOptions>,

    // Identity sent on the WebSocket handshake
    pub user_id: String,
    pub client_name: String,

    // Reconnection
    pub retry_count: u32,
    #[serde(with = "duration_str")]
    pub retry_delay: Duration,

    // Session resuming
    pub resume: bool,
    /// Seconds the backend keeps a resumable session alive
    pub resume_timeout: u64,
    /// Remember host -> session id so the next connect can resume
    pub persist_sessions: bool,

    // Players
    #[serde(with = "duration_str")]
    pub voice_timeout: Duration,
    pub default_search: String,
    pub default_volume: u16,
    pub max_history: usize,

    pub event_capacity: usize,
}

impl Config {
    /// Loads configuration from the environment (and `.env`).
    ///
    /// When `LAVALINK_CONFIG` points to a file, that file is used instead
    /// and may declare several nodes.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        if let Ok(path) = std::env::var("LAVALINK_CONFIG") {
            return Self::from_file(&path);
        }

        let defaults = Self::default();

        let node = NodeOptions {
            name: env_or("LAVALINK_NAME", "main"),
            host: env_or("LAVALINK_HOST", "localhost"),
            port: env_or("LAVALINK_PORT", "2333")
                .parse()
                .context("LAVALINK_PORT must be a port number")?,
            auth: env_or("LAVALINK_PASSWORD", "youshallnotpass"),
            secure: env_or("LAVALINK_SECURE", "false")
                .parse()
                .context("LAVALINK_SECURE must be true or false")?,
            driver: env_or("LAVALINK_DRIVER", DriverKind::default().as_str())
                .parse()
                .context("LAVALINK_DRIVER is not a supported driver")?,
        };

        let config = Self {
            nodes: vec![node],
            user_id: std::env::var("LAVALINK_USER_ID").context("LAVALINK_USER_ID is required")?,
            client_name: env_or("LAVALINK_CLIENT_NAME", &defaults.client_name),
            retry_count: env_or("LAVALINK_RETRY_COUNT", &defaults.retry_count.to_string()).parse()?,
            retry_delay: match std::env::var("LAVALINK_RETRY_DELAY") {
                Ok(val) if !val.trim().is_empty() => humantime::parse_duration(&val)
                    .context("LAVALINK_RETRY_DELAY must look like `3s` or `500ms`")?,
                _ => defaults.retry_delay,
            },
            resume: env_or("LAVALINK_RESUME", "false").parse()?,
            resume_timeout: env_or("LAVALINK_RESUME_TIMEOUT", &defaults.resume_timeout.to_string())
                .parse()?,
            persist_sessions: env_or("LAVALINK_PERSIST_SESSIONS", "false").parse()?,
            voice_timeout: match std::env::var("LAVALINK_VOICE_TIMEOUT") {
                Ok(val) if !val.trim().is_empty() => humantime::parse_duration(&val)
                    .context("LAVALINK_VOICE_TIMEOUT must be a duration")?,
                _ => defaults.voice_timeout,
            },
            default_search: env_or("LAVALINK_DEFAULT_SEARCH", &defaults.default_search),
            default_volume: env_or("LAVALINK_DEFAULT_VOLUME", &defaults.default_volume.to_string())
                .parse()?,
            max_history: env_or("LAVALINK_MAX_HISTORY", &defaults.max_history.to_string()).parse()?,
            event_capacity: defaults.event_capacity,
        };

        config.validate()?;
        Ok(config)
    }

    /// Loads a TOML/JSON/YAML file through the `config` crate.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config: Self = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .with_context(|| format!("failed to read {}", path.display()))?
            .try_deserialize()
            .with_context(|| format!("invalid configuration in {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Sanity checks that catch common mistakes before any node is contacted.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            anyhow::bail!("At least one node must be configured");
        }

        let mut names = HashSet::new();
        for node in &self.nodes {
            if node.name.trim().is_empty() {
                anyhow::bail!("Node names cannot be empty");
            }
            if !names.insert(node.name.as_str()) {
                anyhow::bail!("Duplicate node name: {}", node.name);
            }
            if node.host.trim().is_empty() {
                anyhow::bail!("Node {} has an empty host", node.name);
            }
            if node.port == 0 {
                anyhow::bail!("Node {} has port 0", node.name);
            }
        }

        if self.user_id.trim().is_empty() {
            anyhow::bail!("user_id must be set, the backend requires it on connect");
        }

        if self.default_volume > 1000 {
            anyhow::bail!("Default volume must be between 0 and 1000, got: {}", self.default_volume);
        }

        if self.voice_timeout.is_zero() {
            anyhow::bail!("Voice timeout must be greater than 0");
        }

        if self.event_capacity == 0 {
            anyhow::bail!("Event capacity must be greater than 0");
        }

        Ok(())
    }

    /// Log-safe summary, credentials are left out.
    pub fn summary(&self) -> String {
        let nodes: Vec<String> = self
            .nodes
            .iter()
            .map(|n| format!("{}@{}:{} ({})", n.name, n.host, n.port, n.driver))
            .collect();

        format!(
            "Config Summary:\n  \
            Nodes: {}\n  \
            Client: {} (user {})\n  \
            Retry: {} attempts every {}\n  \
            Resume: {} ({}s), persist sessions: {}\n  \
            Players: volume {}, search '{}', voice timeout {}",
            nodes.join(", "),
            self.client_name,
            self.user_id,
            self.retry_count,
            humantime::format_duration(self.retry_delay),
            self.resume,
            self.resume_timeout,
            self.persist_sessions,
            self.default_volume,
            self.default_search,
            humantime::format_duration(self.voice_timeout),
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            user_id: String::new(),
            client_name: format!("open-music-link/{}", env!("CARGO_PKG_VERSION")),
            retry_count: 15,
            retry_delay: Duration::from_secs(3),
            resume: false,
            resume_timeout: 300,
            persist_sessions: false,
            voice_timeout: Duration::from_secs(15),
            default_search: "ytsearch".to_string(),
            default_volume: 100,
            max_history: 25,
            event_capacity: 256,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Durations as human readable strings (`"3s"`, `"1m 30s"`).
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn valid() -> Config {
        Config {
            nodes: vec![NodeOptions::new("main", "localhost", 2333, "pass")],
            user_id: "1234".into(),
            ..Default::default()
        }
    }

    #[test]
    fn default_with_node_is_valid() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn rejects_duplicate_node_names() {
        let mut config = valid();
        config.nodes.push(NodeOptions::new("main", "other", 2333, "pass"));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate node name"));
    }

    #[test]
    fn rejects_missing_user_id() {
        let mut config = valid();
        config.user_id.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn summary_hides_credentials() {
        let summary = valid().summary();
        assert!(summary.contains("main@localhost:2333"));
        assert!(!summary.contains("pass"));
    }

    #[test]
    fn loads_multi_node_file() {
        let path = std::env::temp_dir().join(format!("oml-config-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            r#"
user_id = "42"
retry_count = 3
retry_delay = "500ms"
resume = true

[[nodes]]
name = "eu"
host = "eu.example.com"
port = 443
auth = "secret"
secure = true

[[nodes]]
name = "us"
host = "us.example.com"
port = 2333
auth = "secret"
driver = "lavalink/v4"
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.retry_delay, Duration::from_millis(500));
        assert_eq!(config.nodes[0].driver, DriverKind::Lavalink4);
        assert_eq!(config.nodes[1].driver, DriverKind::Lavalink4);
        assert!(config.resume);
        assert_eq!(config.voice_timeout, Duration::from_secs(15));
    }

    #[test]
    fn unknown_driver_is_fatal() {
        let path = std::env::temp_dir().join(format!("oml-bad-driver-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            r#"
user_id = "42"

[[nodes]]
name = "eu"
host = "eu.example.com"
port = 443
auth = "secret"
driver = "lavalink/v3"
"#,
        )
        .unwrap();

        let result = Config::from_file(&path);
        std::fs::remove_file(&path).ok();
        assert!(result.is_err());
    }
}
