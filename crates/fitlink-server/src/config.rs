//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use fitlink_shared::constants::{DEFAULT_HTTP_PORT, PRESENCE_GRACE, TYPING_TIMEOUT};

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP + WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: platform data directory (see `Database::default_path`).
    pub database_path: Option<PathBuf>,

    /// HS256 secret used to verify identity tokens.
    /// Env: `AUTH_SECRET`
    pub auth_secret: String,

    /// Typing indicator auto-expiry.
    /// Env: `TYPING_TIMEOUT_MS`
    pub typing_timeout: Duration,

    /// Delay before a disconnected user is reported offline.
    /// Env: `PRESENCE_GRACE_SECS`
    pub presence_grace: Duration,

    /// How long an offline presence entry is kept before eviction.
    /// Env: `PRESENCE_RETENTION_SECS`
    pub presence_retention: Duration,

    /// Time allowed for the first `authenticate` frame on a socket opened
    /// without `?token=`.
    /// Env: `AUTH_TIMEOUT_SECS`
    pub auth_timeout: Duration,

    /// Realtime sends per user per second, and burst.
    /// Env: `SEND_RATE_PER_SEC`, `SEND_BURST`
    pub send_rate: f64,
    pub send_burst: f64,

    /// HTTP requests per IP per second, and burst.
    /// Env: `HTTP_RATE_PER_SEC`, `HTTP_BURST`
    pub http_rate: f64,
    pub http_burst: f64,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("database_path", &self.database_path)
            .field("auth_secret", &"<redacted>")
            .field("typing_timeout", &self.typing_timeout)
            .field("presence_grace", &self.presence_grace)
            .field("presence_retention", &self.presence_retention)
            .field("auth_timeout", &self.auth_timeout)
            .field("send_rate", &self.send_rate)
            .field("send_burst", &self.send_burst)
            .field("http_rate", &self.http_rate)
            .field("http_burst", &self.http_burst)
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: None,
            auth_secret: "dev-secret-change-me".to_string(),
            typing_timeout: TYPING_TIMEOUT,
            presence_grace: PRESENCE_GRACE,
            presence_retention: Duration::from_secs(3600),
            auth_timeout: Duration::from_secs(10),
            send_rate: 5.0,
            send_burst: 20.0,
            http_rate: 10.0,
            http_burst: 30.0,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            parse_into(&mut config.http_addr, "HTTP_ADDR", &addr);
        }

        if let Some(path) = lookup("DATABASE_PATH") {
            if !path.is_empty() {
                config.database_path = Some(PathBuf::from(path));
            }
        }

        match lookup("AUTH_SECRET") {
            Some(secret) if !secret.is_empty() => config.auth_secret = secret,
            _ => tracing::warn!("AUTH_SECRET not set, using the development secret"),
        }

        if let Some(val) = lookup("TYPING_TIMEOUT_MS") {
            let mut ms = config.typing_timeout.as_millis() as u64;
            parse_into(&mut ms, "TYPING_TIMEOUT_MS", &val);
            config.typing_timeout = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("PRESENCE_GRACE_SECS") {
            let mut secs = config.presence_grace.as_secs();
            parse_into(&mut secs, "PRESENCE_GRACE_SECS", &val);
            config.presence_grace = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("PRESENCE_RETENTION_SECS") {
            let mut secs = config.presence_retention.as_secs();
            parse_into(&mut secs, "PRESENCE_RETENTION_SECS", &val);
            config.presence_retention = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("AUTH_TIMEOUT_SECS") {
            let mut secs = config.auth_timeout.as_secs();
            parse_into(&mut secs, "AUTH_TIMEOUT_SECS", &val);
            config.auth_timeout = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("SEND_RATE_PER_SEC") {
            parse_into(&mut config.send_rate, "SEND_RATE_PER_SEC", &val);
        }
        if let Some(val) = lookup("SEND_BURST") {
            parse_into(&mut config.send_burst, "SEND_BURST", &val);
        }
        if let Some(val) = lookup("HTTP_RATE_PER_SEC") {
            parse_into(&mut config.http_rate, "HTTP_RATE_PER_SEC", &val);
        }
        if let Some(val) = lookup("HTTP_BURST") {
            parse_into(&mut config.http_burst, "HTTP_BURST", &val);
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

/// Overwrite `target` when `raw` parses; otherwise keep the default.
fn parse_into<T: FromStr>(target: &mut T, key: &str, raw: &str) {
    match raw.trim().parse::<T>() {
        Ok(value) => *target = value,
        Err(_) => tracing::warn!(key, value = %raw, "Invalid value, using default"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> ServerConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.typing_timeout, Duration::from_secs(3));
        assert_eq!(config.presence_grace, Duration::from_secs(30));
    }

    #[test]
    fn test_env_overrides() {
        let config = from_pairs(&[
            ("HTTP_ADDR", "127.0.0.1:9000"),
            ("DATABASE_PATH", "/tmp/fit.db"),
            ("TYPING_TIMEOUT_MS", "1500"),
            ("PRESENCE_GRACE_SECS", "5"),
            ("AUTH_SECRET", "s3cret"),
        ]);
        assert_eq!(config.http_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.database_path, Some(PathBuf::from("/tmp/fit.db")));
        assert_eq!(config.typing_timeout, Duration::from_millis(1500));
        assert_eq!(config.presence_grace, Duration::from_secs(5));
        assert_eq!(config.auth_secret, "s3cret");
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = from_pairs(&[("HTTP_ADDR", "nope"), ("SEND_BURST", "many")]);
        assert_eq!(config.http_addr, ServerConfig::default().http_addr);
        assert_eq!(config.send_burst, 20.0);
    }

    #[test]
    fn test_debug_redacts_secret() {
        let config = from_pairs(&[("AUTH_SECRET", "top-secret")]);
        assert!(!format!("{config:?}").contains("top-secret"));
    }
}
