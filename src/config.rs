//! Client configuration from environment variables.
//!
//! Every variable is optional; defaults match a local development server.
//! Invalid values (unknown dialect, non-numeric port, negative timeout)
//! are fatal at startup.
//!
//! | Variable            | Default     |
//! |---------------------|-------------|
//! | SERVER_LANGUAGE     | A           |
//! | SERVER_IP           | localhost   |
//! | SERVER_PORT         | 3000        |
//! | SERVER_USE_SSL      | false       |
//! | CONNECTION_TIMEOUT  | 30          |
//! | RECONNECT_ATTEMPTS  | 5           |
//! | RECONNECT_DELAY     | 2.0         |
//! | LOG_LEVEL           | INFO        |
//! | DB_IDENTITY         | (empty)     |
//! | PROTOCOL            | text        |

use std::time::Duration;

use sd_protocol::{Dialect, WireFormat};

use crate::error::ClientError;

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub dialect: Dialect,
    pub host: String,
    pub port: u16,
    pub use_ssl: bool,
    pub connection_timeout: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub log_level: LogLevel,
    /// Target database name; empty selects the server default.
    pub db_identity: String,
    pub wire_format: WireFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<LogLevel> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" | "WARNING" => Some(LogLevel::Warn),
            "ERROR" => Some(LogLevel::Error),
            _ => None,
        }
    }

    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            dialect: Dialect::A,
            host: "localhost".to_owned(),
            port: 3000,
            use_ssl: false,
            connection_timeout: Duration::from_secs(30),
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs_f64(2.0),
            log_level: LogLevel::Info,
            db_identity: String::new(),
            wire_format: WireFormat::Text,
        }
    }
}

impl ClientConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<ClientConfig, ClientError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary lookup function (tests).
    pub fn from_lookup<F>(lookup: F) -> Result<ClientConfig, ClientError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = ClientConfig::default();

        if let Some(tag) = lookup("SERVER_LANGUAGE") {
            config.dialect = Dialect::parse(&tag).ok_or_else(|| {
                ClientError::Config(format!(
                    "SERVER_LANGUAGE must be one of A/B/C/D, got '{}'",
                    tag
                ))
            })?;
        }
        if let Some(host) = lookup("SERVER_IP") {
            if host.trim().is_empty() {
                return Err(ClientError::Config("SERVER_IP must be non-empty".into()));
            }
            config.host = host.trim().to_owned();
        }
        if let Some(port) = lookup("SERVER_PORT") {
            config.port = port.trim().parse().map_err(|_| {
                ClientError::Config(format!("SERVER_PORT must be a TCP port, got '{}'", port))
            })?;
        }
        if let Some(ssl) = lookup("SERVER_USE_SSL") {
            config.use_ssl = parse_bool(&ssl).ok_or_else(|| {
                ClientError::Config(format!("SERVER_USE_SSL must be a boolean, got '{}'", ssl))
            })?;
        }
        if let Some(timeout) = lookup("CONNECTION_TIMEOUT") {
            let secs: f64 = timeout.trim().parse().map_err(|_| {
                ClientError::Config(format!(
                    "CONNECTION_TIMEOUT must be numeric seconds, got '{}'",
                    timeout
                ))
            })?;
            if secs <= 0.0 || !secs.is_finite() {
                return Err(ClientError::Config(format!(
                    "CONNECTION_TIMEOUT must be > 0, got {}",
                    secs
                )));
            }
            config.connection_timeout = Duration::from_secs_f64(secs);
        }
        if let Some(attempts) = lookup("RECONNECT_ATTEMPTS") {
            config.reconnect_attempts = attempts.trim().parse().map_err(|_| {
                ClientError::Config(format!(
                    "RECONNECT_ATTEMPTS must be a non-negative integer, got '{}'",
                    attempts
                ))
            })?;
        }
        if let Some(delay) = lookup("RECONNECT_DELAY") {
            let secs: f64 = delay.trim().parse().map_err(|_| {
                ClientError::Config(format!(
                    "RECONNECT_DELAY must be numeric seconds, got '{}'",
                    delay
                ))
            })?;
            if secs < 0.0 || !secs.is_finite() {
                return Err(ClientError::Config(format!(
                    "RECONNECT_DELAY must be >= 0, got {}",
                    secs
                )));
            }
            config.reconnect_delay = Duration::from_secs_f64(secs);
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            config.log_level = LogLevel::parse(&level).ok_or_else(|| {
                ClientError::Config(format!(
                    "LOG_LEVEL must be DEBUG/INFO/WARN/ERROR, got '{}'",
                    level
                ))
            })?;
        }
        if let Some(db) = lookup("DB_IDENTITY") {
            config.db_identity = db.trim().to_owned();
        }
        if let Some(proto) = lookup("PROTOCOL") {
            config.wire_format = WireFormat::parse(&proto).ok_or_else(|| {
                ClientError::Config(format!("PROTOCOL must be text or binary, got '{}'", proto))
            })?;
        }

        Ok(config)
    }

    /// WebSocket URL of the game stream endpoint.
    pub fn ws_url(&self) -> String {
        let scheme = if self.use_ssl { "wss" } else { "ws" };
        if self.db_identity.is_empty() {
            format!("{}://{}:{}/v1/stream", scheme, self.host, self.port)
        } else {
            format!(
                "{}://{}:{}/v1/stream/{}",
                scheme, self.host, self.port, self.db_identity
            )
        }
    }

    /// Install a global tracing subscriber honoring `LOG_LEVEL`.
    ///
    /// Safe to call more than once; later calls are no-ops.
    pub fn init_tracing(&self) {
        use tracing_subscriber::EnvFilter;
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.log_level.as_filter()));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init();
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = ClientConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.ws_url(), "ws://localhost:3000/v1/stream");
    }

    #[test]
    fn explicit_values_override_defaults() {
        let config = ClientConfig::from_lookup(lookup_from(&[
            ("SERVER_LANGUAGE", "c"),
            ("SERVER_IP", "game.example.com"),
            ("SERVER_PORT", "9000"),
            ("SERVER_USE_SSL", "true"),
            ("CONNECTION_TIMEOUT", "5"),
            ("RECONNECT_ATTEMPTS", "2"),
            ("RECONNECT_DELAY", "0.5"),
            ("LOG_LEVEL", "debug"),
            ("DB_IDENTITY", "arena"),
            ("PROTOCOL", "binary"),
        ]))
        .unwrap();
        assert_eq!(config.dialect, Dialect::C);
        assert_eq!(config.port, 9000);
        assert!(config.use_ssl);
        assert_eq!(config.reconnect_delay, Duration::from_secs_f64(0.5));
        assert_eq!(config.wire_format, WireFormat::Binary);
        assert_eq!(config.ws_url(), "wss://game.example.com:9000/v1/stream/arena");
    }

    #[test]
    fn unknown_dialect_is_fatal() {
        let err =
            ClientConfig::from_lookup(lookup_from(&[("SERVER_LANGUAGE", "Z")])).unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[test]
    fn non_numeric_port_is_fatal() {
        let err = ClientConfig::from_lookup(lookup_from(&[("SERVER_PORT", "nine")])).unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[test]
    fn negative_timeout_is_fatal() {
        let err =
            ClientConfig::from_lookup(lookup_from(&[("CONNECTION_TIMEOUT", "-1")])).unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
        let err =
            ClientConfig::from_lookup(lookup_from(&[("RECONNECT_DELAY", "-0.1")])).unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[test]
    fn zero_reconnect_delay_is_allowed() {
        let config = ClientConfig::from_lookup(lookup_from(&[("RECONNECT_DELAY", "0")])).unwrap();
        assert_eq!(config.reconnect_delay, Duration::ZERO);
    }
}
