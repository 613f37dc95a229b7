//! Broker configuration.
//!
//! Configuration is loaded from environment variables with sensible
//! defaults; every field can also be set directly on the struct by
//! embedders that do not use the environment.

use media_engine::{TransportOptions, WorkerSettings};
use signal_protocol::{CodecCapability, MediaKind};
use serde_json::json;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::env;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::str::FromStr;
use thiserror::Error;

/// Default lowest RTC port.
pub const DEFAULT_RTC_MIN_PORT: u16 = 10_000;

/// Default highest RTC port (inclusive).
pub const DEFAULT_RTC_MAX_PORT: u16 = 10_100;

/// Default address transports listen on.
pub const DEFAULT_LISTEN_IP: &str = "0.0.0.0";

/// Default address advertised in ICE candidates.
pub const DEFAULT_ANNOUNCED_IP: &str = "127.0.0.1";

/// Default initial outgoing bitrate estimate in bits per second.
pub const DEFAULT_INITIAL_OUTGOING_BITRATE: u32 = 1_000_000;

/// Default cap on a peer's sending rate in bits per second.
pub const DEFAULT_MAX_INCOMING_BITRATE: u32 = 1_500_000;

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Number of engine workers (default: available parallelism).
    pub worker_count: usize,

    /// Lowest RTC port workers may bind (default: 10000).
    pub rtc_min_port: u16,

    /// Highest RTC port workers may bind, inclusive (default: 10100).
    pub rtc_max_port: u16,

    /// Address transports listen on (default: "0.0.0.0").
    pub listen_ip: String,

    /// Address advertised in ICE candidates (default: "127.0.0.1").
    pub announced_ip: String,

    /// Initial outgoing bitrate estimate in bits per second.
    pub initial_outgoing_bitrate: u32,

    /// Cap on a peer's sending rate in bits per second.
    pub max_incoming_bitrate: u32,

    /// Receive codec set offered by every room router.
    ///
    /// Not environment-configurable; embedders set the field directly.
    pub codecs: Vec<CodecCapability>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl BrokerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let worker_count = parse_var(vars, "BROKER_WORKER_COUNT", default_worker_count())?;
        let rtc_min_port = parse_var(vars, "BROKER_RTC_MIN_PORT", DEFAULT_RTC_MIN_PORT)?;
        let rtc_max_port = parse_var(vars, "BROKER_RTC_MAX_PORT", DEFAULT_RTC_MAX_PORT)?;

        let listen_ip = vars
            .get("BROKER_LISTEN_IP")
            .cloned()
            .unwrap_or_else(|| DEFAULT_LISTEN_IP.to_string());

        let announced_ip = vars
            .get("BROKER_ANNOUNCED_IP")
            .cloned()
            .unwrap_or_else(|| DEFAULT_ANNOUNCED_IP.to_string());

        let initial_outgoing_bitrate = parse_var(
            vars,
            "BROKER_INITIAL_OUTGOING_BITRATE",
            DEFAULT_INITIAL_OUTGOING_BITRATE,
        )?;
        let max_incoming_bitrate = parse_var(
            vars,
            "BROKER_MAX_INCOMING_BITRATE",
            DEFAULT_MAX_INCOMING_BITRATE,
        )?;

        let config = Self {
            worker_count,
            rtc_min_port,
            rtc_max_port,
            listen_ip,
            announced_ip,
            initial_outgoing_bitrate,
            max_incoming_bitrate,
            codecs: default_codecs(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::InvalidValue(
                "BROKER_WORKER_COUNT must be at least 1".to_string(),
            ));
        }
        if self.rtc_min_port > self.rtc_max_port {
            return Err(ConfigError::InvalidValue(format!(
                "BROKER_RTC_MIN_PORT ({}) must not exceed BROKER_RTC_MAX_PORT ({})",
                self.rtc_min_port, self.rtc_max_port
            )));
        }
        if IpAddr::from_str(&self.listen_ip).is_err() {
            return Err(ConfigError::InvalidValue(format!(
                "BROKER_LISTEN_IP '{}' is not an IP address",
                self.listen_ip
            )));
        }
        if IpAddr::from_str(&self.announced_ip).is_err() {
            return Err(ConfigError::InvalidValue(format!(
                "BROKER_ANNOUNCED_IP '{}' is not an IP address",
                self.announced_ip
            )));
        }
        if self.codecs.is_empty() {
            return Err(ConfigError::InvalidValue(
                "codec set must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Settings handed to the engine when creating workers.
    #[must_use]
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            rtc_min_port: self.rtc_min_port,
            rtc_max_port: self.rtc_max_port,
        }
    }

    /// Options handed to the engine when creating transports.
    #[must_use]
    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            listen_ip: self.listen_ip.clone(),
            announced_ip: self.announced_ip.clone(),
            initial_bitrate: self.initial_outgoing_bitrate,
            max_incoming_bitrate: self.max_incoming_bitrate,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            rtc_min_port: DEFAULT_RTC_MIN_PORT,
            rtc_max_port: DEFAULT_RTC_MAX_PORT,
            listen_ip: DEFAULT_LISTEN_IP.to_string(),
            announced_ip: DEFAULT_ANNOUNCED_IP.to_string(),
            initial_outgoing_bitrate: DEFAULT_INITIAL_OUTGOING_BITRATE,
            max_incoming_bitrate: DEFAULT_MAX_INCOMING_BITRATE,
            codecs: default_codecs(),
        }
    }
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key}: '{raw}' cannot be parsed"))),
        None => Ok(default),
    }
}

/// Codec set offered by room routers: opus plus the common video trio.
#[must_use]
pub fn default_codecs() -> Vec<CodecCapability> {
    vec![
        CodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48_000,
            channels: Some(2),
            parameters: BTreeMap::new(),
        },
        CodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90_000,
            channels: None,
            parameters: BTreeMap::from([("x-google-start-bitrate".to_string(), json!(1000))]),
        },
        CodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP9".to_string(),
            clock_rate: 90_000,
            channels: None,
            parameters: BTreeMap::from([
                ("profile-id".to_string(), json!(2)),
                ("x-google-start-bitrate".to_string(), json!(1000)),
            ]),
        },
        CodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/H264".to_string(),
            clock_rate: 90_000,
            channels: None,
            parameters: BTreeMap::from([
                ("packetization-mode".to_string(), json!(1)),
                ("profile-level-id".to_string(), json!("4d0032")),
                ("level-asymmetry-allowed".to_string(), json!(1)),
                ("x-google-start-bitrate".to_string(), json!(1000)),
            ]),
        },
    ]
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vars_success_with_defaults() {
        let vars = HashMap::new();

        let config = BrokerConfig::from_vars(&vars).expect("Config should load successfully");

        assert!(config.worker_count >= 1);
        assert_eq!(config.rtc_min_port, DEFAULT_RTC_MIN_PORT);
        assert_eq!(config.rtc_max_port, DEFAULT_RTC_MAX_PORT);
        assert_eq!(config.listen_ip, DEFAULT_LISTEN_IP);
        assert_eq!(config.announced_ip, DEFAULT_ANNOUNCED_IP);
        assert_eq!(
            config.initial_outgoing_bitrate,
            DEFAULT_INITIAL_OUTGOING_BITRATE
        );
        assert_eq!(config.max_incoming_bitrate, DEFAULT_MAX_INCOMING_BITRATE);
        assert_eq!(config.codecs.len(), 4);
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let vars = HashMap::from([
            ("BROKER_WORKER_COUNT".to_string(), "2".to_string()),
            ("BROKER_RTC_MIN_PORT".to_string(), "20000".to_string()),
            ("BROKER_RTC_MAX_PORT".to_string(), "20050".to_string()),
            ("BROKER_LISTEN_IP".to_string(), "127.0.0.1".to_string()),
            ("BROKER_ANNOUNCED_IP".to_string(), "192.168.1.10".to_string()),
            (
                "BROKER_INITIAL_OUTGOING_BITRATE".to_string(),
                "600000".to_string(),
            ),
            (
                "BROKER_MAX_INCOMING_BITRATE".to_string(),
                "900000".to_string(),
            ),
        ]);

        let config = BrokerConfig::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.worker_count, 2);
        assert_eq!(config.rtc_min_port, 20_000);
        assert_eq!(config.rtc_max_port, 20_050);
        assert_eq!(config.listen_ip, "127.0.0.1");
        assert_eq!(config.announced_ip, "192.168.1.10");
        assert_eq!(config.initial_outgoing_bitrate, 600_000);
        assert_eq!(config.max_incoming_bitrate, 900_000);
    }

    #[test]
    fn test_from_vars_rejects_unparseable_value() {
        let vars = HashMap::from([("BROKER_RTC_MIN_PORT".to_string(), "lots".to_string())]);

        let result = BrokerConfig::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidValue(v)) if v.contains("BROKER_RTC_MIN_PORT"))
        );
    }

    #[test]
    fn test_from_vars_rejects_inverted_port_range() {
        let vars = HashMap::from([
            ("BROKER_RTC_MIN_PORT".to_string(), "30000".to_string()),
            ("BROKER_RTC_MAX_PORT".to_string(), "20000".to_string()),
        ]);

        let result = BrokerConfig::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_from_vars_rejects_zero_workers() {
        let vars = HashMap::from([("BROKER_WORKER_COUNT".to_string(), "0".to_string())]);

        let result = BrokerConfig::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_from_vars_rejects_bad_ip() {
        let vars = HashMap::from([("BROKER_ANNOUNCED_IP".to_string(), "not-an-ip".to_string())]);

        let result = BrokerConfig::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_default_codecs_cover_both_kinds() {
        let codecs = default_codecs();
        assert!(codecs.iter().any(|c| c.kind == MediaKind::Audio));
        assert!(codecs.iter().any(|c| c.kind == MediaKind::Video));
    }

    #[test]
    fn test_transport_options_mirror_config() {
        let config = BrokerConfig::default();
        let options = config.transport_options();
        assert_eq!(options.listen_ip, config.listen_ip);
        assert_eq!(options.announced_ip, config.announced_ip);
        assert_eq!(options.initial_bitrate, config.initial_outgoing_bitrate);
        assert_eq!(options.max_incoming_bitrate, config.max_incoming_bitrate);
    }
}
