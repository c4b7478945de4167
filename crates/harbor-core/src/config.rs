//! Configuration for the shared runtime
//!
//! Loaded from TOML. Every field has a default so a partial file is valid.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

/// Runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Connection admission and idle eviction
    pub connections: ConnectionsConfig,

    /// Transfer behaviour
    pub transfers: TransfersConfig,

    /// Host scoring and auto-ban
    pub defender: DefenderConfig,

    /// Certificates and revocation lists
    pub tls: TlsConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Connection limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionsConfig {
    /// Maximum concurrent connections across all protocols (0 = unlimited)
    pub max_connections: usize,

    /// Maximum concurrent connections per user (0 = unlimited)
    pub max_connections_per_user: usize,

    /// Idle time after which a connection is evicted (0 = never)
    pub idle_timeout_secs: u64,

    /// How often the idle sweeper runs
    pub idle_check_interval_secs: u64,
}

impl Default for ConnectionsConfig {
    fn default() -> Self {
        Self {
            max_connections: 0,
            max_connections_per_user: 0,
            idle_timeout_secs: 900,
            idle_check_interval_secs: 60,
        }
    }
}

impl ConnectionsConfig {
    /// Idle timeout, `None` when eviction is disabled
    pub const fn idle_timeout(&self) -> Option<Duration> {
        if self.idle_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.idle_timeout_secs))
        }
    }
}

/// Transfer configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransfersConfig {
    /// Abort a transfer making no progress for this long (0 = never)
    pub timeout_secs: u64,
}

impl TransfersConfig {
    /// Stall timeout, `None` when disabled
    pub const fn timeout(&self) -> Option<Duration> {
        if self.timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.timeout_secs))
        }
    }
}

/// Defender configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefenderConfig {
    /// Enable host scoring
    pub enabled: bool,

    /// Score at which a host is banned
    pub ban_threshold: u32,

    /// Sliding window over which event scores accumulate
    pub observation_window_secs: u64,

    /// Duration of a first ban
    pub ban_duration_secs: u64,

    /// Ceiling for escalated bans
    pub max_ban_duration_secs: u64,

    /// Score for a failed login with a valid username
    pub score_login_failed: u32,

    /// Score for a login attempt with an unknown username
    pub score_no_such_user: u32,

    /// Score for a client that disconnects without trying to log in
    pub score_no_login_tried: u32,

    /// Score for a rate or connection limit violation
    pub score_limit_exceeded: u32,

    /// Hosts that are never scored or banned
    pub safelist: Vec<IpAddr>,

    /// Hosts to keep after trimming an oversized table
    pub entries_soft_limit: usize,

    /// Number of tracked hosts that triggers trimming
    pub entries_hard_limit: usize,

    /// JSON file with operator-issued bans and unbans
    pub overrides_file: Option<PathBuf>,
}

impl Default for DefenderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ban_threshold: 15,
            observation_window_secs: 1800,
            ban_duration_secs: 1800,
            max_ban_duration_secs: 86_400,
            score_login_failed: 1,
            score_no_such_user: 2,
            score_no_login_tried: 1,
            score_limit_exceeded: 3,
            safelist: Vec::new(),
            entries_soft_limit: 100,
            entries_hard_limit: 150,
            overrides_file: None,
        }
    }
}

impl DefenderConfig {
    /// Sliding observation window
    pub const fn observation_window(&self) -> Duration {
        Duration::from_secs(self.observation_window_secs)
    }

    /// First ban duration
    pub const fn ban_duration(&self) -> Duration {
        Duration::from_secs(self.ban_duration_secs)
    }

    /// Escalation ceiling
    pub const fn max_ban_duration(&self) -> Duration {
        Duration::from_secs(self.max_ban_duration_secs)
    }
}

/// A certificate/key pair served by TLS listeners
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPairConfig {
    /// Identifier (`default` is the fallback for unknown SNI)
    pub id: String,
    /// PEM certificate chain, leaf first
    pub cert_path: PathBuf,
    /// PEM private key
    pub key_path: PathBuf,
}

/// TLS configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Key pairs to load
    pub certificates: Vec<KeyPairConfig>,

    /// PEM or DER certificate revocation lists
    pub revocation_lists: Vec<PathBuf>,

    /// CA bundle for verifying client certificates (mutual TLS)
    pub client_ca_path: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (text or json)
    pub format: LogFormat,
    /// Optional log file path (logs to stderr if not specified)
    pub file: Option<PathBuf>,
    /// Emit structured audit records for security-relevant events
    pub audit_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
            file: None,
            audit_enabled: true,
        }
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for human readability
    Text,
    /// JSON structured logging for log aggregators
    Json,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the text is not valid configuration
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Serialize to TOML, used by `init-config`
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if serialization fails
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first invalid setting
    pub fn validate(&self) -> Result<()> {
        if self.connections.idle_timeout_secs > 0 && self.connections.idle_check_interval_secs == 0 {
            return Err(Error::Config(
                "idle_check_interval_secs must be positive when idle eviction is enabled".into(),
            ));
        }

        let defender = &self.defender;
        if defender.enabled {
            if defender.ban_threshold == 0 {
                return Err(Error::Config("defender ban_threshold must be positive".into()));
            }
            if defender.observation_window_secs == 0 {
                return Err(Error::Config(
                    "defender observation_window_secs must be positive".into(),
                ));
            }
            if defender.max_ban_duration_secs < defender.ban_duration_secs {
                return Err(Error::Config(
                    "defender max_ban_duration_secs must not be lower than ban_duration_secs".into(),
                ));
            }
            if defender.entries_soft_limit >= defender.entries_hard_limit {
                return Err(Error::Config(
                    "defender entries_soft_limit must be lower than entries_hard_limit".into(),
                ));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for pair in &self.tls.certificates {
            if pair.id.is_empty() {
                return Err(Error::Config("certificate id must not be empty".into()));
            }
            if !seen.insert(pair.id.as_str()) {
                return Err(Error::Config(format!("duplicate certificate id: {}", pair.id)));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.connections.max_connections, 0);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = Config::from_toml(
            r#"
            [connections]
            max_connections = 20
            max_connections_per_user = 2

            [defender]
            ban_threshold = 5
            safelist = ["10.0.0.1"]

            [[tls.certificates]]
            id = "default"
            cert_path = "/etc/harbor/cert.pem"
            key_path = "/etc/harbor/key.pem"
            "#,
        )
        .unwrap();

        assert_eq!(config.connections.max_connections, 20);
        assert_eq!(config.connections.idle_timeout_secs, 900);
        assert_eq!(config.defender.ban_threshold, 5);
        assert_eq!(config.defender.score_no_such_user, 2);
        assert_eq!(config.defender.safelist.len(), 1);
        assert_eq!(config.tls.certificates[0].id, "default");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_certificate_ids() {
        let mut config = Config::default();
        let pair = KeyPairConfig {
            id: "ftp".into(),
            cert_path: "a.pem".into(),
            key_path: "a.key".into(),
        };
        config.tls.certificates = vec![pair.clone(), pair];
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_inverted_ban_durations() {
        let mut config = Config::default();
        config.defender.ban_duration_secs = 600;
        config.defender.max_ban_duration_secs = 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_round_trip_through_toml() {
        let config = Config::default();
        let text = config.to_toml().unwrap();
        let parsed = Config::from_toml(&text).unwrap();
        assert_eq!(
            parsed.defender.ban_threshold,
            config.defender.ban_threshold
        );
    }

    #[test]
    fn test_zero_timeouts_disable() {
        let mut config = Config::default();
        config.connections.idle_timeout_secs = 0;
        config.transfers.timeout_secs = 0;
        assert!(config.connections.idle_timeout().is_none());
        assert!(config.transfers.timeout().is_none());
    }
}
