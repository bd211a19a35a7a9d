use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// What the daemon does when the upstream is confirmed down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailoverMode {
    /// Passive monitoring only. Elections never run.
    #[default]
    Manual,
    /// Run elections and execute promote/follow commands.
    Automatic,
}

/// Where log output is routed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogDestination {
    #[default]
    Stderr,
    File,
}

/// Logger routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Minimum level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Destination for formatted output.
    #[serde(default)]
    pub log_type: LogDestination,
    /// Target file when `log_type = "file"`.
    #[serde(default)]
    pub log_file: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_type: LogDestination::Stderr,
            log_file: String::new(),
        }
    }
}

/// Top-level daemon configuration, loaded from a TOML file.
///
/// Every timing knob the failover machinery uses is configurable here;
/// defaults match the behavior the fleet has run with historically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Identity used to locate our own record in the cluster metadata.
    pub node_id: i32,
    /// Connection string for the local DB instance.
    pub conninfo: String,

    #[serde(default)]
    pub failover_mode: FailoverMode,

    /// Shell command that promotes the local instance to primary.
    #[serde(default)]
    pub promote_command: String,
    /// Service-manager variant of the promote command; takes precedence
    /// over `promote_command` when both are set.
    #[serde(default)]
    pub service_promote_command: String,
    /// Shell command that re-attaches the local instance to a new primary.
    /// `%n` is replaced with the new primary's node ID.
    #[serde(default)]
    pub follow_command: String,

    /// Seconds to sleep before running the promote command (testing aid).
    #[serde(default)]
    pub promote_delay_secs: u64,

    /// Seconds between "still alive" INFO log lines; 0 disables them.
    #[serde(default = "default_log_status_interval_secs")]
    pub log_status_interval_secs: u64,

    /// Persist event records to the cluster metadata DB.
    #[serde(default)]
    pub monitoring_history: bool,

    /// Upper bound for connection attempts and in-flight queries.
    #[serde(default = "default_primary_response_timeout_secs")]
    pub primary_response_timeout_secs: u64,

    /// Bounded reconnect budget consulted before failover is considered.
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,

    /// How long a follower waits for the elected candidate's notification
    /// before giving up the failover round.
    #[serde(default = "default_primary_notification_timeout_secs")]
    pub primary_notification_timeout_secs: u64,

    /// Prometheus exporter listen address; empty disables the exporter.
    #[serde(default)]
    pub metrics_listen_addr: String,

    #[serde(default)]
    pub log: LogConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_status_interval_secs() -> u64 {
    300
}

fn default_primary_response_timeout_secs() -> u64 {
    60
}

fn default_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_interval_secs() -> u64 {
    1
}

fn default_primary_notification_timeout_secs() -> u64 {
    60
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            conninfo: String::new(),
            failover_mode: FailoverMode::Manual,
            promote_command: String::new(),
            service_promote_command: String::new(),
            follow_command: String::new(),
            promote_delay_secs: 0,
            log_status_interval_secs: default_log_status_interval_secs(),
            monitoring_history: false,
            primary_response_timeout_secs: default_primary_response_timeout_secs(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_interval_secs: default_reconnect_interval_secs(),
            primary_notification_timeout_secs: default_primary_notification_timeout_secs(),
            metrics_listen_addr: String::new(),
            log: LogConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Read and parse the configuration file. A missing or malformed file is
    /// startup-fatal; there is no defaults fallback for the daemon.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: DaemonConfig = toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Startup sanity checks. Called by `load` and again after CLI overrides
    /// are applied.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id <= 0 {
            return Err(ConfigError::MissingNodeId);
        }
        if self.conninfo.is_empty() {
            return Err(ConfigError::MissingConninfo);
        }
        if self.failover_mode == FailoverMode::Automatic {
            if self.promote_command.is_empty() && self.service_promote_command.is_empty() {
                return Err(ConfigError::MissingPromoteCommand);
            }
            if self.follow_command.is_empty() {
                return Err(ConfigError::MissingFollowCommand);
            }
        }
        parse_log_level(&self.log.log_level)?;
        if self.log.log_type == LogDestination::File && self.log.log_file.is_empty() {
            return Err(ConfigError::MissingLogFile);
        }
        Ok(())
    }

    /// The effective promote command (service variant wins when both set).
    /// Empty only under `failover_mode = manual`.
    pub fn effective_promote_command(&self) -> &str {
        if !self.service_promote_command.is_empty() {
            &self.service_promote_command
        } else {
            &self.promote_command
        }
    }

    pub fn promote_delay(&self) -> Duration {
        Duration::from_secs(self.promote_delay_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    pub fn primary_response_timeout(&self) -> Duration {
        Duration::from_secs(self.primary_response_timeout_secs)
    }

    pub fn primary_notification_timeout(&self) -> Duration {
        Duration::from_secs(self.primary_notification_timeout_secs)
    }
}

/// Validate a log level string, returning its canonical form.
/// Shared by config validation and the `-L/--log-level` CLI override.
pub fn parse_log_level(level: &str) -> Result<&'static str, ConfigError> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Ok("trace"),
        "debug" => Ok("debug"),
        "info" => Ok("info"),
        "warn" | "warning" => Ok("warn"),
        "error" => Ok("error"),
        other => Err(ConfigError::InvalidLogLevel(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn minimal_toml() -> &'static str {
        r#"
node_id = 2
conninfo = "host=node2 dbname=app"
"#
    }

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let config: DaemonConfig = toml::from_str(minimal_toml()).unwrap();
        assert_eq!(config.node_id, 2);
        assert_eq!(config.failover_mode, FailoverMode::Manual);
        assert_eq!(config.reconnect_attempts, 5);
        assert_eq!(config.primary_notification_timeout_secs, 60);
        assert_eq!(config.log.log_level, "info");
        config.validate().unwrap();
    }

    #[test]
    fn test_automatic_mode_requires_promote_and_follow() {
        let mut config: DaemonConfig = toml::from_str(minimal_toml()).unwrap();
        config.failover_mode = FailoverMode::Automatic;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingPromoteCommand)
        ));

        config.promote_command = "pg_ctl promote".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingFollowCommand)
        ));

        config.follow_command = "repoint --upstream %n".into();
        config.validate().unwrap();
    }

    #[test]
    fn test_service_promote_command_alone_satisfies_automatic() {
        let mut config: DaemonConfig = toml::from_str(minimal_toml()).unwrap();
        config.failover_mode = FailoverMode::Automatic;
        config.service_promote_command = "systemctl promote db".into();
        config.follow_command = "repoint --upstream %n".into();
        config.validate().unwrap();
        assert_eq!(config.effective_promote_command(), "systemctl promote db");
    }

    #[test]
    fn test_missing_identity_rejected() {
        let config = DaemonConfig {
            conninfo: "host=x".into(),
            ..DaemonConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::MissingNodeId)));

        let config = DaemonConfig {
            node_id: 1,
            ..DaemonConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingConninfo)
        ));
    }

    #[test]
    fn test_file_destination_requires_log_file() {
        let mut config: DaemonConfig = toml::from_str(minimal_toml()).unwrap();
        config.log.log_type = LogDestination::File;
        assert!(matches!(config.validate(), Err(ConfigError::MissingLogFile)));
        config.log.log_file = "/var/log/perchd.log".into();
        config.validate().unwrap();
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(parse_log_level("INFO").unwrap(), "info");
        assert_eq!(parse_log_level("warning").unwrap(), "warn");
        assert!(parse_log_level("chatty").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "node_id = 7").unwrap();
        writeln!(f, "conninfo = \"host=node7\"").unwrap();
        writeln!(f, "failover_mode = \"automatic\"").unwrap();
        writeln!(f, "promote_command = \"promote\"").unwrap();
        writeln!(f, "follow_command = \"follow %n\"").unwrap();
        let config = DaemonConfig::load(f.path()).unwrap();
        assert_eq!(config.node_id, 7);
        assert_eq!(config.failover_mode, FailoverMode::Automatic);
    }

    #[test]
    fn test_load_missing_file_is_fatal() {
        let err = DaemonConfig::load(Path::new("/nonexistent/perchd.conf")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_load_rejects_malformed_toml() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "node_id = ").unwrap();
        let err = DaemonConfig::load(f.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
