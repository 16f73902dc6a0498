//! Configuration management for upsinfod.
//!
//! Loads settings from /etc/upsinfo/config.toml or uses defaults. Each
//! `[[accessories]]` table names its accessory type and carries the options
//! for one UPS, read leniently: a missing or mistyped option falls back to
//! its default instead of rejecting the file.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;
use toml::{Table, Value};
use tracing::{info, warn};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/upsinfo/config.toml";

/// Default config file path for fallback
pub const DEFAULT_CONFIG_PATH: &str = "/var/lib/upsinfo/config.toml";

pub const DEFAULT_NAME: &str = "Synology UPS";
pub const DEFAULT_PORT: u16 = 22;
pub const DEFAULT_COMMAND: &str = "upsc ups@localhost";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
pub const MIN_POLL_INTERVAL_SECS: u64 = 1;
pub const DEFAULT_READY_TIMEOUT_MS: u64 = 5000;

/// Key naming the accessory type inside an `[[accessories]]` table
pub const ACCESSORY_KEY: &str = "accessory";

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Tracing filter used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Full daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Raw accessory tables, interpreted by the registered plugin
    #[serde(default)]
    pub accessories: Vec<Table>,
}

impl Config {
    /// Load config from file, or return defaults
    pub fn load() -> Self {
        Self::load_from_path(CONFIG_PATH)
            .or_else(|_| Self::load_from_path(DEFAULT_CONFIG_PATH))
            .unwrap_or_else(|e| {
                warn!("Config not found, using defaults: {}", e);
                Config::default()
            })
    }

    /// Load config from specific path
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Accessory tables of the given type
    pub fn accessories_of<'a>(&'a self, accessory_type: &'a str) -> impl Iterator<Item = &'a Table> + 'a {
        self.accessories
            .iter()
            .filter(move |table| accessory_type_of(table) == Some(accessory_type))
    }
}

/// The `accessory = "..."` entry of a table
pub fn accessory_type_of(table: &Table) -> Option<&str> {
    table.get(ACCESSORY_KEY).and_then(Value::as_str)
}

/// Options for one UPS accessory
#[derive(Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsConfig {
    pub name: String,
    pub host: Option<String>,
    pub port: u16,
    pub username: String,
    #[serde(skip)]
    pub password: String,
    pub command: String,
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
    pub include_load_sensor: bool,
    #[serde(with = "duration_millis")]
    pub ready_timeout: Duration,
    #[serde(with = "option_duration_millis")]
    pub command_timeout: Option<Duration>,
}

impl UpsConfig {
    /// Build from an accessory table. Never fails; bad values use defaults.
    pub fn from_table(table: &Table) -> Self {
        let poll_interval = match number(table, "pollInterval") {
            Some(v) if v != 0.0 && !v.is_nan() => seconds(v.max(MIN_POLL_INTERVAL_SECS as f64)),
            _ => None,
        }
        .unwrap_or(Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS));

        let ready_timeout = number(table, "readyTimeout")
            .filter(|v| *v > 0.0)
            .and_then(|ms| seconds(ms / 1000.0))
            .unwrap_or(Duration::from_millis(DEFAULT_READY_TIMEOUT_MS));

        let command_timeout = number(table, "commandTimeout")
            .filter(|v| *v > 0.0)
            .and_then(|ms| seconds(ms / 1000.0));

        let port = table
            .get("port")
            .and_then(Value::as_integer)
            .and_then(|p| u16::try_from(p).ok())
            .filter(|p| *p != 0)
            .unwrap_or(DEFAULT_PORT);

        Self {
            name: non_empty(table, "name").unwrap_or_else(|| DEFAULT_NAME.to_string()),
            host: non_empty(table, "host"),
            port,
            username: string(table, "username").unwrap_or_default(),
            password: string(table, "password").unwrap_or_default(),
            command: non_empty(table, "command").unwrap_or_else(|| DEFAULT_COMMAND.to_string()),
            poll_interval,
            include_load_sensor: table
                .get("includeLoadSensor")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            ready_timeout,
            command_timeout,
        }
    }

    /// `host:port`, or just the port when no host is set
    pub fn target(&self) -> String {
        format!("{}:{}", self.host.as_deref().unwrap_or(""), self.port)
    }
}

impl Default for UpsConfig {
    fn default() -> Self {
        Self::from_table(&Table::new())
    }
}

impl fmt::Debug for UpsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpsConfig")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("command", &self.command)
            .field("poll_interval", &self.poll_interval)
            .field("include_load_sensor", &self.include_load_sensor)
            .field("ready_timeout", &self.ready_timeout)
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

fn string(table: &Table, key: &str) -> Option<String> {
    table.get(key).and_then(Value::as_str).map(str::to_string)
}

fn non_empty(table: &Table, key: &str) -> Option<String> {
    string(table, key).filter(|s| !s.trim().is_empty())
}

/// Integer or float option as f64
fn number(table: &Table, key: &str) -> Option<f64> {
    match table.get(key)? {
        Value::Integer(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

/// Seconds as a `Duration`; `None` for NaN, infinite or out-of-range values
fn seconds(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok()
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

mod option_duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn table(toml_str: &str) -> Table {
        toml::from_str(toml_str).unwrap()
    }

    #[test]
    fn test_default_ups_config() {
        let config = UpsConfig::default();
        assert_eq!(config.name, "Synology UPS");
        assert_eq!(config.host, None);
        assert_eq!(config.port, 22);
        assert_eq!(config.command, "upsc ups@localhost");
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert!(!config.include_load_sensor);
        assert_eq!(config.ready_timeout, Duration::from_millis(5000));
        assert_eq!(config.command_timeout, None);
    }

    #[test]
    fn test_full_options() {
        let config = UpsConfig::from_table(&table(
            r#"
accessory = "SynologyUPSInfo"
name = "Rack UPS"
host = "10.0.0.5"
port = 2222
username = "admin"
password = "hunter2"
command = "upsc eaton@localhost"
pollInterval = 30
includeLoadSensor = true
readyTimeout = 10000
commandTimeout = 15000
"#,
        ));
        assert_eq!(config.name, "Rack UPS");
        assert_eq!(config.host.as_deref(), Some("10.0.0.5"));
        assert_eq!(config.port, 2222);
        assert_eq!(config.username, "admin");
        assert_eq!(config.password, "hunter2");
        assert_eq!(config.command, "upsc eaton@localhost");
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert!(config.include_load_sensor);
        assert_eq!(config.ready_timeout, Duration::from_secs(10));
        assert_eq!(config.command_timeout, Some(Duration::from_secs(15)));
        assert_eq!(config.target(), "10.0.0.5:2222");
    }

    #[test]
    fn test_poll_interval_floor() {
        let config = UpsConfig::from_table(&table("pollInterval = -5"));
        assert_eq!(config.poll_interval, Duration::from_secs(1));

        let config = UpsConfig::from_table(&table("pollInterval = 0.25"));
        assert_eq!(config.poll_interval, Duration::from_secs(1));

        // Zero means "unset"
        let config = UpsConfig::from_table(&table("pollInterval = 0"));
        assert_eq!(config.poll_interval, Duration::from_secs(60));

        let config = UpsConfig::from_table(&table("pollInterval = 2.5"));
        assert_eq!(config.poll_interval, Duration::from_millis(2500));
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = UpsConfig::from_table(&table(
            r#"
name = ""
host = "   "
port = 70000
command = ""
pollInterval = "often"
includeLoadSensor = "yes"
readyTimeout = 0
commandTimeout = -1
"#,
        ));
        assert_eq!(config.name, "Synology UPS");
        assert_eq!(config.host, None);
        assert_eq!(config.port, 22);
        assert_eq!(config.command, "upsc ups@localhost");
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert!(!config.include_load_sensor);
        assert_eq!(config.ready_timeout, Duration::from_millis(5000));
        assert_eq!(config.command_timeout, None);

        // Too large for a Duration
        let config = UpsConfig::from_table(&table(
            "pollInterval = 1e20\nreadyTimeout = 1e30\ncommandTimeout = 1e300\n",
        ));
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert_eq!(config.ready_timeout, Duration::from_millis(5000));
        assert_eq!(config.command_timeout, None);

        let config = UpsConfig::from_table(&table("pollInterval = nan\nreadyTimeout = inf\n"));
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert_eq!(config.ready_timeout, Duration::from_millis(5000));
    }

    #[test]
    fn test_password_redacted_in_debug() {
        let config = UpsConfig::from_table(&table(r#"password = "hunter2""#));
        let debug = format!("{:?}", config);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));

        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("hunter2"));
    }

    #[test]
    fn test_parse_daemon_file() {
        let toml_str = r#"
[daemon]
log_level = "debug"

[[accessories]]
accessory = "SynologyUPSInfo"
host = "nas.local"

[[accessories]]
accessory = "SomethingElse"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.accessories.len(), 2);
        assert_eq!(config.accessories_of("SynologyUPSInfo").count(), 1);
        assert_eq!(accessory_type_of(&config.accessories[1]), Some("SomethingElse"));
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.daemon.log_level, "info");
        assert!(config.accessories.is_empty());
    }

    #[test]
    fn test_load_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[[accessories]]\naccessory = \"SynologyUPSInfo\"\nport = 2022").unwrap();

        let config = Config::load_from_path(file.path()).unwrap();
        let ups = UpsConfig::from_table(&config.accessories[0]);
        assert_eq!(ups.port, 2022);
    }

    #[test]
    fn test_load_from_missing_or_malformed_path_errors() {
        assert!(Config::load_from_path("/nonexistent/upsinfo.toml").is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[daemon\nlog_level = ").unwrap();
        assert!(Config::load_from_path(file.path()).is_err());
    }
}
