//! Configuration management module for osrouter.
//!
//! This module provides functionality for loading, parsing, and managing
//! configuration settings for the osrouter daemon and its CLI.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] io::Error),

    /// Error parsing TOML configuration
    #[error("Failed to parse TOML config: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Error serializing configuration to TOML
    #[error("Failed to serialize config to TOML: {0}")]
    TomlSerError(#[from] toml::ser::Error),

    /// Missing required configuration value
    #[error("Missing required configuration value: {0}")]
    MissingValue(String),

    /// Invalid configuration value
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),
}

/// Readiness polling after the interface is brought up.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ReadinessConfig {
    /// Number of status queries before giving up (default: 80)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay between queries in milliseconds (default: 50)
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

fn default_max_attempts() -> u32 {
    80
}

fn default_interval_ms() -> u64 {
    50
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        ReadinessConfig {
            max_attempts: default_max_attempts(),
            interval_ms: default_interval_ms(),
        }
    }
}

impl ReadinessConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Interface and tool settings for the router.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RouterConfig {
    /// Tun interface owned by the daemon (default: "tun0")
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Path or name of ifconfig(8)
    #[serde(default = "default_ifconfig")]
    pub ifconfig: String,

    /// Path or name of route(8)
    #[serde(default = "default_route")]
    pub route: String,

    /// Path or name of sysctl(8)
    #[serde(default = "default_sysctl")]
    pub sysctl: String,

    /// `key=value` settings applied with `sysctl -w` when the interface comes up
    #[serde(default = "default_sysctls")]
    pub sysctls: Vec<String>,

    /// Where applied state is kept between runs
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,

    /// Desired addresses and routes, read by `apply` and `run`
    #[serde(default)]
    pub desired_path: Option<PathBuf>,

    #[serde(default)]
    pub readiness: ReadinessConfig,
}

fn default_interface() -> String {
    "tun0".to_string()
}

fn default_ifconfig() -> String {
    "ifconfig".to_string()
}

fn default_route() -> String {
    "route".to_string()
}

fn default_sysctl() -> String {
    "sysctl".to_string()
}

fn default_sysctls() -> Vec<String> {
    // Large socket buffers avoid drops under load; forwarding lets the
    // host route for subnets behind the tunnel.
    [
        "net.inet.udp.recvspace=1048576",
        "net.inet.udp.sendspace=1048576",
        "net.inet.tcp.recvspace=1048576",
        "net.inet.tcp.sendspace=1048576",
        "kern.ipc.maxsockbuf=16777216",
        "kern.sbmax=16777216",
        "net.inet.ip.forwarding=1",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_state_path() -> PathBuf {
    PathBuf::from("/var/lib/osrouter/state.json")
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            interface: default_interface(),
            ifconfig: default_ifconfig(),
            route: default_route(),
            sysctl: default_sysctl(),
            sysctls: default_sysctls(),
            state_path: default_state_path(),
            desired_path: None,
            readiness: ReadinessConfig::default(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Also write logs to a daily rolling file (default: false)
    #[serde(default)]
    pub log_to_file: bool,

    /// Directory for log files (default: "/var/log/osrouter")
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// Emit JSON lines instead of human readable text (default: false)
    #[serde(default)]
    pub json_format: bool,
}

fn default_log_dir() -> String {
    "/var/log/osrouter".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_to_file: false,
            log_dir: default_log_dir(),
            json_format: false,
        }
    }
}

/// Main configuration structure for osrouter.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Config {
    /// Log level (default: "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub router: RouterConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: default_log_level(),
            logging: LoggingConfig::default(),
            router: RouterConfig::default(),
        }
    }
}

impl Config {
    /// Create a new default configuration
    pub fn new() -> Self {
        Config::default()
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;

        // Environment variables take precedence over the file
        Self::apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let router = &self.router;

        if router.interface.trim().is_empty() {
            return Err(ConfigError::MissingValue("router.interface".to_string()));
        }

        for (key, value) in [
            ("router.ifconfig", &router.ifconfig),
            ("router.route", &router.route),
            ("router.sysctl", &router.sysctl),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "tool path cannot be empty".to_string(),
                });
            }
        }

        if router.readiness.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "router.readiness.max_attempts".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if let Some(bad) = router
            .sysctls
            .iter()
            .find(|s| s.split_once('=').map_or(true, |(k, _)| k.trim().is_empty()))
        {
            return Err(ConfigError::InvalidValue {
                key: "router.sysctls".to_string(),
                message: format!("`{bad}` is not of the form key=value"),
            });
        }

        match self.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
            other => Err(ConfigError::InvalidValue {
                key: "log_level".to_string(),
                message: format!("unknown level `{other}`"),
            }),
        }
    }

    /// Apply environment variable overrides (prefix: OSROUTER_)
    /// Example keys:
    /// - OSROUTER_LOG_LEVEL
    /// - OSROUTER_INTERFACE, OSROUTER_STATE_PATH, OSROUTER_DESIRED_PATH
    /// - OSROUTER_READINESS_MAX_ATTEMPTS, OSROUTER_READINESS_INTERVAL_MS
    fn apply_env_overrides(cfg: &mut Config) {
        use std::env;

        if let Ok(v) = env::var("OSROUTER_LOG_LEVEL") {
            cfg.log_level = v;
        }
        if let Ok(v) = env::var("OSROUTER_INTERFACE") {
            cfg.router.interface = v;
        }
        if let Ok(v) = env::var("OSROUTER_STATE_PATH") {
            if !v.is_empty() {
                cfg.router.state_path = PathBuf::from(v);
            }
        }
        if let Ok(v) = env::var("OSROUTER_DESIRED_PATH") {
            cfg.router.desired_path = if v.is_empty() {
                None
            } else {
                Some(PathBuf::from(v))
            };
        }
        if let Ok(v) = env::var("OSROUTER_READINESS_MAX_ATTEMPTS") {
            if let Ok(n) = v.parse() {
                cfg.router.readiness.max_attempts = n;
            }
        }
        if let Ok(v) = env::var("OSROUTER_READINESS_INTERVAL_MS") {
            if let Ok(n) = v.parse() {
                cfg.router.readiness.interval_ms = n;
            }
        }
    }

    /// Reload configuration from the same file it was loaded from
    pub fn reload(&mut self, path: &Path) -> Result<(), ConfigError> {
        *self = Self::load(path)?;
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        PathBuf::from("/etc/osrouter/config.toml")
    }
}

/// Configuration manager for handling configuration loading and reloading.
#[derive(Debug)]
pub struct ConfigManager {
    /// Current configuration
    config: Config,
    /// Path to the configuration file
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new configuration manager with the default configuration
    pub fn new() -> Self {
        ConfigManager {
            config: Config::default(),
            config_path: Config::default_path(),
        }
    }

    /// Wrap an already loaded configuration
    pub fn with_config<P: AsRef<Path>>(config: Config, path: P) -> Self {
        ConfigManager {
            config,
            config_path: path.as_ref().to_path_buf(),
        }
    }

    /// Load configuration from the specified path
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let config = Config::load(&path)?;

        Ok(ConfigManager {
            config,
            config_path: path,
        })
    }

    /// Get a reference to the current configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get a mutable reference to the current configuration
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Reload configuration from the current path
    pub fn reload(&mut self) -> Result<(), ConfigError> {
        self.config.reload(&self.config_path)
    }

    /// Save the current configuration to the current path
    pub fn save(&self) -> Result<(), ConfigError> {
        self.config.save(&self.config_path)
    }

    /// Get the current configuration file path
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.router.interface, "tun0");
        assert_eq!(config.router.readiness.max_attempts, 80);
        assert_eq!(config.router.readiness.interval(), Duration::from_millis(50));
        assert!(config
            .router
            .sysctls
            .contains(&"net.inet.ip.forwarding=1".to_string()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config() {
        let mut file = NamedTempFile::new().unwrap();

        let config_str = r#"
            log_level = "debug"

            [router]
            interface = "tun3"
            ifconfig = "/sbin/ifconfig"
            sysctls = ["net.inet.udp.recvspace=1048576"]
            desired_path = "/etc/osrouter/desired.toml"

            [router.readiness]
            max_attempts = 10
            interval_ms = 20
        "#;

        file.write_all(config_str.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.router.interface, "tun3");
        assert_eq!(config.router.ifconfig, "/sbin/ifconfig");
        assert_eq!(config.router.route, "route");
        assert_eq!(config.router.sysctls, vec!["net.inet.udp.recvspace=1048576".to_string()]);
        assert_eq!(
            config.router.desired_path,
            Some(PathBuf::from("/etc/osrouter/desired.toml"))
        );
        assert_eq!(config.router.readiness.max_attempts, 10);
        assert_eq!(config.router.readiness.interval_ms, 20);
    }

    #[test]
    fn test_save_config() {
        let mut config = Config::default();
        config.log_level = "debug".to_string();
        config.router.interface = "tun7".to_string();
        config.router.sysctls.clear();

        let file = NamedTempFile::new().unwrap();
        config.save(file.path()).unwrap();

        let loaded_config = Config::load(file.path()).unwrap();
        assert_eq!(loaded_config, config);
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.router.interface = " ".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::MissingValue(_))));

        let mut config = Config::default();
        config.router.readiness.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.router.sysctls = vec!["kern.sbmax".to_string()];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.router.route = String::new();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_manager() {
        let mut file = NamedTempFile::new().unwrap();

        let config_str = r#"
            log_level = "info"

            [router]
            interface = "tun1"
        "#;

        file.write_all(config_str.as_bytes()).unwrap();

        let manager = ConfigManager::load(file.path()).unwrap();
        assert_eq!(manager.config().router.interface, "tun1");

        // Test saving with modifications
        let mut manager = manager;
        manager.config_mut().log_level = "debug".to_string();
        manager.save().unwrap();

        // Reload and check
        manager.reload().unwrap();
        assert_eq!(manager.config().log_level, "debug");
        assert_eq!(manager.config_path(), file.path());
    }
}
