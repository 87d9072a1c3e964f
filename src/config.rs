//! Configuration module for the line command server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Port used when neither the CLI nor the config file names one.
pub const DEFAULT_PORT: u16 = 8023;

/// Command-line arguments for the command server
#[derive(Parser, Debug)]
#[command(name = "line-command-server")]
#[command(version = "0.1.0")]
#[command(about = "A line-oriented TCP command server", long_about = None)]
#[command(disable_help_flag = true)]
pub struct CliArgs {
    /// IP host address to bind to.
    #[arg(short = 'h', long)]
    pub host: Option<String>,

    /// TCP port to bind to.
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Socket poll timeout in microseconds
    #[arg(long)]
    pub poll_timeout_us: Option<u64>,

    /// Upper bound on the final worker join at shutdown, in milliseconds
    #[arg(long)]
    pub drain_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Print help
    #[arg(long, action = clap::ArgAction::Help)]
    #[allow(dead_code)]
    pub help: Option<bool>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Host name or address to bind to
    pub host: Option<String>,
    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Poll timeout in microseconds
    #[serde(default = "default_poll_timeout_us")]
    pub poll_timeout_us: u64,
    /// Bound on the shutdown drain, unbounded when absent
    pub drain_timeout_ms: Option<u64>,
    /// Bytes read from a connection per receive call
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_port(),
            backlog: default_backlog(),
            poll_timeout_us: default_poll_timeout_us(),
            drain_timeout_ms: None,
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_backlog() -> i32 {
    5
}

fn default_poll_timeout_us() -> u64 {
    100
}

fn default_read_buffer_size() -> usize {
    256
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: Option<String>,
    pub port: u16,
    pub backlog: i32,
    pub poll_timeout: Duration,
    pub drain_timeout: Option<Duration>,
    pub read_buffer_size: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Merge already-parsed CLI arguments with the config file they name.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Config {
            host: cli.host.or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            backlog: toml_config.server.backlog,
            poll_timeout: Duration::from_micros(
                cli.poll_timeout_us
                    .unwrap_or(toml_config.server.poll_timeout_us),
            ),
            drain_timeout: cli
                .drain_timeout_ms
                .or(toml_config.server.drain_timeout_ms)
                .map(Duration::from_millis),
            read_buffer_size: toml_config.server.read_buffer_size,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_timeout.is_zero() {
            return Err(ConfigError::Invalid("poll timeout must be non-zero"));
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::Invalid("read buffer size must be non-zero"));
        }
        if self.backlog <= 0 {
            return Err(ConfigError::Invalid("listen backlog must be positive"));
        }
        Ok(())
    }

    /// Resolve the configured host into the address the listener binds.
    ///
    /// No host means every IPv4 interface. When the resolver answers with
    /// several addresses the first IPv4 one is preferred.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let any = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port);

        let Some(host) = self.host.as_deref() else {
            return Ok(any);
        };

        let addrs: Vec<SocketAddr> = (host, self.port)
            .to_socket_addrs()
            .map_err(|e| ConfigError::Resolve(host.to_string(), e))?
            .collect();

        match addrs.iter().find(|a| a.is_ipv4()).or(addrs.first()) {
            Some(addr) => Ok(*addr),
            None => {
                warn!(host, "Host resolved to no addresses, binding to any address");
                Ok(any)
            }
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str),
    Resolve(String, std::io::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(reason) => write!(f, "Invalid configuration: {reason}"),
            ConfigError::Resolve(host, e) => {
                write!(f, "Failed to resolve host '{host}': {e}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
