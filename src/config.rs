//! Configuration.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "howler")]
#[command(version = "0.1.0")]
#[command(about = "An event-driven HTTP server core", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:2001)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Idle connection timeout in seconds
    #[arg(short = 't', long)]
    pub timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Idle connection timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Requests served per keep-alive connection before forcing close
    #[serde(default = "default_max_keepalive_requests")]
    pub max_keepalive_requests: u32,
    /// Open connections per worker
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Upper bound on a buffered request head, in bytes
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
    /// Reported-events buffer capacity per worker
    #[serde(default = "default_event_queue_size")]
    pub event_queue_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            timeout_secs: default_timeout_secs(),
            max_keepalive_requests: default_max_keepalive_requests(),
            max_connections: default_max_connections(),
            max_request_size: default_max_request_size(),
            event_queue_size: default_event_queue_size(),
        }
    }
}

/// Plugin selection
#[derive(Debug, Deserialize, Default)]
pub struct PluginsConfig {
    /// Plugin identifiers to load, in order
    #[serde(default)]
    pub load: Vec<String>,
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

fn default_listen() -> String {
    "127.0.0.1:2001".to_string()
}

fn default_timeout_secs() -> u64 {
    15
}

fn default_max_keepalive_requests() -> u32 {
    1000
}

fn default_max_connections() -> usize {
    10000
}

fn default_max_request_size() -> usize {
    32 * 1024
}

fn default_event_queue_size() -> usize {
    256
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub workers: Option<usize>,
    pub timeout_secs: u64,
    pub max_keepalive_requests: u32,
    pub max_connections: usize,
    pub max_request_size: usize,
    pub event_queue_size: usize,
    /// Value of the `Server:` response header.
    pub server_name: String,
    pub plugin_load: Vec<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: default_listen(),
            workers: None,
            timeout_secs: default_timeout_secs(),
            max_keepalive_requests: default_max_keepalive_requests(),
            max_connections: default_max_connections(),
            max_request_size: default_max_request_size(),
            event_queue_size: default_event_queue_size(),
            server_name: server_name(),
            plugin_load: Vec::new(),
            log_level: default_log_level(),
        }
    }
}

fn server_name() -> String {
    format!("howler/{}", env!("CARGO_PKG_VERSION"))
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            workers: cli.workers.or(toml_config.server.workers),
            timeout_secs: cli.timeout.unwrap_or(toml_config.server.timeout_secs),
            max_keepalive_requests: toml_config.server.max_keepalive_requests,
            max_connections: toml_config.server.max_connections,
            max_request_size: toml_config.server.max_request_size,
            event_queue_size: toml_config.server.event_queue_size,
            server_name: server_name(),
            plugin_load: toml_config.plugins.load,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
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
        }
    }
}

impl std::error::Error for ConfigError {}
