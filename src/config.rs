//! Configuration module for the framelog server and load generator.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values. One TOML file can
//! carry the settings of both binaries: `[server]`, `[sink]` and `[logging]`
//! are read by the server, `[load]` and `[logging]` by the load generator.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Default upper bound on a frame payload (1 MiB).
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// How each connection is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// One OS thread per connection, blocking sockets.
    Thread,
    /// One tokio task per connection on a multi-threaded runtime.
    Task,
}

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "framelog")]
#[command(author = "framelog authors")]
#[command(version = "0.1.0")]
#[command(about = "Logs length-prefixed TCP messages until the log reaches a size limit", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Log size, in megabytes, at which the server shuts down
    #[arg(short = 'm', long)]
    pub max_log_mb: Option<u64>,

    /// Path of the append-only message log
    #[arg(short = 'f', long)]
    pub log_path: Option<PathBuf>,

    /// Concurrency strategy for connections
    #[arg(short, long, value_enum)]
    pub runtime: Option<RuntimeType>,

    /// Number of tokio worker threads (task runtime only)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Largest accepted frame payload in bytes
    #[arg(long)]
    pub max_message_bytes: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Command-line arguments for the load generator
#[derive(Parser, Debug, Default)]
#[command(name = "framelog-load")]
#[command(author = "framelog authors")]
#[command(version = "0.1.0")]
#[command(about = "Drives a framelog server with many concurrent connections", long_about = None)]
pub struct LoadArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Server address
    #[arg(short, long)]
    pub server: Option<String>,

    /// Server port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of concurrent connections
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Approximate size of each message in bytes
    #[arg(short = 'b', long)]
    pub payload_bytes: Option<usize>,

    /// Pause between messages on one connection, in milliseconds
    #[arg(short, long)]
    pub delay_ms: Option<u64>,

    /// Concurrency strategy for connections
    #[arg(short, long, value_enum)]
    pub runtime: Option<RuntimeType>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub load: LoadConfigFile,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_runtime")]
    pub runtime: RuntimeType,
    /// Number of tokio worker threads
    pub workers: Option<usize>,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    /// Idle poll interval while waiting for a frame
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// How long shutdown waits for connection workers
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            runtime: default_runtime(),
            workers: None,
            max_message_bytes: default_max_message_bytes(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            drain_grace_ms: default_drain_grace_ms(),
        }
    }
}

/// Message log configuration
#[derive(Debug, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_log_path")]
    pub path: PathBuf,
    #[serde(default = "default_max_mb")]
    pub max_mb: u64,
    /// Exact limit in bytes; wins over `max_mb` when set
    pub max_bytes: Option<u64>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            path: default_log_path(),
            max_mb: default_max_mb(),
            max_bytes: None,
        }
    }
}

/// Load generator configuration
#[derive(Debug, Deserialize)]
pub struct LoadConfigFile {
    #[serde(default = "default_server")]
    pub server: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_load_workers")]
    pub workers: usize,
    #[serde(default = "default_payload_bytes")]
    pub payload_bytes: usize,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default = "default_runtime")]
    pub runtime: RuntimeType,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
}

impl Default for LoadConfigFile {
    fn default() -> Self {
        Self {
            server: default_server(),
            port: default_port(),
            workers: default_load_workers(),
            payload_bytes: default_payload_bytes(),
            delay_ms: 0,
            runtime: default_runtime(),
            max_message_bytes: default_max_message_bytes(),
            reply_timeout_ms: default_reply_timeout_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_server() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_runtime() -> RuntimeType {
    RuntimeType::Thread
}

fn default_max_message_bytes() -> usize {
    DEFAULT_MAX_MESSAGE_BYTES
}

fn default_read_timeout_ms() -> u64 {
    500
}

fn default_write_timeout_ms() -> u64 {
    5000
}

fn default_drain_grace_ms() -> u64 {
    2000
}

fn default_log_path() -> PathBuf {
    PathBuf::from("messages.log")
}

fn default_max_mb() -> u64 {
    10
}

fn default_load_workers() -> usize {
    10
}

fn default_payload_bytes() -> usize {
    256
}

fn default_reply_timeout_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved server configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub max_log_bytes: u64,
    pub log_path: PathBuf,
    pub runtime: RuntimeType,
    pub workers: Option<usize>,
    pub max_message_bytes: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub drain_grace: Duration,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        let server = ServerConfig::default();
        let sink = SinkConfig::default();
        Config {
            host: server.host,
            port: server.port,
            max_log_bytes: sink.max_mb * MIB,
            log_path: sink.path,
            runtime: server.runtime,
            workers: server.workers,
            max_message_bytes: server.max_message_bytes,
            read_timeout: Duration::from_millis(server.read_timeout_ms),
            write_timeout: Duration::from_millis(server.write_timeout_ms),
            drain_grace: Duration::from_millis(server.drain_grace_ms),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they name (CLI takes precedence).
    pub fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = read_toml(cli.config.as_deref())?;
        let TomlConfig {
            server,
            sink,
            logging,
            ..
        } = toml_config;

        let max_log_bytes = match cli.max_log_mb {
            Some(mb) => mb.saturating_mul(MIB),
            None => sink.max_bytes.unwrap_or(sink.max_mb.saturating_mul(MIB)),
        };

        let config = Config {
            host: cli.host.unwrap_or(server.host),
            port: cli.port.unwrap_or(server.port),
            max_log_bytes,
            log_path: cli.log_path.unwrap_or(sink.path),
            runtime: cli.runtime.unwrap_or(server.runtime),
            workers: cli.workers.or(server.workers),
            max_message_bytes: cli.max_message_bytes.unwrap_or(server.max_message_bytes),
            read_timeout: Duration::from_millis(server.read_timeout_ms),
            write_timeout: Duration::from_millis(server.write_timeout_ms),
            drain_grace: Duration::from_millis(server.drain_grace_ms),
            log_level: cli.log_level.unwrap_or(logging.level),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_message_bytes(self.max_message_bytes)?;
        if self.max_log_bytes == 0 {
            return Err(ConfigError::Invalid("max log size must be positive".into()));
        }
        if self.read_timeout.is_zero() || self.write_timeout.is_zero() {
            return Err(ConfigError::Invalid("socket timeouts must be positive".into()));
        }
        if self.log_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("log path must not be empty".into()));
        }
        Ok(())
    }

    /// The `host:port` string the listener binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Final resolved load generator configuration
#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub server: String,
    pub port: u16,
    pub workers: usize,
    pub payload_bytes: usize,
    pub delay: Duration,
    pub runtime: RuntimeType,
    pub max_message_bytes: usize,
    pub reply_timeout: Duration,
    pub log_level: String,
}

impl Default for LoadConfig {
    fn default() -> Self {
        let load = LoadConfigFile::default();
        LoadConfig {
            server: load.server,
            port: load.port,
            workers: load.workers,
            payload_bytes: load.payload_bytes,
            delay: Duration::from_millis(load.delay_ms),
            runtime: load.runtime,
            max_message_bytes: load.max_message_bytes,
            reply_timeout: Duration::from_millis(load.reply_timeout_ms),
            log_level: default_log_level(),
        }
    }
}

impl LoadConfig {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(LoadArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they name (CLI takes precedence).
    pub fn resolve(cli: LoadArgs) -> Result<Self, ConfigError> {
        let TomlConfig { load, logging, .. } = read_toml(cli.config.as_deref())?;

        let config = LoadConfig {
            server: cli.server.unwrap_or(load.server),
            port: cli.port.unwrap_or(load.port),
            workers: cli.workers.unwrap_or(load.workers),
            payload_bytes: cli.payload_bytes.unwrap_or(load.payload_bytes),
            delay: Duration::from_millis(cli.delay_ms.unwrap_or(load.delay_ms)),
            runtime: cli.runtime.unwrap_or(load.runtime),
            max_message_bytes: load.max_message_bytes,
            reply_timeout: Duration::from_millis(load.reply_timeout_ms),
            log_level: cli.log_level.unwrap_or(logging.level),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the generator cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_message_bytes(self.max_message_bytes)?;
        if self.workers == 0 {
            return Err(ConfigError::Invalid("at least one worker is required".into()));
        }
        if self.payload_bytes > self.max_message_bytes {
            return Err(ConfigError::Invalid(format!(
                "payload size {} exceeds max message size {}",
                self.payload_bytes, self.max_message_bytes
            )));
        }
        if self.reply_timeout.is_zero() {
            return Err(ConfigError::Invalid("reply timeout must be positive".into()));
        }
        Ok(())
    }

    /// The `server:port` string workers connect to.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }
}

fn check_message_bytes(max_message_bytes: usize) -> Result<(), ConfigError> {
    if max_message_bytes == 0 || max_message_bytes as u64 > u32::MAX as u64 {
        return Err(ConfigError::Invalid(format!(
            "max message size must be between 1 and {} bytes",
            u32::MAX
        )));
    }
    Ok(())
}

fn read_toml(path: Option<&Path>) -> Result<TomlConfig, ConfigError> {
    let Some(path) = path else {
        return Ok(TomlConfig::default());
    };
    let contents = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
    toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(path.to_path_buf(), e))
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.server.runtime, RuntimeType::Thread);
        assert_eq!(config.server.max_message_bytes, 1024 * 1024);
        assert_eq!(config.server.drain_grace_ms, 2000);
        assert_eq!(config.sink.max_mb, 10);
        assert_eq!(config.load.workers, 10);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 6000
            runtime = "task"
            workers = 4

            [sink]
            path = "/tmp/out.log"
            max_bytes = 200

            [load]
            workers = 20
            payload_bytes = 64
            delay_ms = 5

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 6000);
        assert_eq!(config.server.runtime, RuntimeType::Task);
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.sink.path, PathBuf::from("/tmp/out.log"));
        assert_eq!(config.sink.max_bytes, Some(200));
        assert_eq!(config.load.workers, 20);
        assert_eq!(config.load.payload_bytes, 64);
        assert_eq!(config.load.delay_ms, 5);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_defaults() {
        let cli = CliArgs::parse_from([
            "framelog",
            "--port",
            "7001",
            "--max-log-mb",
            "2",
            "--runtime",
            "task",
            "--log-path",
            "x.log",
        ]);
        let config = Config::resolve(cli).unwrap();
        assert_eq!(config.port, 7001);
        assert_eq!(config.max_log_bytes, 2 * MIB);
        assert_eq!(config.runtime, RuntimeType::Task);
        assert_eq!(config.log_path, PathBuf::from("x.log"));
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_bad_port_is_rejected_by_cli() {
        let result = CliArgs::try_parse_from(["framelog", "--port", "not-a-port"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_config_file() {
        let cli = CliArgs {
            config: Some(PathBuf::from("/definitely/not/here.toml")),
            ..Default::default()
        };
        assert!(matches!(
            Config::resolve(cli),
            Err(ConfigError::FileRead(_, _))
        ));
    }

    #[test]
    fn test_load_config_validation() {
        let config = LoadConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = LoadConfig {
            payload_bytes: 2 * 1024 * 1024,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        assert!(LoadConfig::default().validate().is_ok());
        assert_eq!(LoadConfig::default().server_addr(), "127.0.0.1:5000");
    }

    #[test]
    fn test_zero_log_limit_rejected() {
        let config = Config {
            max_log_bytes: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
