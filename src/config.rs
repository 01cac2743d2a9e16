//! Configuration module for the rollcall server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::directory::Role;
use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the rollcall server
#[derive(Parser, Debug)]
#[command(name = "rollcall")]
#[command(author = "rollcall authors")]
#[command(version = "0.1.0")]
#[command(about = "A login-gated command server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:25500)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of live connections (pending + active)
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

    /// Seconds a connection may stay unauthenticated (0 = no limit)
    #[arg(long)]
    pub login_timeout: Option<u64>,

    /// Failed logins before a pending connection is dropped (0 = no limit)
    #[arg(long)]
    pub max_login_attempts: Option<u32>,

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
    pub logging: LoggingConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub users: Vec<UserSeed>,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Upper bound on a single read from a peer
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// Upper bound on bytes buffered for one undecoded frame
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_login_timeout_secs")]
    pub login_timeout_secs: u64,
    #[serde(default = "default_max_login_attempts")]
    pub max_login_attempts: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            read_buffer_size: default_read_buffer_size(),
            max_frame_size: default_max_frame_size(),
            poll_timeout_ms: default_poll_timeout_ms(),
            login_timeout_secs: default_login_timeout_secs(),
            max_login_attempts: default_max_login_attempts(),
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

/// The one administrator account, provisioned at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_email")]
    pub email: String,
    #[serde(default = "default_admin_password")]
    pub password: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            email: default_admin_email(),
            password: default_admin_password(),
        }
    }
}

/// A teacher or student account seeded into the directory at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct UserSeed {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub password: String,
    pub role: Role,
}

fn default_listen() -> String {
    "127.0.0.1:25500".to_string()
}

fn default_max_connections() -> usize {
    1024
}

fn default_read_buffer_size() -> usize {
    1024
}

fn default_max_frame_size() -> usize {
    4 * 1024
}

fn default_poll_timeout_ms() -> u64 {
    10
}

fn default_login_timeout_secs() -> u64 {
    30
}

fn default_max_login_attempts() -> u32 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_admin_email() -> String {
    "admin@admin.com".to_string()
}

fn default_admin_password() -> String {
    "123".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub max_connections: usize,
    pub read_buffer_size: usize,
    pub max_frame_size: usize,
    pub poll_timeout: Duration,
    /// `None` leaves pending connections unbounded in time.
    pub login_timeout: Option<Duration>,
    /// `None` allows unlimited failed logins.
    pub max_login_attempts: Option<u32>,
    pub log_level: String,
    pub admin: AdminConfig,
    pub users: Vec<UserSeed>,
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

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let server = toml_config.server;

        let listen_str = cli.listen.unwrap_or(server.listen);
        let listen = listen_str
            .parse()
            .map_err(|_| ConfigError::InvalidListen(listen_str.clone()))?;

        let login_timeout_secs = cli.login_timeout.unwrap_or(server.login_timeout_secs);
        let max_login_attempts = cli.max_login_attempts.unwrap_or(server.max_login_attempts);

        Ok(Config {
            listen,
            max_connections: cli.max_connections.unwrap_or(server.max_connections),
            read_buffer_size: server.read_buffer_size.max(1),
            max_frame_size: server.max_frame_size.max(server.read_buffer_size),
            poll_timeout: Duration::from_millis(server.poll_timeout_ms),
            login_timeout: (login_timeout_secs > 0).then(|| Duration::from_secs(login_timeout_secs)),
            max_login_attempts: (max_login_attempts > 0).then_some(max_login_attempts),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
            admin: toml_config.admin,
            users: toml_config.users,
        })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid listen address '{0}'")]
    InvalidListen(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        let mut argv = vec!["rollcall"];
        argv.extend_from_slice(args);
        CliArgs::parse_from(argv)
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:25500");
        assert_eq!(config.server.read_buffer_size, 1024);
        assert_eq!(config.server.max_login_attempts, 5);
        assert_eq!(config.admin.email, "admin@admin.com");
        assert!(config.users.is_empty());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:4000"
            max_connections = 16
            login_timeout_secs = 0

            [logging]
            level = "debug"

            [admin]
            email = "root@school.se"
            password = "hunter2"

            [[users]]
            first_name = "Tony"
            last_name = "Stark"
            email = "tony@stark.com"
            password = "ironman"
            role = "teacher"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:4000");
        assert_eq!(config.server.max_connections, 16);
        assert_eq!(config.server.login_timeout_secs, 0);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.admin.password, "hunter2");
        assert_eq!(config.users.len(), 1);
        assert_eq!(config.users[0].role, Role::Teacher);
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:4000"
            max_login_attempts = 3
            "#,
        )
        .unwrap();

        let config =
            Config::merge(cli(&["--listen", "127.0.0.1:5000", "--max-login-attempts", "0"]), file)
                .unwrap();
        assert_eq!(config.listen, "127.0.0.1:5000".parse().unwrap());
        assert_eq!(config.max_login_attempts, None);
        assert_eq!(config.login_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_invalid_listen_address() {
        let err = Config::merge(cli(&["--listen", "not-an-address"]), TomlConfig::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidListen(_)));
    }
}
