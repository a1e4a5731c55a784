//! Server configuration.
//!
//! Configuration is layered, later sources win:
//! - Built-in defaults
//! - The first TOML file found in the search paths
//! - Environment variables (`COURIER_*`, `__` between nested keys)
//!
//! `--config <path>` bypasses the layering and reads one TOML file.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Files searched when no explicit path is given.
const CONFIG_PATHS: [&str; 3] = [
    "courier.toml",
    "/etc/courier/courier.toml",
    "~/.config/courier/courier.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Message store.
    #[serde(default)]
    pub store: StoreConfig,

    /// Cross-process fanout.
    #[serde(default)]
    pub fanout: FanoutConfig,

    /// Identity verification.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Origins allowed by CORS. Empty allows any origin.
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of attached connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database file. `~` is expanded.
    #[serde(default = "default_store_path")]
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutConfig {
    /// Redis URL. Unset means single-instance.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix of the shared channel names.
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,

    /// Envelopes buffered per process before a slow listener lags.
    #[serde(default = "default_fanout_capacity")]
    pub capacity: usize,
}

/// How bearer credentials are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// HS256 JWT with the user id in `sub`.
    Jwt,
    /// The token is the user id. Development only.
    Insecure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_auth_mode")]
    pub mode: AuthMode,

    /// Shared secret for `jwt` mode.
    #[serde(default)]
    pub jwt_secret: Option<String>,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3001
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_store_path() -> String {
    "courier.db".to_string()
}

fn default_channel_prefix() -> String {
    "courier".to_string()
}

fn default_fanout_capacity() -> usize {
    4096
}

fn default_auth_mode() -> AuthMode {
    AuthMode::Jwt
}

fn default_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:5173".to_string(),
        "http://localhost:3000".to_string(),
    ]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
            store: StoreConfig::default(),
            fanout: FanoutConfig::default(),
            auth: AuthConfig::default(),
            cors_origins: default_cors_origins(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            channel_prefix: default_channel_prefix(),
            capacity: default_fanout_capacity(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: default_auth_mode(),
            jwt_secret: None,
        }
    }
}

impl Config {
    /// Load configuration from an explicit file, or from the search paths
    /// layered under the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be parsed.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => Self::from_layers(),
        }
    }

    fn from_layers() -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = CONFIG_PATHS
            .iter()
            .map(|p| shellexpand::tilde(p).into_owned())
            .find(|p| Path::new(p).exists())
        {
            builder = builder.add_source(::config::File::new(&path, ::config::FileFormat::Toml));
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix("COURIER")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("cors_origins")
                .try_parsing(true),
        );

        builder
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Reject combinations the server cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.auth.mode == AuthMode::Jwt && self.auth.jwt_secret.as_deref().map_or(true, str::is_empty) {
            bail!("auth.jwt_secret is required when auth.mode = \"jwt\"");
        }
        if self.heartbeat.timeout_ms <= self.heartbeat.interval_ms {
            bail!("heartbeat.timeout_ms must be greater than heartbeat.interval_ms");
        }
        if self.fanout.capacity == 0 {
            bail!("fanout.capacity must be positive");
        }
        Ok(())
    }

    /// Store path with `~` expanded.
    #[must_use]
    pub fn store_path(&self) -> String {
        shellexpand::tilde(&self.store.path).into_owned()
    }
}
