//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `FLEETD_SERVER_URL`, `FLEETD_MAC_ADDRESS`,
//!    `FLEETD_KEY_PATH`, `FLEETD_MAX_SHELLS`
//! 2. **Config file** — path via `--config <path>`, or `fleetd.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! url = "https://fleet.example.com"
//!
//! [device]
//! device_type = "rpi4"
//! software_version = "2024.10.1"
//! key_path = "/var/lib/fleetd/device_key.pem"
//!
//! [auth]
//! token_grace_ms = 5000
//!
//! [management]
//! backoff_min_ms = 1000
//! backoff_max_ms = 120000
//! ping_interval_secs = 2
//!
//! [shell]
//! program = "/bin/sh"
//! args = ["-i"]
//! max_sessions = 1
//!
//! [update]
//! package_dir = "/data/ota_package"
//! check_interval_secs = 3600
//! engine_client = "update_engine_client"
//! reboot_command = ["/sbin/reboot"]
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub management: ManagementConfig,
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub update: UpdateConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Management server location.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Base URL of the management server. `http`/`https` select `ws`/`wss`
    /// for the WebSocket endpoints; a bare host is treated as `https`.
    #[serde(default = "default_server_url")]
    pub url: String,
}

/// Device identity and signing key location.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Fixed MAC address. When unset, the first non-loopback interface is used.
    pub mac_address: Option<String>,
    /// Device type reported as `rdfm.hardware.devtype`.
    #[serde(default = "default_device_type")]
    pub device_type: String,
    /// Software version reported as `rdfm.software.version`.
    #[serde(default = "default_software_version")]
    pub software_version: String,
    /// PKCS#8 PEM file holding the device RSA key (generated if missing).
    #[serde(default = "default_key_path")]
    pub key_path: String,
    /// Modulus size used when a new key has to be generated.
    #[serde(default = "default_key_bits")]
    pub key_bits: usize,
}

/// Device authorization settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// How long before the server-reported expiry a token is considered stale.
    #[serde(default = "default_token_grace_ms")]
    pub token_grace_ms: u64,
    /// Timeout for registration and update-check HTTP requests.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Management channel reconnect and keepalive settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagementConfig {
    /// First reconnect delay in milliseconds (default 1 000).
    #[serde(default = "default_backoff_min_ms")]
    pub backoff_min_ms: u64,
    /// Reconnect delay ceiling in milliseconds (default 120 000).
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Seconds between WebSocket pings (default 2).
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Reset the reconnect delay once a connection is established (default false).
    #[serde(default)]
    pub reset_backoff_on_connect: bool,
}

/// Remote shell settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ShellConfig {
    /// Interactive program spawned per session (default `/bin/sh`).
    #[serde(default = "default_shell_program")]
    pub program: String,
    /// Arguments passed to `program` (default `["-i"]`).
    #[serde(default = "default_shell_args")]
    pub args: Vec<String>,
    /// Working directory for shell sessions (default `/`).
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
    /// Maximum concurrent shell sessions (default 1).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

/// OTA update settings.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateConfig {
    /// Run periodic update checks (default true).
    #[serde(default = "default_update_enabled")]
    pub enabled: bool,
    /// Directory where downloaded packages are stored until applied.
    #[serde(default = "default_package_dir")]
    pub package_dir: String,
    /// Seconds between update checks (default 3600).
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    /// Path of the platform `update_engine_client` binary.
    #[serde(default = "default_engine_client")]
    pub engine_client: String,
    /// Command executed to reboot after a successful apply.
    #[serde(default = "default_reboot_command")]
    pub reboot_command: Vec<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_server_url() -> String {
    "http://127.0.0.1:5000".to_string()
}
fn default_device_type() -> String {
    std::env::consts::ARCH.to_string()
}
fn default_software_version() -> String {
    "unknown".to_string()
}
fn default_key_path() -> String {
    "/var/lib/fleetd/device_key.pem".to_string()
}
fn default_key_bits() -> usize {
    4096
}
fn default_token_grace_ms() -> u64 {
    5000
}
fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_backoff_min_ms() -> u64 {
    1000
}
fn default_backoff_max_ms() -> u64 {
    120_000
}
fn default_ping_interval() -> u64 {
    2
}
fn default_shell_program() -> String {
    "/bin/sh".to_string()
}
fn default_shell_args() -> Vec<String> {
    vec!["-i".to_string()]
}
fn default_working_dir() -> String {
    "/".to_string()
}
fn default_max_sessions() -> usize {
    1
}
fn default_update_enabled() -> bool {
    true
}
fn default_package_dir() -> String {
    "/data/ota_package".to_string()
}
fn default_check_interval() -> u64 {
    3600
}
fn default_engine_client() -> String {
    "update_engine_client".to_string()
}
fn default_reboot_command() -> Vec<String> {
    vec!["/sbin/reboot".to_string()]
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: default_server_url(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            mac_address: None,
            device_type: default_device_type(),
            software_version: default_software_version(),
            key_path: default_key_path(),
            key_bits: default_key_bits(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_grace_ms: default_token_grace_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            backoff_min_ms: default_backoff_min_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            ping_interval_secs: default_ping_interval(),
            reset_backoff_on_connect: false,
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            program: default_shell_program(),
            args: default_shell_args(),
            working_dir: default_working_dir(),
            max_sessions: default_max_sessions(),
        }
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            enabled: default_update_enabled(),
            package_dir: default_package_dir(),
            check_interval_secs: default_check_interval(),
            engine_client: default_engine_client(),
            reboot_command: default_reboot_command(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist and parse. Otherwise looks for
    /// `fleetd.toml` in the current directory, falling back to compiled defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(Path::new(p))?,
            None if Path::new("fleetd.toml").exists() => {
                Self::from_file(Path::new("fleetd.toml"))?
            }
            None => Config::default(),
        };

        // Env var overrides
        if let Ok(url) = std::env::var("FLEETD_SERVER_URL") {
            config.server.url = url;
        }
        if let Ok(mac) = std::env::var("FLEETD_MAC_ADDRESS") {
            config.device.mac_address = Some(mac);
        }
        if let Ok(key_path) = std::env::var("FLEETD_KEY_PATH") {
            config.device.key_path = key_path;
        }
        if let Some(max) = std::env::var("FLEETD_MAX_SHELLS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.shell.max_sessions = max;
        }

        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                source,
            },
            other => other,
        })
    }

    /// Parse a TOML document into a configuration (no env overrides).
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })
    }
}
