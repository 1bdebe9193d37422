//! Error taxonomy shared across the agent.
//!
//! Each concern has its own enum. Reconnect-governed components (the
//! management channel) absorb their errors into logs and a backoff retry;
//! everything else propagates with `?` to the caller that owns the retry
//! decision.

use std::io;

/// Configuration could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: String, source: io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Device key store failures.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key store I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("key generation failed: {0}")]
    Generate(String),
    #[error("invalid key encoding: {0}")]
    Encoding(String),
    #[error("signing failed: {0}")]
    Sign(String),
}

/// Device identity could not be determined.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("no network interface with a usable MAC address")]
    NoMacAddress,
    #[error("invalid MAC address: {0}")]
    InvalidMac(String),
}

/// Token acquisition failures.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The server rejected the registration (HTTP 401). Not retried here.
    #[error("device unauthorized")]
    Unauthorized,
    /// Transport failure or unexpected response.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Management channel failures; all of them end the current connection.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

/// Shell session failures.
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("failed to start shell process: {0}")]
    Spawn(#[from] io::Error),
    #[error("shell tunnel connection failed: {0}")]
    ConnectionFailed(String),
    #[error("invalid shell request: {0}")]
    InvalidRequest(String),
}

/// Failures that abort a single update attempt.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("payload entry not found in update archive")]
    PayloadNotFound,
    #[error("update archive is corrupt: {0}")]
    ArchiveCorrupt(String),
    #[error("package checksum mismatch (expected {expected}, got {actual})")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("server reported missing device metadata")]
    MissingMetadata,
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("apply engine error: {0}")]
    Engine(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<reqwest::Error> for AuthError {
    fn from(e: reqwest::Error) -> Self {
        AuthError::ConnectionFailed(e.to_string())
    }
}

impl From<reqwest::Error> for UpdateError {
    fn from(e: reqwest::Error) -> Self {
        UpdateError::ConnectionFailed(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ChannelError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ChannelError::ConnectionFailed(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ShellError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ShellError::ConnectionFailed(e.to_string())
    }
}
