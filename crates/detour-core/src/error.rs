//! Error types for detour-core
//!
//! Centralized error handling using `thiserror` for ergonomic error definitions.
//! Errors cross the caller-visible byte-stream surface as plain [`std::io::Error`]s,
//! see the `From<Error> for io::Error` impl below.

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::detector::FailureKind;

/// Main error type for detour-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// No path produced a connection before `timeout_to_connect` elapsed
    #[error("Timeout dialing any connection to {addr} after {timeout:?}")]
    DialTimeout {
        /// Destination address
        addr: String,
        /// The timeout that elapsed
        timeout: Duration,
    },

    /// The direct connection landed on a known DNS-hijack address
    #[error("DNS hijacked while dialing {addr} directly")]
    DnsHijacked {
        /// Destination address
        addr: String,
    },

    /// The first bytes read directly match an injected response
    #[error("Response from {addr} is hijacked")]
    FakeResponse {
        /// Destination address
        addr: String,
    },

    /// The detour dial was skipped because the direct path already delivered data
    #[error("No need to dial detour to {addr}, data already received")]
    DetourSkipped {
        /// Destination address
        addr: String,
    },

    /// The connection was closed while the operation was pending
    #[error("Connection to {addr} is closed")]
    Closed {
        /// Destination address
        addr: String,
    },

    /// Every admitted path has been dropped
    #[error("No usable connection to {addr}")]
    NoActivePath {
        /// Destination address
        addr: String,
    },

    /// A write failed on every admitted path
    #[error("Failed to write to any connection to {addr}")]
    WriteFailed {
        /// Destination address
        addr: String,
    },

    /// Network name other than tcp, tcp4 or tcp6
    #[error("Unsupported network: {0}")]
    UnsupportedNetwork(String),

    /// Operation deliberately left out of the connection surface
    #[error("{0} not implemented")]
    NotImplemented(&'static str),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound {
        /// Path to the missing config file
        path: String,
    },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    ConfigValue {
        /// Configuration key
        key: String,
        /// Error message
        message: String,
    },

    /// Whitelist file error
    #[error("Whitelist file error for '{path}': {message}")]
    Whitelist {
        /// Path to the whitelist file
        path: String,
        /// Error message
        message: String,
    },

    /// I/O error wrapper
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a config value error
    pub fn config_value(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigValue {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create a whitelist file error
    pub fn whitelist(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Whitelist {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a closed-connection error
    pub fn closed(addr: impl Into<String>) -> Self {
        Self::Closed { addr: addr.into() }
    }

    /// Classify this error for the interference detector
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Io(e) => FailureKind::of(e),
            Self::DialTimeout { .. } => FailureKind::Timeout,
            _ => FailureKind::Other,
        }
    }

    fn io_kind(&self) -> io::ErrorKind {
        match self {
            Self::DialTimeout { .. } => io::ErrorKind::TimedOut,
            Self::DnsHijacked { .. } => io::ErrorKind::ConnectionRefused,
            Self::FakeResponse { .. } => io::ErrorKind::InvalidData,
            Self::Closed { .. } | Self::NoActivePath { .. } => io::ErrorKind::NotConnected,
            Self::WriteFailed { .. } => io::ErrorKind::BrokenPipe,
            Self::UnsupportedNetwork(_) => io::ErrorKind::InvalidInput,
            Self::NotImplemented(_) => io::ErrorKind::Unsupported,
            Self::Io(e) => e.kind(),
            _ => io::ErrorKind::Other,
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            other => io::Error::new(other.io_kind(), other),
        }
    }
}
