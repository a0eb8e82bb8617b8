//! # Error Types
//!
//! Custom error types for RC Link using `thiserror`.
//!
//! Malformed wire input is never an error: framing faults are absorbed by
//! decoder resynchronization and link loss is a polled steady-state
//! condition. Errors here cover the fallible edges only — configuration,
//! port access, and pulse-input binding on hosts without GPIO.

use thiserror::Error;

/// Main error type for RC Link
#[derive(Debug, Error)]
pub enum RcLinkError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// Serial port errors
    #[error("Serial port error: {0}")]
    Serial(String),

    /// Pulse input (GPIO edge capture) is not available on this host
    #[error("{0} input is not supported by this port provider")]
    Unsupported(&'static str),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for RC Link
pub type Result<T> = std::result::Result<T, RcLinkError>;
