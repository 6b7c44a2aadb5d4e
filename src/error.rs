//! Error taxonomy for provisioning.
//!
//! Transport failures are typed (`TransportError`) so the session never has
//! to inspect error strings. Everything the session reports upward is a
//! `ProvisionError`, which always carries an `ErrorKind` and a message fit
//! for display.

use std::time::Duration;
use thiserror::Error;

/// Failure categories surfaced by the provisioning session.
/// A save command that drops the link is not a failure; it arrives as
/// `TransportError::Disconnected` and the session treats it as the reboot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BleUnsupported,
    ConnectError,
    ServiceNotFound,
    ReadError,
    WriteError,
    ClaimError,
    Validation,
    Backend,
    Config,
    Cancelled,
    InvalidState,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BleUnsupported => "BLE unsupported",
            ErrorKind::ConnectError => "connection error",
            ErrorKind::ServiceNotFound => "service not found",
            ErrorKind::ReadError => "read error",
            ErrorKind::WriteError => "write error",
            ErrorKind::ClaimError => "claim error",
            ErrorKind::Validation => "invalid input",
            ErrorKind::Backend => "backend error",
            ErrorKind::Config => "configuration error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InvalidState => "invalid state",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by a `BleTransport` implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The peripheral dropped the link (or was never connected).
    #[error("peripheral disconnected")]
    Disconnected,
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0} not found")]
    NotFound(String),
    /// No usable BLE adapter on this host.
    #[error("BLE unsupported: {0}")]
    Unsupported(String),
    #[error("{0}")]
    Other(String),
}

/// Errors produced by a `BackendApi` implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Non-success HTTP status, with the response body or a fallback message.
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("request failed: {0}")]
    Request(String),
    #[error("unexpected response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvisionError {
    #[error("Bluetooth LE is not available: {0}")]
    BleUnsupported(String),
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("{0} not found on device")]
    ServiceNotFound(String),
    #[error("Failed to read {what}: {message}")]
    Read { what: &'static str, message: String },
    #[error("Failed to write {what}: {message}")]
    Write { what: &'static str, message: String },
    #[error("Claim failed: {0}")]
    Claim(String),
    #[error("{0}")]
    Validation(String),
    #[error("Backend request failed: {0}")]
    Backend(#[from] BackendError),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Cancelled by user")]
    Cancelled,
    #[error("Operation not allowed in state {0}")]
    InvalidState(String),
}

impl ProvisionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProvisionError::BleUnsupported(_) => ErrorKind::BleUnsupported,
            ProvisionError::Connect(_) => ErrorKind::ConnectError,
            ProvisionError::ServiceNotFound(_) => ErrorKind::ServiceNotFound,
            ProvisionError::Read { .. } => ErrorKind::ReadError,
            ProvisionError::Write { .. } => ErrorKind::WriteError,
            ProvisionError::Claim(_) => ErrorKind::ClaimError,
            ProvisionError::Validation(_) => ErrorKind::Validation,
            ProvisionError::Backend(_) => ErrorKind::Backend,
            ProvisionError::Config(_) => ErrorKind::Config,
            ProvisionError::Cancelled => ErrorKind::Cancelled,
            ProvisionError::InvalidState(_) => ErrorKind::InvalidState,
        }
    }

    /// Translate a transport error raised while connecting or discovering.
    pub fn from_connect(err: TransportError) -> Self {
        match err {
            TransportError::Unsupported(msg) => ProvisionError::BleUnsupported(msg),
            other => ProvisionError::Connect(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProvisionError>;
