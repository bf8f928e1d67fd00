//! Error handling for the well simulator
//!
//! One enum for the whole service. Every variant maps onto an [`ErrorKind`]
//! so drivers can log transport failures, illegal transitions and decode
//! problems as distinct categories.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::fsm::{DeviceEvent, DeviceState};

/// Well simulator error type
#[derive(Error, Debug, Clone)]
pub enum WellSimError {
    /// Connection establishment failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// Read or write on an established connection failed
    #[error("IO error: {0}")]
    Io(String),

    /// No reply within the conversation bound
    #[error("Timeout error: no reply within {0:?}")]
    Timeout(Duration),

    /// Event fired against a state with no matching transition
    #[error("Illegal transition: event {event} in state {state}")]
    IllegalTransition {
        event: DeviceEvent,
        state: DeviceState,
    },

    /// Malformed hex fields, undersized or unexpected reply frames
    #[error("Decode error: {0}")]
    Decode(String),

    /// Store read/write failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Telemetry provider failure
    #[error("Telemetry error: {0}")]
    Telemetry(String),

    /// Token provider failure
    #[error("Auth error: {0}")]
    Auth(String),

    /// No card registered for the device's area code
    #[error("No card registered for area code {0}")]
    MissingCard(u64),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for the well simulator
pub type Result<T> = std::result::Result<T, WellSimError>;

/// Coarse error category used in structured logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    IllegalTransition,
    Decode,
    Persistence,
    Collaborator,
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transport => "transport",
            ErrorKind::IllegalTransition => "illegal_transition",
            ErrorKind::Decode => "decode",
            ErrorKind::Persistence => "persistence",
            ErrorKind::Collaborator => "collaborator",
            ErrorKind::Config => "config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl WellSimError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WellSimError::Connection(_) | WellSimError::Io(_) | WellSimError::Timeout(_) => {
                ErrorKind::Transport
            },
            WellSimError::IllegalTransition { .. } => ErrorKind::IllegalTransition,
            WellSimError::Decode(_) => ErrorKind::Decode,
            WellSimError::Storage(_) => ErrorKind::Persistence,
            WellSimError::Telemetry(_) | WellSimError::Auth(_) | WellSimError::MissingCard(_) => {
                ErrorKind::Collaborator
            },
            WellSimError::Config(_) => ErrorKind::Config,
        }
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        WellSimError::Connection(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        WellSimError::Decode(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        WellSimError::Storage(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        WellSimError::Config(msg.into())
    }
}

// ============================================================================
// From implementations for external error types
// ============================================================================

impl From<std::io::Error> for WellSimError {
    fn from(err: std::io::Error) -> Self {
        WellSimError::Io(err.to_string())
    }
}

impl From<sqlx::Error> for WellSimError {
    fn from(err: sqlx::Error) -> Self {
        WellSimError::Storage(err.to_string())
    }
}

impl From<hex::FromHexError> for WellSimError {
    fn from(err: hex::FromHexError) -> Self {
        WellSimError::Decode(format!("invalid hex field: {}", err))
    }
}

impl From<figment::Error> for WellSimError {
    fn from(err: figment::Error) -> Self {
        WellSimError::Config(err.to_string())
    }
}
