//! Error types for the voice-net core

use thiserror::Error;

use crate::connection::InvalidTransition;
use crate::protocol::{ConnectionState, ErrorCode};

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Media session error: {0}")]
    Media(#[from] MediaError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config write error: {0}")]
    ConfigWrite(#[from] toml::ser::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures reported by the underlying real-time media session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("join rejected: {0}")]
    Rejected(String),

    #[error("network failure: {0}")]
    Network(String),

    #[error("device failure: {0}")]
    Device(String),

    #[error("track failure: {0}")]
    Track(String),

    #[error("not joined to a room")]
    NotJoined,
}

/// Transport adapter errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Mic control failed: {0}")]
    MicControl(String),

    #[error("PTT control failed: {0}")]
    PttControl(String),

    #[error("Device change failed: {0}")]
    DeviceChange(String),

    #[error("Routing failed: {0}")]
    Routing(String),

    #[error("Not connected (state {0})")]
    NotConnected(ConnectionState),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

impl TransportError {
    /// The `error` event code this failure is surfaced with, if any
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            TransportError::ConnectionFailed(_) => Some(ErrorCode::ConnectionFailed),
            TransportError::ConnectionLost(_) => Some(ErrorCode::ConnectionLost),
            TransportError::MicControl(_) => Some(ErrorCode::MicControlFailed),
            TransportError::PttControl(_) => Some(ErrorCode::PttControlFailed),
            TransportError::DeviceChange(_) => Some(ErrorCode::DeviceChangeFailed),
            TransportError::Routing(_)
            | TransportError::NotConnected(_)
            | TransportError::InvalidTransition(_) => None,
        }
    }
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
