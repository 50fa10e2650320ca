//! Error types for the transfer service

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("No files selected")]
    NoFilesSelected,

    #[error("Service is not running")]
    ServiceNotRunning,

    #[error("Another instance is already running the transfer service for account {0}")]
    SessionLockHeld(String),

    #[error("{0}")]
    PlatformUnsupported(String),

    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<mdns_sd::Error> for ServiceError {
    fn from(e: mdns_sd::Error) -> Self {
        ServiceError::Discovery(e.to_string())
    }
}

impl From<quinn::ConnectError> for ServiceError {
    fn from(e: quinn::ConnectError) -> Self {
        ServiceError::Transport(e.to_string())
    }
}

impl From<quinn::ConnectionError> for ServiceError {
    fn from(e: quinn::ConnectionError) -> Self {
        ServiceError::Transport(e.to_string())
    }
}

impl From<quinn::WriteError> for ServiceError {
    fn from(e: quinn::WriteError) -> Self {
        ServiceError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(e: serde_json::Error) -> Self {
        ServiceError::Protocol(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
