//! Session error types
//!
//! Provides structured error types for session and request operations.

use std::time::Duration;
use thiserror::Error;

/// Session client errors
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// The remote endpoint refused the connection
    #[error("Connection refused: {url} - {cause}")]
    ConnectionRefused { url: String, cause: String },

    /// Connection could not be established for another reason
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// No connection is open
    #[error("Not connected")]
    NotConnected,

    /// Connection was torn down while a request was in flight
    #[error("Connection closed while waiting for sequence {sequence}")]
    ConnectionClosed { sequence: u64 },

    /// Outbound channel to the writer task is gone
    #[error("Send channel closed: {0}")]
    ChannelClosed(String),

    /// No response arrived for a request within the configured bound
    #[error("Request '{action}' (sequence {sequence}) timed out after {duration:?}")]
    RequestTimeout {
        action: String,
        sequence: u64,
        duration: Duration,
    },

    /// The service answered with a non-zero error code
    #[error("Remote error {code}: {message}")]
    Remote { code: i64, message: String },

    /// Payload could not be decoded
    #[error("Parse error: {0}")]
    Parse(String),

    /// Device id is not known to the registry
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// Device parameters do not match the device kind
    #[error("Invalid parameters for device {device_id}: {message}")]
    InvalidParams { device_id: String, message: String },
}

impl SessionError {
    /// Create a connection refused error
    pub fn connection_refused(url: impl Into<String>, cause: impl Into<String>) -> Self {
        SessionError::ConnectionRefused {
            url: url.into(),
            cause: cause.into(),
        }
    }

    /// Create an invalid parameters error
    pub fn invalid_params(device_id: impl Into<String>, message: impl Into<String>) -> Self {
        SessionError::InvalidParams {
            device_id: device_id.into(),
            message: message.into(),
        }
    }

    /// Check if this error should be recovered by reconnecting
    pub fn is_reconnectable(&self) -> bool {
        match self {
            SessionError::ConnectionRefused { .. } => true,
            SessionError::ConnectionFailed(_) => true,
            SessionError::ConnectionClosed { .. } => true,
            SessionError::ChannelClosed(_) => true,
            SessionError::NotConnected => false,
            SessionError::RequestTimeout { .. } => false,
            SessionError::Remote { .. } => false,
            SessionError::Parse(_) => false,
            SessionError::UnknownDevice(_) => false,
            SessionError::InvalidParams { .. } => false,
        }
    }

    /// Check if the failure means the socket was not open when sending
    pub fn is_not_open(&self) -> bool {
        matches!(
            self,
            SessionError::NotConnected | SessionError::ChannelClosed(_)
        )
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Parse(err.to_string())
    }
}

impl From<SessionError> for String {
    fn from(err: SessionError) -> String {
        err.to_string()
    }
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;
