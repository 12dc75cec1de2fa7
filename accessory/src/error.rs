//! Accessory error types

use ewelink_session::SessionError;
use thiserror::Error;

/// Accessory errors
#[derive(Error, Debug, Clone)]
pub enum AccessoryError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Unknown accessory: {0}")]
    UnknownAccessory(String),

    #[error("Invalid position {0}, expected 0-100")]
    InvalidPosition(u8),

    #[error("Device {device_id} has no channel {channel}")]
    NoSuchChannel { device_id: String, channel: u8 },

    #[error("Device {0} reports a single relay, expected a multi-channel device")]
    NotMultiChannel(String),
}

impl From<AccessoryError> for String {
    fn from(err: AccessoryError) -> String {
        err.to_string()
    }
}

/// Result type for accessory operations
pub type AccessoryResult<T> = Result<T, AccessoryError>;
