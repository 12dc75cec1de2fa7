//! Host bridge boundary
//!
//! The host owns the accessory registry and its get/set plumbing. Accessories
//! only push values to it and answer its callbacks.

use crate::covering::PositionState;
use crate::error::AccessoryError;

/// Value pushed to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Characteristic {
    CurrentPosition(u8),
    TargetPosition(u8),
    PositionState(PositionState),
    On(bool),
}

/// Host side of an accessory
pub trait HostAccessory: Send + Sync {
    /// Set a characteristic without invoking the host's set handler
    fn update_value(&self, accessory_id: &str, characteristic: Characteristic);
}

/// Completion handed over by the host with a get or set request
///
/// Called exactly once, with either the value or the error.
pub type HostCallback<T> = Box<dyn FnOnce(Result<T, AccessoryError>) + Send>;
