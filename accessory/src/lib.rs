//! eWeLink Accessories
//!
//! Host-facing accessories built on an [`ewelink_session::Session`]:
//!
//! - Window coverings emulated on two relays of a multi-channel device, with
//!   the position inferred from elapsed time since the last relay change
//! - Plain switches, one accessory per relay channel
//! - A push dispatcher routing device updates to the right accessory

mod covering;
mod dispatch;
mod error;
mod host;
mod relay;
mod switch;

pub use covering::{
    blind_state, Covering, CoveringSnapshot, MotionController, ObservedState, PositionState,
    Reaction, Transition,
};
pub use dispatch::PushDispatcher;
pub use error::{AccessoryError, AccessoryResult};
pub use host::{Characteristic, HostAccessory, HostCallback};
pub use relay::{covering_patch, RelayCommander};
pub use switch::SwitchAccessory;

use serde::Deserialize;
use std::time::Duration;

/// Covering calibration, measured on the installed motor
///
/// All values are milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct Calibration {
    /// Full travel from 0 to 100 (default: 10 seconds)
    pub duration_up_ms: u64,
    /// Full travel from 100 to 0 (default: 10 seconds)
    pub duration_down_ms: u64,
    /// Extra time when starting upwards from fully closed
    pub duration_bmu_ms: u64,
    /// Extra time when ending downwards at fully closed
    pub duration_bmd_ms: u64,
    /// Extra drive time at 0 and 100
    pub full_overdrive_ms: u64,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            duration_up_ms: 10_000,
            duration_down_ms: 10_000,
            duration_bmu_ms: 0,
            duration_bmd_ms: 0,
            full_overdrive_ms: 0,
        }
    }
}

impl Calibration {
    /// Milliseconds per percentage point moving up
    pub fn percent_duration_up(&self) -> f64 {
        self.duration_up_ms as f64 / 100.0
    }

    /// Milliseconds per percentage point moving down
    pub fn percent_duration_down(&self) -> f64 {
        self.duration_down_ms as f64 / 100.0
    }
}

/// One covering and the two relays driving it
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoveringConfig {
    pub device_id: String,
    pub name: String,
    /// Outlet that moves the covering up (default: 0)
    pub up_outlet: u8,
    /// Outlet that moves the covering down (default: 1)
    pub down_outlet: u8,
    pub calibration: Calibration,
}

impl Default for CoveringConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            name: String::new(),
            up_outlet: 0,
            down_outlet: 1,
            calibration: Calibration::default(),
        }
    }
}

impl CoveringConfig {
    pub fn new(device_id: &str, name: &str, calibration: Calibration) -> Self {
        Self {
            device_id: device_id.to_string(),
            name: name.to_string(),
            calibration,
            ..Self::default()
        }
    }
}

/// Motion controller configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Completion poll period (default: 100ms)
    pub poll_interval_ms: u64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
        }
    }
}

impl MotionConfig {
    /// Get the poll interval as a Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
