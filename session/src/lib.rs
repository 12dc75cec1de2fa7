//! eWeLink Session Client
//!
//! Persistent, request-correlated connection to the eWeLink cloud.
//!
//! ## Features
//!
//! - Sequence-correlated requests over one shared connection
//! - Login handshake with heartbeat keep-alive learned from the service
//! - Automatic reconnection on abnormal close, one attempt in flight at a time
//! - TTL cache de-duplicating status reads, invalidated by device pushes
//! - Push notifications fanned out as [`SessionEvent`]s
//! - Relay parameters decoded per device kind

mod cache;
mod error;
mod protocol;
mod registry;
mod session;
mod transport;

pub use cache::{ExpiringCache, ExpiryListener, DEFAULT_CACHE_TTL};
pub use error::{SessionError, SessionResult};
pub use protocol::{
    generate_nonce, heartbeat_interval, parse_inbound, Action, DeviceKind, DeviceStatus,
    DeviceUpdate, Inbound, InboundMessage, OutletSwitch, Push, RelayPatch, RelayState,
    SwitchState, ABNORMAL_CLOSE_CODE, APP_USER_AGENT, HEARTBEAT_PING, HEARTBEAT_PONG,
    NORMAL_CLOSE_CODE, PROTOCOL_VERSION,
};
pub use registry::{DeviceRegistry, MemoryRegistry, RegisteredDevice};
pub use session::{ConnectionState, Session, SessionEvent};
pub use transport::{Connection, Connector, OutboundFrame, TransportEvent, WsConnector};

use serde::Deserialize;
use std::ops::RangeInclusive;
use std::time::Duration;

/// Default heartbeat skew added to the interval announced at login
pub const DEFAULT_HEARTBEAT_SKEW_SECS: u64 = 7;

/// Session configuration
///
/// Credentials come from the (external) login step; every other field has a
/// working default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Account API key returned by login
    pub api_key: String,
    /// Access token returned by login
    pub access_token: String,
    /// Application id registered with the vendor
    pub app_id: String,
    /// How long a status snapshot stays cached (default: 5 seconds)
    pub status_ttl_secs: u64,
    /// Lower bound of the random delay before each request (default: 200ms)
    pub jitter_min_ms: u64,
    /// Upper bound of the random delay before each request (default: 400ms)
    pub jitter_max_ms: u64,
    /// Delay before the single write retry on a closed socket (default: 5 seconds)
    pub write_retry_delay_secs: u64,
    /// Added to the login heartbeat interval; zero falls back to the default (default: 7 seconds)
    pub heartbeat_skew_secs: u64,
    /// Per-request response bound, `None` waits forever (default: 30 seconds)
    pub request_timeout_secs: Option<u64>,
    /// Reconnection behaviour
    pub reconnection: ReconnectionConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            access_token: String::new(),
            app_id: String::new(),
            status_ttl_secs: 5,
            jitter_min_ms: 200,
            jitter_max_ms: 400,
            write_retry_delay_secs: 5,
            heartbeat_skew_secs: DEFAULT_HEARTBEAT_SKEW_SECS,
            request_timeout_secs: Some(30),
            reconnection: ReconnectionConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Create a configuration for the given credentials
    pub fn new(api_key: &str, access_token: &str, app_id: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            access_token: access_token.to_string(),
            app_id: app_id.to_string(),
            ..Self::default()
        }
    }

    /// Get the status TTL as a Duration
    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.status_ttl_secs)
    }

    /// Jitter bounds in milliseconds, tolerant of swapped bounds
    pub fn jitter_range_ms(&self) -> RangeInclusive<u64> {
        let low = self.jitter_min_ms.min(self.jitter_max_ms);
        let high = self.jitter_min_ms.max(self.jitter_max_ms);
        low..=high
    }

    /// Get the write retry delay as a Duration
    pub fn write_retry_delay(&self) -> Duration {
        Duration::from_secs(self.write_retry_delay_secs)
    }

    /// Heartbeat period for an interval announced by the service
    pub fn heartbeat_period(&self, interval_secs: u64) -> Duration {
        let skew = if self.heartbeat_skew_secs == 0 {
            DEFAULT_HEARTBEAT_SKEW_SECS
        } else {
            self.heartbeat_skew_secs
        };
        Duration::from_secs(interval_secs + skew)
    }

    /// Get the request timeout as a Duration
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

/// Reconnection configuration
///
/// Attempts never run out. A multiplier of 1.0 keeps the delay fixed; larger
/// multipliers grow it per attempt up to `max_delay_secs`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectionConfig {
    /// Delay before the first attempt (default: 5 seconds)
    pub base_delay_secs: u64,
    /// Delay cap (default: 60 seconds)
    pub max_delay_secs: u64,
    /// Growth per attempt (default: 1.0, fixed delay)
    pub backoff_multiplier: f64,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: 5,
            max_delay_secs: 60,
            backoff_multiplier: 1.0,
        }
    }
}

impl ReconnectionConfig {
    /// Calculate delay for a given attempt number (1-based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay_secs as f64;
        let max = (self.max_delay_secs.max(self.base_delay_secs)) as f64;
        let multiplier = self.backoff_multiplier.max(1.0);
        let exponent = attempt.saturating_sub(1).min(32) as i32;

        let secs = (base * multiplier.powi(exponent)).min(max);
        Duration::from_secs_f64(secs)
    }
}
