//! Vendor session wire protocol
//!
//! Outbound requests are JSON objects tagged by `action` and carrying a
//! `sequence` string. Inbound frames are JSON except the bare `pong`
//! heartbeat reply. Relay parameters are decoded per [`DeviceKind`], never by
//! guessing from which fields happen to be present.

use crate::error::{SessionError, SessionResult};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Protocol version announced at login
pub const PROTOCOL_VERSION: u32 = 8;

/// Outbound heartbeat payload
pub const HEARTBEAT_PING: &str = "ping";

/// Inbound heartbeat reply, not JSON
pub const HEARTBEAT_PONG: &str = "pong";

/// Close code for an intentional, normal close
pub const NORMAL_CLOSE_CODE: u16 = 1000;

/// Close code reported when the peer vanished without a close frame
pub const ABNORMAL_CLOSE_CODE: u16 = 1006;

/// User agent for requests issued by this client
pub const APP_USER_AGENT: &str = "app";

/// Relay on/off value as it appears on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchState {
    On,
    Off,
}

impl SwitchState {
    pub fn is_on(self) -> bool {
        self == SwitchState::On
    }
}

impl From<bool> for SwitchState {
    fn from(on: bool) -> Self {
        if on {
            SwitchState::On
        } else {
            SwitchState::Off
        }
    }
}

/// One channel entry of a multi-channel relay patch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutletSwitch {
    pub switch: SwitchState,
    pub outlet: u8,
}

/// Relay-state patch carried opaquely by the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum RelayPatch {
    /// Single-channel switch: `{"switch": "on"}`
    Single { switch: SwitchState },
    /// Multi-channel device: `{"switches": [{"switch": "on", "outlet": 0}]}`
    Outlets { switches: Vec<OutletSwitch> },
}

impl RelayPatch {
    /// Patch for a single-channel switch
    pub fn single(on: bool) -> Self {
        RelayPatch::Single {
            switch: on.into(),
        }
    }

    /// Patch for a set of outlets of a multi-channel device
    pub fn outlets<I>(outlets: I) -> Self
    where
        I: IntoIterator<Item = (u8, bool)>,
    {
        RelayPatch::Outlets {
            switches: outlets
                .into_iter()
                .map(|(outlet, on)| OutletSwitch {
                    switch: on.into(),
                    outlet,
                })
                .collect(),
        }
    }
}

/// Relay layout of a device, supplied by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DeviceKind {
    /// One relay driven through `switch`
    Switch,
    /// Several relays driven through `switches`
    MultiSwitch { channels: u8 },
}

impl DeviceKind {
    pub fn channels(&self) -> u8 {
        match self {
            DeviceKind::Switch => 1,
            DeviceKind::MultiSwitch { channels } => *channels,
        }
    }
}

/// Decoded relay snapshot of a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayState {
    Single(bool),
    Multi(Vec<bool>),
}

impl RelayState {
    /// All relays off for the given device kind
    pub fn all_off(kind: DeviceKind) -> Self {
        match kind {
            DeviceKind::Switch => RelayState::Single(false),
            DeviceKind::MultiSwitch { channels } => RelayState::Multi(vec![false; channels as usize]),
        }
    }

    /// State of one channel; a single-channel device only has channel 0
    pub fn channel(&self, channel: u8) -> Option<bool> {
        match self {
            RelayState::Single(on) if channel == 0 => Some(*on),
            RelayState::Single(_) => None,
            RelayState::Multi(outlets) => outlets.get(channel as usize).copied(),
        }
    }

    /// Decode a full snapshot from device parameters
    pub fn decode(kind: DeviceKind, device_id: &str, params: &Map<String, Value>) -> SessionResult<Self> {
        let mut state = RelayState::all_off(kind);
        if !state.merge(kind, device_id, params)? {
            return Err(SessionError::invalid_params(
                device_id,
                "no relay parameters present",
            ));
        }
        Ok(state)
    }

    /// Merge a (possibly partial) parameter update into this snapshot
    ///
    /// Returns whether any relay value was present in `params`.
    pub fn merge(&mut self, kind: DeviceKind, device_id: &str, params: &Map<String, Value>) -> SessionResult<bool> {
        match (kind, self) {
            (DeviceKind::Switch, RelayState::Single(on)) => match params.get("switch") {
                Some(value) => {
                    let switch: SwitchState = serde_json::from_value(value.clone())
                        .map_err(|e| SessionError::invalid_params(device_id, e.to_string()))?;
                    *on = switch.is_on();
                    Ok(true)
                }
                None => Ok(false),
            },
            (DeviceKind::MultiSwitch { channels }, RelayState::Multi(outlets)) => {
                let Some(value) = params.get("switches") else {
                    return Ok(false);
                };
                let switches: Vec<OutletSwitch> = serde_json::from_value(value.clone())
                    .map_err(|e| SessionError::invalid_params(device_id, e.to_string()))?;
                outlets.resize(channels as usize, false);
                for entry in switches {
                    // Devices report spare outlets beyond the wired channel count
                    if let Some(slot) = outlets.get_mut(entry.outlet as usize) {
                        *slot = entry.switch.is_on();
                    }
                }
                Ok(true)
            }
            (kind, _) => Err(SessionError::invalid_params(
                device_id,
                format!("relay snapshot does not match device kind {:?}", kind),
            )),
        }
    }
}

/// Outbound request body, tagged by `action`
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action")]
pub enum Action {
    #[serde(rename = "userOnline")]
    UserOnline {
        version: u32,
        ts: i64,
        at: String,
        #[serde(rename = "userAgent")]
        user_agent: String,
        apikey: String,
        appid: String,
        nonce: String,
    },
    #[serde(rename = "query")]
    Query {
        deviceid: String,
        apikey: String,
        #[serde(rename = "userAgent")]
        user_agent: String,
        params: Vec<String>,
        ts: i64,
    },
    #[serde(rename = "update")]
    Update {
        deviceid: String,
        apikey: String,
        #[serde(rename = "selfApikey")]
        self_apikey: String,
        #[serde(rename = "userAgent")]
        user_agent: String,
        params: RelayPatch,
        ts: i64,
    },
}

impl Action {
    /// Wire name of the action
    pub fn name(&self) -> &'static str {
        match self {
            Action::UserOnline { .. } => "userOnline",
            Action::Query { .. } => "query",
            Action::Update { .. } => "update",
        }
    }

    /// Serialize with the correlation `sequence` attached
    pub fn to_frame(&self, sequence: u64) -> SessionResult<String> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.insert("sequence".to_string(), Value::String(sequence.to_string()));
        }
        Ok(value.to_string())
    }
}

/// Heartbeat settings returned by the login response
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatConfig {
    #[serde(default)]
    pub hb: i64,
    #[serde(default)]
    pub hb_interval: Option<u64>,
}

/// Heartbeat interval in seconds, if the login response enables one
pub fn heartbeat_interval(login_response: &Value) -> Option<u64> {
    let config: HeartbeatConfig = serde_json::from_value(login_response.get("config")?.clone()).ok()?;
    if config.hb == 1 {
        config.hb_interval.filter(|secs| *secs > 0)
    } else {
        None
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SequenceField {
    Text(String),
    Number(u64),
}

impl SequenceField {
    fn value(&self) -> Option<u64> {
        match self {
            SequenceField::Text(text) => text.parse().ok(),
            SequenceField::Number(n) => Some(*n),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawInbound {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    deviceid: Option<String>,
    #[serde(default)]
    sequence: Option<SequenceField>,
    #[serde(default)]
    error: Option<i64>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    params: Option<Value>,
}

/// Relay or attribute update pushed by the service for one device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceUpdate {
    pub device_id: String,
    pub params: Map<String, Value>,
}

/// Unsolicited notification
#[derive(Debug, Clone, PartialEq)]
pub enum Push {
    /// `action: "update"` without a pending request
    Device(DeviceUpdate),
    /// `action: "sysmsg"`, typically an online/offline change
    System { device_id: String, online: Option<bool> },
}

/// One decoded JSON frame
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub sequence: Option<u64>,
    pub error: i64,
    pub reason: Option<String>,
    pub body: Value,
    pub push: Option<Push>,
}

impl InboundMessage {
    /// Convert into a request outcome
    pub fn into_result(self) -> SessionResult<Value> {
        if self.error == 0 {
            Ok(self.body)
        } else {
            Err(SessionError::Remote {
                code: self.error,
                message: self.reason.unwrap_or_else(|| "request rejected".to_string()),
            })
        }
    }
}

/// Decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Pong,
    Message(InboundMessage),
}

/// Decode an inbound text frame
pub fn parse_inbound(text: &str) -> SessionResult<Inbound> {
    if text == HEARTBEAT_PONG {
        return Ok(Inbound::Pong);
    }

    let body: Value = serde_json::from_str(text)?;
    let raw: RawInbound = serde_json::from_value(body.clone())?;

    let params = match raw.params {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };

    let push = match (raw.action.as_deref(), raw.deviceid) {
        (Some("update"), Some(device_id)) => Some(Push::Device(DeviceUpdate { device_id, params })),
        (Some("sysmsg"), Some(device_id)) => Some(Push::System {
            device_id,
            online: params.get("online").and_then(Value::as_bool),
        }),
        _ => None,
    };

    Ok(Inbound::Message(InboundMessage {
        sequence: raw.sequence.as_ref().and_then(SequenceField::value),
        error: raw.error.unwrap_or(0),
        reason: raw.reason,
        body,
        push,
    }))
}

/// Random alphanumeric login nonce
pub fn generate_nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}

/// Status snapshot returned by a query
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStatus {
    pub device_id: String,
    pub params: Map<String, Value>,
}

impl DeviceStatus {
    /// Build from a query response body
    pub fn from_response(device_id: &str, body: &Value) -> Self {
        let params = match body.get("params") {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };
        Self {
            device_id: device_id.to_string(),
            params,
        }
    }

    /// Decode the relay snapshot for the given device kind
    pub fn relay_state(&self, kind: DeviceKind) -> SessionResult<RelayState> {
        RelayState::decode(kind, &self.device_id, &self.params)
    }

    /// Online flag, when the service reported one
    pub fn online(&self) -> Option<bool> {
        self.params.get("online").and_then(Value::as_bool)
    }
}
