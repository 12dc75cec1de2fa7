//! Relay command seam
//!
//! Accessories read and write relays through [`RelayCommander`]; the
//! production implementation is the session itself.

use async_trait::async_trait;
use ewelink_session::{DeviceKind, RelayPatch, RelayState, Session, SessionResult};

/// Reads and writes device relays
#[async_trait]
pub trait RelayCommander: Send + Sync {
    /// Current relays of a device, decoded for its kind
    async fn read_relays(&self, device_id: &str, kind: DeviceKind) -> SessionResult<RelayState>;

    /// Send a relay patch to a device
    async fn write_relays(&self, device_id: &str, patch: RelayPatch) -> SessionResult<()>;
}

#[async_trait]
impl RelayCommander for Session {
    async fn read_relays(&self, device_id: &str, kind: DeviceKind) -> SessionResult<RelayState> {
        self.get_status(device_id).await?.relay_state(kind)
    }

    async fn write_relays(&self, device_id: &str, patch: RelayPatch) -> SessionResult<()> {
        self.update_status(device_id, patch).await
    }
}

/// Patch driving a covering's relay pair; both off when neither is set
pub fn covering_patch(up_outlet: u8, down_outlet: u8, up: bool, down: bool) -> RelayPatch {
    RelayPatch::outlets([(up_outlet, up), (down_outlet, down)])
}
