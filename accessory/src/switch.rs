//! Switch accessory
//!
//! One accessory per relay channel. Reads go through the session's status
//! cache; pushes update the host directly.

use crate::error::{AccessoryError, AccessoryResult};
use crate::host::{Characteristic, HostAccessory, HostCallback};
use crate::relay::RelayCommander;
use ewelink_session::{DeviceKind, RelayPatch, RelayState};
use std::sync::Arc;

/// A single relay channel exposed as an on/off accessory
pub struct SwitchAccessory {
    device_id: String,
    name: String,
    kind: DeviceKind,
    channel: u8,
    accessory_id: String,
    relays: Arc<dyn RelayCommander>,
    host: Arc<dyn HostAccessory>,
}

impl SwitchAccessory {
    /// Create a switch for `channel` of a device; single-relay devices use channel 0
    pub fn new(
        device_id: &str,
        name: &str,
        kind: DeviceKind,
        channel: u8,
        relays: Arc<dyn RelayCommander>,
        host: Arc<dyn HostAccessory>,
    ) -> AccessoryResult<Self> {
        if channel >= kind.channels() {
            return Err(AccessoryError::NoSuchChannel {
                device_id: device_id.to_string(),
                channel,
            });
        }
        let accessory_id = match kind {
            DeviceKind::Switch => device_id.to_string(),
            DeviceKind::MultiSwitch { .. } => format!("{}SW{}", device_id, channel + 1),
        };
        Ok(Self {
            device_id: device_id.to_string(),
            name: name.to_string(),
            kind,
            channel,
            accessory_id,
            relays,
            host,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Id the host knows this accessory by
    pub fn accessory_id(&self) -> &str {
        &self.accessory_id
    }

    fn channel_state(&self, relays: &RelayState) -> AccessoryResult<bool> {
        relays
            .channel(self.channel)
            .ok_or_else(|| AccessoryError::NoSuchChannel {
                device_id: self.device_id.clone(),
                channel: self.channel,
            })
    }

    /// Read the relay state
    pub async fn get_on(&self) -> AccessoryResult<bool> {
        let relays = self.relays.read_relays(&self.device_id, self.kind).await?;
        self.channel_state(&relays)
    }

    /// Switch the relay; resolves with the state that was sent
    pub async fn set_on(&self, on: bool) -> AccessoryResult<bool> {
        let patch = match self.kind {
            DeviceKind::Switch => RelayPatch::single(on),
            DeviceKind::MultiSwitch { .. } => RelayPatch::outlets([(self.channel, on)]),
        };
        tracing::info!(
            "Switching {} ({}) {}",
            self.name,
            self.accessory_id,
            if on { "on" } else { "off" }
        );
        self.relays.write_relays(&self.device_id, patch).await?;
        Ok(on)
    }

    pub async fn handle_get_on(&self, callback: HostCallback<bool>) {
        callback(self.get_on().await);
    }

    pub async fn handle_set_on(&self, on: bool, callback: HostCallback<bool>) {
        callback(self.set_on(on).await);
    }

    /// Mirror a pushed relay snapshot to the host
    pub fn update_from_push(&self, relays: &RelayState) -> AccessoryResult<()> {
        let on = self.channel_state(relays)?;
        tracing::debug!("Switch {} is now {}", self.accessory_id, if on { "on" } else { "off" });
        self.host
            .update_value(&self.accessory_id, Characteristic::On(on));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ewelink_session::{SessionError, SessionResult};
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    #[derive(Default)]
    struct FakeRelays {
        state: Mutex<Option<RelayState>>,
        writes: Mutex<Vec<RelayPatch>>,
    }

    #[async_trait]
    impl RelayCommander for FakeRelays {
        async fn read_relays(&self, device_id: &str, _kind: DeviceKind) -> SessionResult<RelayState> {
            self.state
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| SessionError::Remote {
                    code: 504,
                    message: format!("{} offline", device_id),
                })
        }

        async fn write_relays(&self, _device_id: &str, patch: RelayPatch) -> SessionResult<()> {
            self.writes.lock().unwrap().push(patch);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeHost {
        values: Mutex<Vec<(String, Characteristic)>>,
    }

    impl HostAccessory for FakeHost {
        fn update_value(&self, accessory_id: &str, characteristic: Characteristic) {
            self.values
                .lock()
                .unwrap()
                .push((accessory_id.to_string(), characteristic));
        }
    }

    #[tokio::test]
    async fn test_multi_channel_switch() {
        let relays = Arc::new(FakeRelays::default());
        let host = Arc::new(FakeHost::default());
        *relays.state.lock().unwrap() = Some(RelayState::Multi(vec![false, true, false, false]));

        let switch = SwitchAccessory::new(
            "1000abc123",
            "Desk lamp",
            DeviceKind::MultiSwitch { channels: 4 },
            1,
            relays.clone(),
            host.clone(),
        )
        .unwrap();
        assert_eq!(switch.accessory_id(), "1000abc123SW2");
        assert!(switch.get_on().await.unwrap());

        assert!(!switch.set_on(false).await.unwrap());
        assert_eq!(
            relays.writes.lock().unwrap().clone(),
            vec![RelayPatch::outlets([(1, false)])]
        );

        switch
            .update_from_push(&RelayState::Multi(vec![true, false, false, false]))
            .unwrap();
        assert_eq!(
            host.values.lock().unwrap().clone(),
            vec![("1000abc123SW2".to_string(), Characteristic::On(false))]
        );
    }

    #[tokio::test]
    async fn test_single_switch_callbacks() {
        let relays = Arc::new(FakeRelays::default());
        let host = Arc::new(FakeHost::default());
        let switch = SwitchAccessory::new(
            "1000abc124",
            "Fan",
            DeviceKind::Switch,
            0,
            relays.clone(),
            host,
        )
        .unwrap();
        assert_eq!(switch.accessory_id(), "1000abc124");

        // Offline device surfaces as an error value
        let (tx, rx) = oneshot::channel();
        switch
            .handle_get_on(Box::new(move |result| {
                let _ = tx.send(result);
            }))
            .await;
        assert!(matches!(
            rx.await.unwrap(),
            Err(AccessoryError::Session(SessionError::Remote { code: 504, .. }))
        ));

        let (tx, rx) = oneshot::channel();
        switch
            .handle_set_on(true, Box::new(move |result| {
                let _ = tx.send(result);
            }))
            .await;
        assert!(rx.await.unwrap().unwrap());
        assert_eq!(relays.writes.lock().unwrap().clone(), vec![RelayPatch::single(true)]);
    }

    #[test]
    fn test_channel_out_of_range() {
        let result = SwitchAccessory::new(
            "1000abc125",
            "Strip",
            DeviceKind::MultiSwitch { channels: 2 },
            2,
            Arc::new(FakeRelays::default()),
            Arc::new(FakeHost::default()),
        );
        assert!(matches!(
            result,
            Err(AccessoryError::NoSuchChannel { channel: 2, .. })
        ));
    }
}
