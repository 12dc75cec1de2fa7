//! Motion controller
//!
//! Owns every covering, keyed by device id. Relay commands for one covering
//! are serialized by its command lock, so transitions apply in the order they
//! were observed. The motion model sits behind a separate lock that is only
//! held for synchronous updates, so reads never wait on a relay command.

use super::model::{
    blind_state, Covering, CoveringSnapshot, PositionState, Reaction, Transition,
};
use crate::error::{AccessoryError, AccessoryResult};
use crate::host::{Characteristic, HostAccessory, HostCallback};
use crate::relay::{covering_patch, RelayCommander};
use crate::{CoveringConfig, MotionConfig};
use ewelink_session::RelayState;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{interval, Instant};

struct CoveringHandle {
    config: CoveringConfig,
    command: Mutex<()>,
    covering: std::sync::Mutex<Covering>,
}

impl CoveringHandle {
    fn device_id(&self) -> &str {
        &self.config.device_id
    }

    fn with_covering<T>(&self, f: impl FnOnce(&mut Covering) -> T) -> T {
        let mut covering = self.covering.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut covering)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Watch {
    Superseded,
    Pending,
    Due,
}

fn watch(covering: &Covering, generation: u64) -> Watch {
    if covering.generation() != generation {
        Watch::Superseded
    } else if covering.is_due(Instant::now()) {
        Watch::Due
    } else {
        Watch::Pending
    }
}

/// Drives emulated window coverings
#[derive(Clone)]
pub struct MotionController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    config: MotionConfig,
    relays: Arc<dyn RelayCommander>,
    host: Arc<dyn HostAccessory>,
    coverings: RwLock<HashMap<String, Arc<CoveringHandle>>>,
}

impl MotionController {
    pub fn new(
        config: MotionConfig,
        relays: Arc<dyn RelayCommander>,
        host: Arc<dyn HostAccessory>,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                config,
                relays,
                host,
                coverings: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register a covering, stopped at `position`
    pub async fn add_covering(&self, config: CoveringConfig, position: u8) {
        tracing::info!(
            "Adding covering '{}' on {} (up outlet {}, down outlet {})",
            config.name,
            config.device_id,
            config.up_outlet,
            config.down_outlet
        );
        let handle = Arc::new(CoveringHandle {
            command: Mutex::new(()),
            covering: std::sync::Mutex::new(Covering::new(
                config.calibration,
                position,
                Instant::now(),
            )),
            config,
        });
        self.inner
            .coverings
            .write()
            .await
            .insert(handle.config.device_id.clone(), handle);
    }

    pub async fn has_covering(&self, device_id: &str) -> bool {
        self.inner.coverings.read().await.contains_key(device_id)
    }

    /// Current view of a covering
    pub async fn snapshot(&self, device_id: &str) -> AccessoryResult<CoveringSnapshot> {
        let handle = self.inner.handle(device_id).await?;
        Ok(handle.with_covering(|covering| covering.snapshot(Instant::now())))
    }

    /// Live position estimate
    pub async fn current_position(&self, device_id: &str) -> AccessoryResult<u8> {
        Ok(self.snapshot(device_id).await?.current_position)
    }

    pub async fn target_position(&self, device_id: &str) -> AccessoryResult<u8> {
        Ok(self.snapshot(device_id).await?.target_position)
    }

    pub async fn position_state(&self, device_id: &str) -> AccessoryResult<PositionState> {
        Ok(self.snapshot(device_id).await?.state)
    }

    /// Drive a covering to `position`; returns the target now in effect
    pub async fn set_target_position(&self, device_id: &str, position: u8) -> AccessoryResult<u8> {
        if position > 100 {
            return Err(AccessoryError::InvalidPosition(position));
        }
        let handle = self.inner.handle(device_id).await?;
        let _command = handle.command.lock().await;
        self.inner.drive(&handle, position).await
    }

    /// Fold a pushed relay snapshot into the covering's motion
    pub async fn update_blind_state_characteristic(
        &self,
        device_id: &str,
        relays: &RelayState,
    ) -> AccessoryResult<()> {
        let handle = self.inner.handle(device_id).await?;
        let (up, down) = relay_pair(&handle.config, relays)?;
        let observed = blind_state(up, down);

        let _command = handle.command.lock().await;
        let inner = &self.inner;
        let (reaction, position) = handle.with_covering(|covering| {
            let reaction = covering.reconcile(observed, Instant::now());
            (reaction, covering.last_position())
        });

        match reaction {
            Reaction::None => {}
            Reaction::Fault => {
                tracing::error!(
                    "Covering {} has both relays on, stopping at {}",
                    device_id,
                    position
                );
                inner.switch_off(&handle).await;
                inner.push_position(&handle);
            }
            Reaction::ExternalStop => {
                tracing::info!("Covering {} stopped externally at {}", device_id, position);
                inner.push_position(&handle);
            }
            Reaction::Drive(target) => {
                tracing::info!(
                    "Covering {} started externally, driving to {}",
                    device_id,
                    target
                );
                inner
                    .host
                    .update_value(device_id, Characteristic::TargetPosition(target));
                inner.drive(&handle, target).await?;
            }
        }
        Ok(())
    }

    pub async fn handle_get_current_position(&self, device_id: &str, callback: HostCallback<u8>) {
        callback(self.current_position(device_id).await);
    }

    pub async fn handle_get_target_position(&self, device_id: &str, callback: HostCallback<u8>) {
        callback(self.target_position(device_id).await);
    }

    pub async fn handle_get_position_state(
        &self,
        device_id: &str,
        callback: HostCallback<PositionState>,
    ) {
        callback(self.position_state(device_id).await);
    }

    /// Resolves with the target actually in effect
    pub async fn handle_set_target_position(
        &self,
        device_id: &str,
        position: u8,
        callback: HostCallback<u8>,
    ) {
        callback(self.set_target_position(device_id, position).await);
    }
}

fn relay_pair(config: &CoveringConfig, relays: &RelayState) -> AccessoryResult<(bool, bool)> {
    if let RelayState::Single(_) = relays {
        return Err(AccessoryError::NotMultiChannel(config.device_id.clone()));
    }
    let channel = |outlet: u8| {
        relays.channel(outlet).ok_or_else(|| AccessoryError::NoSuchChannel {
            device_id: config.device_id.clone(),
            channel: outlet,
        })
    };
    Ok((channel(config.up_outlet)?, channel(config.down_outlet)?))
}

impl ControllerInner {
    async fn handle(&self, device_id: &str) -> AccessoryResult<Arc<CoveringHandle>> {
        self.coverings
            .read()
            .await
            .get(device_id)
            .cloned()
            .ok_or_else(|| AccessoryError::UnknownAccessory(device_id.to_string()))
    }

    /// Apply a new target; the caller holds the covering's command lock
    async fn drive(
        self: &Arc<Self>,
        handle: &Arc<CoveringHandle>,
        position: u8,
    ) -> AccessoryResult<u8> {
        let device_id = handle.device_id();
        let now = Instant::now();
        let (previous, transition, snapshot, generation) = handle.with_covering(|covering| {
            let previous = covering.last_position();
            let transition = covering.set_target_position(position, now);
            (previous, transition, covering.snapshot(now), covering.generation())
        });

        match transition {
            Transition::Unchanged => {}
            Transition::Retargeted => {
                tracing::debug!(
                    "Covering {} retargeted to {} (arrives in {:?})",
                    device_id,
                    position,
                    handle
                        .with_covering(|covering| covering.target_at())
                        .saturating_duration_since(now)
                );
            }
            Transition::Started(direction) => {
                tracing::info!(
                    "Covering {} moving {:?} from {} to {}",
                    device_id,
                    direction,
                    previous,
                    position
                );
                // The motor never moved if this fails
                self.send_direction(handle, direction, previous).await?;
                self.host
                    .update_value(device_id, Characteristic::PositionState(direction));
                self.spawn_watcher(handle.clone(), generation);
            }
            Transition::Reversed(direction) => {
                let reversed_at = snapshot.last_position;
                tracing::info!(
                    "Covering {} reversing {:?} at {} towards {}",
                    device_id,
                    direction,
                    reversed_at,
                    position
                );
                self.send_direction(handle, direction, reversed_at).await?;
                self.host
                    .update_value(device_id, Characteristic::CurrentPosition(reversed_at));
                self.host
                    .update_value(device_id, Characteristic::TargetPosition(position));
                self.host
                    .update_value(device_id, Characteristic::PositionState(direction));
                self.spawn_watcher(handle.clone(), generation);
            }
        }

        Ok(handle.with_covering(|covering| covering.target_position()))
    }

    /// Switch the relay pair for a run; a failed command holds the covering at `hold`
    async fn send_direction(
        &self,
        handle: &CoveringHandle,
        direction: PositionState,
        hold: u8,
    ) -> AccessoryResult<()> {
        let (up, down) = direction.relays();
        let patch = covering_patch(handle.config.up_outlet, handle.config.down_outlet, up, down);

        if let Err(e) = self.relays.write_relays(handle.device_id(), patch).await {
            handle.with_covering(|covering| covering.hold_at(hold));
            tracing::error!(
                "Failed to drive covering {} {:?}: {} (holding at {})",
                handle.device_id(),
                direction,
                e,
                hold
            );
            self.push_position(handle);
            return Err(e.into());
        }
        Ok(())
    }

    async fn switch_off(&self, handle: &CoveringHandle) {
        let patch = covering_patch(handle.config.up_outlet, handle.config.down_outlet, false, false);
        if let Err(e) = self.relays.write_relays(handle.device_id(), patch).await {
            tracing::error!("Failed to stop covering {}: {}", handle.device_id(), e);
        }
    }

    fn push_position(&self, handle: &CoveringHandle) {
        let device_id = handle.device_id();
        let snapshot = handle.with_covering(|covering| covering.snapshot(Instant::now()));
        self.host.update_value(
            device_id,
            Characteristic::CurrentPosition(snapshot.last_position),
        );
        self.host.update_value(
            device_id,
            Characteristic::TargetPosition(snapshot.target_position),
        );
        self.host
            .update_value(device_id, Characteristic::PositionState(snapshot.state));
    }

    /// Switch the motor off for a covering that settled at `position`
    async fn set_final_state(&self, handle: &CoveringHandle, position: u8) {
        tracing::info!("Covering {} reached {}", handle.device_id(), position);
        self.switch_off(handle).await;

        let device_id = handle.device_id();
        self.host
            .update_value(device_id, Characteristic::CurrentPosition(position));
        self.host.update_value(
            device_id,
            Characteristic::PositionState(PositionState::Stopped),
        );
    }

    /// Poll until the run with `generation` is due, then settle it
    fn spawn_watcher(self: &Arc<Self>, handle: Arc<CoveringHandle>, generation: u64) {
        let inner = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(inner.config.poll_interval());
            loop {
                ticker.tick().await;
                match handle.with_covering(|covering| watch(covering, generation)) {
                    Watch::Superseded => {
                        tracing::trace!("Watcher for {} superseded", handle.device_id());
                        return;
                    }
                    Watch::Pending => continue,
                    Watch::Due => {}
                }

                // A command may have landed while waiting for the lock
                let _command = handle.command.lock().await;
                let settled = handle.with_covering(|covering| {
                    (watch(covering, generation) == Watch::Due).then(|| {
                        covering.settle();
                        covering.last_position()
                    })
                });
                if let Some(position) = settled {
                    inner.set_final_state(&handle, position).await;
                    return;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Calibration;
    use async_trait::async_trait;
    use ewelink_session::{DeviceKind, RelayPatch, SessionError, SessionResult};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::time::sleep;

    const BLIND: &str = "1000blind1";

    #[derive(Default)]
    struct RecordingRelays {
        writes: std::sync::Mutex<Vec<(String, RelayPatch)>>,
        fail: AtomicBool,
        delay: std::sync::Mutex<Duration>,
    }

    impl RecordingRelays {
        fn writes(&self) -> Vec<RelayPatch> {
            self.writes
                .lock()
                .unwrap()
                .iter()
                .map(|(_, patch)| patch.clone())
                .collect()
        }
    }

    #[async_trait]
    impl RelayCommander for RecordingRelays {
        async fn read_relays(&self, _device_id: &str, kind: DeviceKind) -> SessionResult<RelayState> {
            Ok(RelayState::all_off(kind))
        }

        async fn write_relays(&self, device_id: &str, patch: RelayPatch) -> SessionResult<()> {
            let delay = *self.delay.lock().unwrap();
            if !delay.is_zero() {
                sleep(delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(SessionError::NotConnected);
            }
            self.writes
                .lock()
                .unwrap()
                .push((device_id.to_string(), patch));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingHost {
        values: std::sync::Mutex<Vec<(String, Characteristic)>>,
    }

    impl RecordingHost {
        fn values(&self) -> Vec<Characteristic> {
            self.values
                .lock()
                .unwrap()
                .iter()
                .map(|(_, value)| *value)
                .collect()
        }
    }

    impl HostAccessory for RecordingHost {
        fn update_value(&self, accessory_id: &str, characteristic: Characteristic) {
            self.values
                .lock()
                .unwrap()
                .push((accessory_id.to_string(), characteristic));
        }
    }

    fn up() -> RelayPatch {
        covering_patch(0, 1, true, false)
    }

    fn down() -> RelayPatch {
        covering_patch(0, 1, false, true)
    }

    fn off() -> RelayPatch {
        covering_patch(0, 1, false, false)
    }

    fn relay_state(up: bool, down: bool) -> RelayState {
        RelayState::Multi(vec![up, down, false, false])
    }

    async fn controller() -> (MotionController, Arc<RecordingRelays>, Arc<RecordingHost>) {
        let relays = Arc::new(RecordingRelays::default());
        let host = Arc::new(RecordingHost::default());
        let controller = MotionController::new(MotionConfig::default(), relays.clone(), host.clone());
        controller
            .add_covering(
                CoveringConfig::new(
                    BLIND,
                    "Study blind",
                    Calibration {
                        duration_up_ms: 10_000,
                        duration_down_ms: 10_000,
                        ..Calibration::default()
                    },
                ),
                0,
            )
            .await;
        (controller, relays, host)
    }

    #[tokio::test(start_paused = true)]
    async fn test_extension_sends_no_new_command() {
        let (controller, relays, _host) = controller().await;

        assert_eq!(controller.set_target_position(BLIND, 50).await.unwrap(), 50);
        assert_eq!(relays.writes(), vec![up()]);
        assert_eq!(controller.position_state(BLIND).await.unwrap(), PositionState::MovingUp);

        sleep(Duration::from_millis(1_000)).await;
        assert_eq!(controller.set_target_position(BLIND, 100).await.unwrap(), 100);
        assert_eq!(relays.writes(), vec![up()]);

        // The original 5s run would have ended here
        sleep(Duration::from_millis(4_500)).await;
        assert_eq!(controller.position_state(BLIND).await.unwrap(), PositionState::MovingUp);
        assert_eq!(controller.current_position(BLIND).await.unwrap(), 55);

        sleep(Duration::from_millis(4_600)).await;
        let snapshot = controller.snapshot(BLIND).await.unwrap();
        assert_eq!(snapshot.state, PositionState::Stopped);
        assert_eq!(snapshot.last_position, 100);
        assert_eq!(relays.writes(), vec![up(), off()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reversal_mid_run() {
        let (controller, relays, host) = controller().await;

        controller.set_target_position(BLIND, 100).await.unwrap();
        sleep(Duration::from_millis(8_000)).await;
        controller.set_target_position(BLIND, 0).await.unwrap();

        assert_eq!(relays.writes(), vec![up(), down()]);
        let snapshot = controller.snapshot(BLIND).await.unwrap();
        assert_eq!(snapshot.last_position, 80);
        assert_eq!(snapshot.target_position, 0);
        assert_eq!(snapshot.state, PositionState::MovingDown);

        let values = host.values();
        assert!(values.ends_with(&[
            Characteristic::CurrentPosition(80),
            Characteristic::TargetPosition(0),
            Characteristic::PositionState(PositionState::MovingDown),
        ]));

        sleep(Duration::from_millis(8_200)).await;
        let snapshot = controller.snapshot(BLIND).await.unwrap();
        assert_eq!(snapshot.state, PositionState::Stopped);
        assert_eq!(snapshot.last_position, 0);
        assert_eq!(relays.writes(), vec![up(), down(), off()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_target_settles() {
        let (controller, relays, host) = controller().await;

        // 37 is coprime with 101, so this visits every target once
        for target in (0..=100u32).map(|i| ((i * 37) % 101) as u8) {
            controller.set_target_position(BLIND, target).await.unwrap();
            sleep(Duration::from_millis(10_200)).await;

            let snapshot = controller.snapshot(BLIND).await.unwrap();
            assert_eq!(snapshot.state, PositionState::Stopped, "target {}", target);
            assert_eq!(snapshot.last_position, target);
            assert_eq!(snapshot.target_position, target);
        }

        let writes = relays.writes();
        assert_eq!(writes.last(), Some(&off()));
        assert_eq!(
            host.values().last(),
            Some(&Characteristic::PositionState(PositionState::Stopped))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fault_stops_once() {
        let (controller, relays, host) = controller().await;

        controller.set_target_position(BLIND, 50).await.unwrap();
        sleep(Duration::from_millis(2_000)).await;
        controller
            .update_blind_state_characteristic(BLIND, &relay_state(true, true))
            .await
            .unwrap();

        let snapshot = controller.snapshot(BLIND).await.unwrap();
        assert_eq!(snapshot.state, PositionState::Stopped);
        assert_eq!(snapshot.last_position, 20);
        assert_eq!(relays.writes(), vec![up(), off()]);
        assert!(host.values().ends_with(&[
            Characteristic::CurrentPosition(20),
            Characteristic::TargetPosition(20),
            Characteristic::PositionState(PositionState::Stopped),
        ]));

        // The superseded watcher never fires, and the echo of our stop is a no-op
        controller
            .update_blind_state_characteristic(BLIND, &relay_state(false, false))
            .await
            .unwrap();
        sleep(Duration::from_millis(10_000)).await;
        assert_eq!(relays.writes(), vec![up(), off()]);
        assert_eq!(controller.current_position(BLIND).await.unwrap(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_stop() {
        let (controller, relays, _host) = controller().await;

        controller.set_target_position(BLIND, 100).await.unwrap();
        sleep(Duration::from_millis(3_000)).await;
        controller
            .update_blind_state_characteristic(BLIND, &relay_state(false, false))
            .await
            .unwrap();

        let snapshot = controller.snapshot(BLIND).await.unwrap();
        assert_eq!(snapshot.state, PositionState::Stopped);
        assert_eq!(snapshot.last_position, 30);
        assert_eq!(snapshot.target_position, 30);

        sleep(Duration::from_millis(10_000)).await;
        assert_eq!(relays.writes(), vec![up()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_echo_is_ignored() {
        let (controller, relays, _host) = controller().await;

        controller.set_target_position(BLIND, 40).await.unwrap();
        controller
            .update_blind_state_characteristic(BLIND, &relay_state(true, false))
            .await
            .unwrap();

        assert_eq!(relays.writes(), vec![up()]);
        assert_eq!(controller.position_state(BLIND).await.unwrap(), PositionState::MovingUp);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_direction_change() {
        let (controller, relays, host) = controller().await;

        controller
            .update_blind_state_characteristic(BLIND, &relay_state(true, false))
            .await
            .unwrap();
        assert_eq!(controller.target_position(BLIND).await.unwrap(), 100);
        assert_eq!(controller.position_state(BLIND).await.unwrap(), PositionState::MovingUp);
        assert_eq!(relays.writes(), vec![up()]);
        assert!(host.values().contains(&Characteristic::TargetPosition(100)));

        sleep(Duration::from_millis(5_000)).await;
        controller
            .update_blind_state_characteristic(BLIND, &relay_state(false, true))
            .await
            .unwrap();

        let snapshot = controller.snapshot(BLIND).await.unwrap();
        assert_eq!(snapshot.state, PositionState::MovingDown);
        assert_eq!(snapshot.last_position, 50);
        assert_eq!(snapshot.target_position, 0);
        assert_eq!(relays.writes(), vec![up(), down()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_command_holds_position() {
        let (controller, relays, _host) = controller().await;
        relays.fail.store(true, Ordering::SeqCst);

        let err = controller.set_target_position(BLIND, 60).await.unwrap_err();
        assert!(matches!(err, AccessoryError::Session(SessionError::NotConnected)));

        let snapshot = controller.snapshot(BLIND).await.unwrap();
        assert_eq!(snapshot.state, PositionState::Stopped);
        assert_eq!(snapshot.last_position, 0);
        assert_eq!(snapshot.target_position, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_failed_start_keeps_settled_position() {
        let (controller, relays, host) = controller().await;
        *relays.delay.lock().unwrap() = Duration::from_millis(5_600);
        relays.fail.store(true, Ordering::SeqCst);

        let err = controller.set_target_position(BLIND, 100).await.unwrap_err();
        assert!(matches!(err, AccessoryError::Session(SessionError::NotConnected)));

        let snapshot = controller.snapshot(BLIND).await.unwrap();
        assert_eq!(
            snapshot,
            CoveringSnapshot {
                current_position: 0,
                last_position: 0,
                target_position: 0,
                state: PositionState::Stopped,
            }
        );
        assert!(host.values().ends_with(&[
            Characteristic::CurrentPosition(0),
            Characteristic::TargetPosition(0),
            Characteristic::PositionState(PositionState::Stopped),
        ]));

        sleep(Duration::from_millis(20_000)).await;
        assert!(relays.writes().is_empty());
        assert_eq!(controller.current_position(BLIND).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_failed_reversal_holds_at_reversal_point() {
        let (controller, relays, _host) = controller().await;

        controller.set_target_position(BLIND, 100).await.unwrap();
        sleep(Duration::from_millis(8_000)).await;
        *relays.delay.lock().unwrap() = Duration::from_millis(5_600);
        relays.fail.store(true, Ordering::SeqCst);

        assert!(controller.set_target_position(BLIND, 0).await.is_err());

        let snapshot = controller.snapshot(BLIND).await.unwrap();
        assert_eq!(snapshot.state, PositionState::Stopped);
        assert_eq!(snapshot.last_position, 80);
        assert_eq!(snapshot.target_position, 80);
        assert_eq!(relays.writes(), vec![up()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_do_not_wait_for_relay_commands() {
        let (controller, relays, _host) = controller().await;
        *relays.delay.lock().unwrap() = Duration::from_millis(5_600);

        let command = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.set_target_position(BLIND, 100).await })
        };
        sleep(Duration::from_millis(10)).await;

        let asked = Instant::now();
        assert_eq!(controller.current_position(BLIND).await.unwrap(), 0);
        assert_eq!(controller.target_position(BLIND).await.unwrap(), 100);
        assert_eq!(controller.position_state(BLIND).await.unwrap(), PositionState::MovingUp);
        assert!(asked.elapsed() < Duration::from_millis(100));

        assert_eq!(command.await.unwrap().unwrap(), 100);
        assert_eq!(relays.writes(), vec![up()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_requests() {
        let (controller, _relays, _host) = controller().await;

        assert!(matches!(
            controller.set_target_position(BLIND, 101).await,
            Err(AccessoryError::InvalidPosition(101))
        ));
        assert!(matches!(
            controller.set_target_position("1000ffffff", 10).await,
            Err(AccessoryError::UnknownAccessory(_))
        ));
        assert!(matches!(
            controller
                .update_blind_state_characteristic(BLIND, &RelayState::Single(true))
                .await,
            Err(AccessoryError::NotMultiChannel(_))
        ));
        assert!(matches!(
            controller
                .update_blind_state_characteristic(BLIND, &RelayState::Multi(vec![true]))
                .await,
            Err(AccessoryError::NoSuchChannel { channel: 1, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_callbacks() {
        let (controller, _relays, _host) = controller().await;

        let (tx, rx) = oneshot::channel();
        controller
            .handle_set_target_position(BLIND, 30, Box::new(move |result| {
                let _ = tx.send(result);
            }))
            .await;
        assert_eq!(rx.await.unwrap().unwrap(), 30);

        sleep(Duration::from_millis(1_500)).await;
        let (tx, rx) = oneshot::channel();
        controller
            .handle_get_current_position(BLIND, Box::new(move |result| {
                let _ = tx.send(result);
            }))
            .await;
        assert_eq!(rx.await.unwrap().unwrap(), 15);

        let (tx, rx) = oneshot::channel();
        controller
            .handle_get_position_state("1000ffffff", Box::new(move |result| {
                let _ = tx.send(result);
            }))
            .await;
        assert!(matches!(
            rx.await.unwrap(),
            Err(AccessoryError::UnknownAccessory(_))
        ));
    }
}
