//! Push dispatcher
//!
//! Consumes session events, folds relay pushes into the registry and routes
//! the merged snapshot to whichever accessory owns the device.

use crate::covering::MotionController;
use crate::error::{AccessoryError, AccessoryResult};
use crate::switch::SwitchAccessory;
use ewelink_session::{DeviceRegistry, SessionError, SessionEvent};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// Routes device pushes to accessories
pub struct PushDispatcher {
    registry: Arc<dyn DeviceRegistry>,
    controller: MotionController,
    switches: RwLock<HashMap<String, Vec<Arc<SwitchAccessory>>>>,
}

impl PushDispatcher {
    pub fn new(registry: Arc<dyn DeviceRegistry>, controller: MotionController) -> Self {
        Self {
            registry,
            controller,
            switches: RwLock::new(HashMap::new()),
        }
    }

    pub fn controller(&self) -> &MotionController {
        &self.controller
    }

    /// Route pushes for the switch's device to it
    pub async fn add_switch(&self, switch: Arc<SwitchAccessory>) {
        self.switches
            .write()
            .await
            .entry(switch.device_id().to_string())
            .or_default()
            .push(switch);
    }

    /// Handle one session event
    pub async fn handle_event(&self, event: SessionEvent) -> AccessoryResult<()> {
        match event {
            SessionEvent::Device(update) => {
                let Some(relays) = self.registry.apply_push(&update).await? else {
                    return Ok(());
                };
                let device_id = update.device_id.as_str();

                if self.controller.has_covering(device_id).await {
                    return self
                        .controller
                        .update_blind_state_characteristic(device_id, &relays)
                        .await;
                }

                let switches = self.switches.read().await.get(device_id).cloned();
                match switches {
                    Some(switches) => {
                        for switch in switches {
                            switch.update_from_push(&relays)?;
                        }
                    }
                    None => {
                        tracing::debug!("No accessory for pushed device {}", device_id);
                    }
                }
                Ok(())
            }
            SessionEvent::Online { device_id, online } => {
                tracing::info!(
                    "Device {} went {}",
                    device_id,
                    if online { "online" } else { "offline" }
                );
                self.registry.set_online(&device_id, online).await;
                Ok(())
            }
            SessionEvent::Reconnecting { attempt, delay } => {
                tracing::debug!("Session reconnecting (attempt {}, in {:?})", attempt, delay);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Dispatch events until the session's event channel closes
    pub fn spawn(self: Arc<Self>, mut events: broadcast::Receiver<SessionEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Err(e) = self.handle_event(event).await {
                            match e {
                                AccessoryError::Session(SessionError::UnknownDevice(id)) => {
                                    tracing::debug!("Ignoring push for unregistered device {}", id);
                                }
                                e => tracing::warn!("Failed to apply device push: {}", e),
                            }
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!("Push dispatcher lagged, missed {} events", n);
                    }
                    Err(RecvError::Closed) => {
                        tracing::info!("Session event channel closed, stopping dispatcher");
                        break;
                    }
                }
            }
        })
    }
}
