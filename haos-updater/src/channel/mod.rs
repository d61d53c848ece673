//! MQTT update entity and remote command channel
//!
//! Lifecycle: `Disabled` (no bus or no broker) or `Announcing` -> `Listening`.
//! A failed publish drops the channel to `Disabled` for the rest of the
//! process; every later publish is a silent no-op.

pub mod broker;
pub mod mqtt;

use crate::error::{ChannelError, PipelineError};
use crate::slot::SlotReader;
use crate::version::Version;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub const COMMAND_TOPIC: &str = "umdu/haos_updater/cmd";
pub const STATE_TOPIC: &str = "umdu/haos_updater/state";
pub const AVAILABILITY_TOPIC: &str = "umdu/haos_updater/availability";
pub const DISCOVERY_TOPIC: &str = "homeassistant/update/umdu_haos_k1/config";

pub const CMD_INSTALL: &str = "install";
pub const CMD_CLEAR: &str = "clear";

/// Minimal publish/subscribe surface of the bus client
#[async_trait]
pub trait BusClient: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), String>;
    async fn subscribe(&self, topic: &str) -> Result<(), String>;
}

/// Receiver of remote install requests
#[async_trait]
pub trait InstallHandler: Send + Sync {
    async fn install_version(&self, version: Version) -> Result<(), PipelineError>;
}

/// Inbound traffic from the bus connection task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// (Re)connected to the broker; the broker may hold a stale `offline`
    Connected,
    Command(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disabled,
    Announcing,
    Listening,
}

/// Published status snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateState {
    pub installed_version: Version,
    pub latest_version: Version,
}

#[derive(Debug, Serialize)]
struct DiscoveryConfig<'a> {
    name: &'a str,
    unique_id: &'a str,
    state_topic: &'a str,
    command_topic: &'a str,
    payload_install: &'a str,
    availability_topic: &'a str,
    device_class: &'a str,
    platform: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Installed(String),
    Cleared,
    Ignored,
}

#[derive(Clone)]
pub struct CommandChannel {
    client: Option<Arc<dyn BusClient>>,
    state: Arc<Mutex<ChannelState>>,
    entity_active: Arc<AtomicBool>,
}

impl CommandChannel {
    pub fn disabled() -> Self {
        Self {
            client: None,
            state: Arc::new(Mutex::new(ChannelState::Disabled)),
            entity_active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn new(client: Arc<dyn BusClient>) -> Self {
        Self {
            client: Some(client),
            state: Arc::new(Mutex::new(ChannelState::Announcing)),
            entity_active: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    fn disable(&self, reason: &str) {
        let mut state = self.state.lock();
        if *state != ChannelState::Disabled {
            warn!("MQTT channel disabled: {}", reason);
            *state = ChannelState::Disabled;
        }
    }

    /// Retained publish; a failure disables the channel for good
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ChannelError> {
        let Some(client) = &self.client else {
            return Err(ChannelError::Disabled);
        };
        if self.state() == ChannelState::Disabled {
            return Err(ChannelError::Disabled);
        }

        debug!("MQTT publish {} ({} bytes)", topic, payload.len());
        client.publish(topic, payload, true).await.map_err(|reason| {
            self.disable(&reason);
            ChannelError::Publish {
                topic: topic.to_string(),
                reason,
            }
        })
    }

    /// Announce the update entity and subscribe to commands
    pub async fn announce(&self) -> Result<(), ChannelError> {
        let Some(client) = &self.client else {
            return Err(ChannelError::Disabled);
        };

        self.publish_discovery().await?;
        self.publish(AVAILABILITY_TOPIC, b"online".to_vec()).await?;

        if let Err(reason) = client.subscribe(COMMAND_TOPIC).await {
            self.disable(&reason);
            return Err(ChannelError::Subscribe {
                topic: COMMAND_TOPIC.to_string(),
                reason,
            });
        }

        *self.state.lock() = ChannelState::Listening;
        info!("MQTT update entity announced, listening on {}", COMMAND_TOPIC);
        Ok(())
    }

    async fn publish_discovery(&self) -> Result<(), ChannelError> {
        if !self.entity_active.load(Ordering::SeqCst) {
            return Ok(());
        }
        let config = DiscoveryConfig {
            name: "Home Assistant OS for UMDU K1",
            unique_id: "umdu_haos_k1_os",
            state_topic: STATE_TOPIC,
            command_topic: COMMAND_TOPIC,
            payload_install: CMD_INSTALL,
            availability_topic: AVAILABILITY_TOPIC,
            device_class: "firmware",
            platform: "update",
        };
        let payload = serde_json::to_vec(&config).unwrap_or_default();
        self.publish(DISCOVERY_TOPIC, payload).await
    }

    /// Publish the status snapshot; no-op once disabled
    pub async fn publish_state(&self, state: &UpdateState) {
        if self.state() == ChannelState::Disabled {
            return;
        }
        match serde_json::to_vec(state) {
            Ok(payload) => {
                if let Err(e) = self.publish(STATE_TOPIC, payload).await {
                    debug!("State not published: {}", e);
                }
            }
            Err(e) => error!("Failed to serialize update state: {}", e),
        }
    }

    /// Remove the update entity from the hub after a successful install
    pub async fn deactivate_entity(&self) {
        if self.state() == ChannelState::Disabled {
            return;
        }
        self.entity_active.store(false, Ordering::SeqCst);
        if let Err(e) = self.publish(DISCOVERY_TOPIC, Vec::new()).await {
            debug!("Entity not deactivated: {}", e);
        }
    }

    async fn clear_retained(&self) -> Result<(), ChannelError> {
        for topic in [STATE_TOPIC, AVAILABILITY_TOPIC] {
            info!("MQTT: clearing retained message on {}", topic);
            self.publish(topic, Vec::new()).await?;
        }
        self.publish_discovery().await
    }

    /// Dispatch one inbound command payload
    pub async fn handle_command(
        &self,
        payload: &str,
        slot: &SlotReader,
        handler: &dyn InstallHandler,
    ) -> Result<CommandOutcome, ChannelError> {
        match payload.trim() {
            CMD_INSTALL => {
                let Some(version) = slot.latest() else {
                    error!("Install command received but no available version is known yet");
                    return Err(ChannelError::NoPendingVersion);
                };
                info!("MQTT: install command for version {}", version);
                let label = version.to_string();
                handler
                    .install_version(version)
                    .await
                    .map_err(|source| ChannelError::Install {
                        version: label.clone(),
                        source,
                    })?;
                Ok(CommandOutcome::Installed(label))
            }
            CMD_CLEAR => {
                self.clear_retained().await?;
                Ok(CommandOutcome::Cleared)
            }
            other => {
                warn!("MQTT: unrecognized command {:?}", other);
                Ok(CommandOutcome::Ignored)
            }
        }
    }

    /// Serve inbound events until the bus connection task goes away. Every
    /// reconnect re-announces the entity and its availability.
    pub async fn listen(
        self,
        mut inbound: mpsc::Receiver<BusEvent>,
        slot: SlotReader,
        handler: Arc<dyn InstallHandler>,
    ) {
        while let Some(event) = inbound.recv().await {
            match event {
                BusEvent::Connected => {
                    if let Err(e) = self.announce().await {
                        warn!("Re-announce after reconnect failed: {}", e);
                    }
                }
                BusEvent::Command(payload) => {
                    if let Err(e) = self.handle_command(&payload, &slot, handler.as_ref()).await {
                        warn!("Command {:?} not handled: {}", payload, e);
                    }
                }
            }
        }
        debug!("MQTT command stream closed");
    }
}
