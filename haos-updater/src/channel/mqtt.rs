//! rumqttc-backed bus client
//!
//! The event loop runs in its own task and forwards connection events and
//! command payloads to the listener through an mpsc channel. Forwarding never
//! blocks the event loop; events beyond the channel depth are dropped.

use super::broker::ResolvedBroker;
use super::{BusClient, BusEvent, AVAILABILITY_TOPIC, COMMAND_TOPIC};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, Incoming, LastWill, MqttOptions, QoS, Transport};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

const INBOUND_DEPTH: usize = 8;

#[derive(Clone)]
pub struct MqttBus {
    client: AsyncClient,
}

impl MqttBus {
    /// Build the client and spawn its event loop
    pub fn connect(broker: &ResolvedBroker, client_id: &str) -> (Self, mpsc::Receiver<BusEvent>) {
        let mut options = MqttOptions::new(client_id, &broker.host, broker.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_session(true);
        options.set_last_will(LastWill::new(
            AVAILABILITY_TOPIC,
            "offline",
            QoS::AtLeastOnce,
            true,
        ));
        if let Some(username) = &broker.username {
            options.set_credentials(username, broker.password.clone().unwrap_or_default());
        }
        if broker.tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        info!("MQTT: connecting to {}:{}", broker.host, broker.port);
        let (client, mut eventloop) = AsyncClient::new(options, 10);
        let (tx, rx) = mpsc::channel(INBOUND_DEPTH);

        let resubscribe = client.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                        info!("MQTT: connected");
                        if !ack.session_present {
                            if let Err(e) = resubscribe.try_subscribe(COMMAND_TOPIC, QoS::AtLeastOnce) {
                                warn!("MQTT: resubscribe failed: {}", e);
                            }
                        }
                        if !forward(&tx, BusEvent::Connected) {
                            break;
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) if publish.topic == COMMAND_TOPIC => {
                        let payload = String::from_utf8_lossy(&publish.payload).trim().to_string();
                        debug!("MQTT: command {:?}", payload);
                        if !forward(&tx, BusEvent::Command(payload)) {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT connection error: {}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        (Self { client }, rx)
    }
}

/// False once the listener is gone
fn forward(tx: &mpsc::Sender<BusEvent>, event: BusEvent) -> bool {
    match tx.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Full(event)) => {
            warn!("MQTT: listener busy, dropping {:?}", event);
            true
        }
        Err(TrySendError::Closed(_)) => {
            debug!("MQTT: listener gone, stopping event loop");
            false
        }
    }
}

#[async_trait]
impl BusClient for MqttBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), String> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await
            .map_err(|e| e.to_string())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), String> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| e.to_string())
    }
}
