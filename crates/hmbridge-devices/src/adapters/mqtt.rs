//! MQTT transport over rumqttc.
//!
//! [`MqttTransport`] implements the publish/subscribe seam; the rumqttc event
//! loop is driven separately by [`run_event_loop`], which queues every inbound
//! publish for the [`DeviceManager`] and re-subscribes after each (re)connect.

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use hmbridge_core::{BridgeError, BridgeResult, MqttConfig, PublishOptions, Qos, Transport};

use crate::manager::{DeviceManager, InboundMessage};

/// Pause after an event loop error before polling again.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Request channel capacity between client and event loop.
const REQUEST_CAPACITY: usize = 64;

fn qos(level: Qos) -> QoS {
    match level {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
        Qos::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// MQTT client handle.
#[derive(Clone)]
pub struct MqttTransport {
    client: AsyncClient,
}

impl MqttTransport {
    /// Create the client and its (not yet polled) event loop.
    pub fn connect(config: &MqttConfig) -> (Self, EventLoop) {
        let client_id = config.client_id_or_generate();
        let mut options = MqttOptions::new(&client_id, &config.broker, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive.max(5)));
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user, pass);
        }

        info!(
            "Connecting to MQTT broker {} as {}",
            config.broker_addr(),
            client_id
        );
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        (Self { client }, eventloop)
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(&self, topic: &str, payload: &str, options: PublishOptions) -> BridgeResult<()> {
        self.client
            .publish(topic, qos(options.qos), options.retain, payload.as_bytes().to_vec())
            .await
            .map_err(|e| BridgeError::Transport(format!("publish to {} failed: {}", topic, e)))
    }

    async fn subscribe(&self, topics: &[String]) -> BridgeResult<()> {
        for topic in topics {
            self.client
                .subscribe(topic, QoS::AtLeastOnce)
                .await
                .map_err(|e| BridgeError::Transport(format!("subscribe to {} failed: {}", topic, e)))?;
        }
        Ok(())
    }
}

/// Drive the MQTT event loop forever.
///
/// Inbound publishes go to the manager's inbound worker, which handles them
/// in arrival order while this loop keeps draining the request channel.
pub async fn run_event_loop(mut eventloop: EventLoop, manager: Arc<DeviceManager>) {
    let (inbound, _worker) = manager.spawn_inbound_worker();
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                if inbound.send(InboundMessage::new(publish.topic, payload)).is_err() {
                    warn!("Inbound worker stopped, dropping message");
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("MQTT connection acknowledged");
                let manager = manager.clone();
                tokio::spawn(async move {
                    if let Err(e) = manager.subscribe_all().await {
                        warn!("Re-subscription failed: {}", e);
                    }
                });
            }
            Ok(event) => debug!("MQTT event: {:?}", event),
            Err(e) => {
                warn!("MQTT connection error: {}, retrying in {:?}", e, RECONNECT_DELAY);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_mapping() {
        assert_eq!(qos(Qos::AtMostOnce), QoS::AtMostOnce);
        assert_eq!(qos(Qos::AtLeastOnce), QoS::AtLeastOnce);
        assert_eq!(qos(PublishOptions::command().qos), QoS::AtLeastOnce);
    }

    #[tokio::test]
    async fn test_connect_builds_client() {
        let config = MqttConfig::new("localhost").with_client_id("hmbridge-test");
        let (transport, _eventloop) = MqttTransport::connect(&config);
        // Requests queue on the channel until the event loop is polled.
        transport
            .publish("hm2mqtt/test", "x", PublishOptions::command())
            .await
            .unwrap();
    }
}
