//! MQTT bus adapter.
//!
//! Publishes every state change to `loxone/<id>/state` (retained) and
//! subscribes to `loxone/+/action`. Incoming action messages are routed
//! through the current entity registry and forwarded to the supervisor's
//! command port as ready-shaped control URLs.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use halox_core::{EntityRegistry, Identifier, StateUpdate};

const CLIENT_ID: &str = "halox";
const TOPIC_PREFIX: &str = "loxone";
const ACTION_FILTER: &str = "loxone/+/action";

const MQTT_CHANNEL_CAPACITY: usize = 10;
const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(30);
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);

/// Run the adapter until shutdown or until the state port closes.
///
/// rumqttc reconnects on its own; the action subscription is re-issued
/// on every ConnAck so it survives broker restarts.
pub async fn run(
    host: String,
    port: u16,
    mut state_out: mpsc::Receiver<StateUpdate>,
    command_in: mpsc::Sender<String>,
    registry: watch::Receiver<Arc<EntityRegistry>>,
    cancel: CancellationToken,
) -> Result<(), rumqttc::ClientError> {
    let mut options = MqttOptions::new(CLIENT_ID, host, port);
    options.set_keep_alive(MQTT_KEEP_ALIVE);

    let (client, mut eventloop) = AsyncClient::new(options, MQTT_CHANNEL_CAPACITY);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                info!("MQTT adapter shutting down");
                let _ = client.disconnect().await;
                return Ok(());
            }

            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!(filter = ACTION_FILTER, "MQTT connected, subscribing");
                        client.subscribe(ACTION_FILTER, QoS::AtLeastOnce).await?;
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let registry = registry.borrow().clone();
                        handle_action(&publish.topic, &publish.payload, &registry, &command_in)
                            .await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "MQTT connection error, retrying");
                        tokio::time::sleep(RECONNECT_PAUSE).await;
                    }
                }
            }

            update = state_out.recv() => {
                let Some(update) = update else {
                    info!("state port closed, MQTT adapter stopping");
                    let _ = client.disconnect().await;
                    return Ok(());
                };
                publish_state(&client, update).await;
            }
        }
    }
}

async fn publish_state(client: &AsyncClient, update: StateUpdate) {
    let topic = format!("{TOPIC_PREFIX}/{}/state", update.id);
    debug!(%topic, value = %update.value, "publish");
    if let Err(e) = client
        .publish(topic.clone(), QoS::AtLeastOnce, true, update.value)
        .await
    {
        warn!(error = %e, %topic, "publish failed");
    }
}

/// `loxone/<action-id>/action` → control URL via the registry.
/// Unknown identifiers and unsupported payloads are logged and dropped.
async fn handle_action(
    topic: &str,
    payload: &[u8],
    registry: &EntityRegistry,
    command_in: &mpsc::Sender<String>,
) {
    let Some(raw_id) = action_id_from_topic(topic) else {
        debug!(%topic, "not an action topic");
        return;
    };
    let Ok(id) = raw_id.parse::<Identifier>() else {
        warn!(%topic, "action topic segment is not an identifier");
        return;
    };
    let Some(device) = registry.device_for_action(&id) else {
        warn!(%id, "unknown action identifier");
        return;
    };

    let payload = String::from_utf8_lossy(payload);
    let Some(cmd) = device.switch_command(&payload) else {
        warn!(device = %device.name, %payload, "unsupported action payload");
        return;
    };

    info!(device = %device.name, %payload, "action requested");
    if command_in.send(cmd).await.is_err() {
        warn!("command port closed, dropping action");
    }
}

fn action_id_from_topic(topic: &str) -> Option<&str> {
    let mut parts = topic.split('/');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(TOPIC_PREFIX), Some(id), Some("action"), None) => Some(id),
        _ => None,
    }
}
