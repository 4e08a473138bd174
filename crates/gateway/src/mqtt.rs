//! MQTT ingestor: shared-subscription consumer that decodes payloads and
//! hands them to the worker pool.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::reading::Reading;

/// Topics carrying sensor readings.
const SENSOR_TOPICS: [&str; 3] = [
    "sensors/temperature",
    "sensors/humidity",
    "sensors/pressure",
];

/// Shared-subscription group: the broker load-balances each message across
/// the member gateways, so each reading reaches exactly one of us.
const SHARED_GROUP: &str = "gw";

/// Fixed back-off after a broker connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// A decoded sensor message ready for the per-message pipeline.
pub struct InboundMessage {
    pub signature: Option<String>,
    pub reading: Reading,
}

#[derive(Deserialize)]
struct Envelope {
    signature: Option<String>,
    #[serde(flatten)]
    reading: Reading,
}

/// Decode a publish into an inbound message, augmenting it with its topic.
/// The signature is split off here and never re-serialized downstream.
pub(crate) fn parse_payload(
    topic: &str,
    payload: &[u8],
) -> Result<InboundMessage, serde_json::Error> {
    let envelope: Envelope = serde_json::from_slice(payload)?;
    let mut reading = envelope.reading;
    reading.topic = Some(topic.to_string());
    Ok(InboundMessage {
        signature: envelope.signature,
        reading,
    })
}

/// Run the MQTT event loop until shutdown.  Connection loss is recovered by
/// indefinite reconnect with a fixed back-off; subscriptions are re-issued on
/// every ConnAck.
pub async fn run(
    gateway_id: &str,
    host: &str,
    port: u16,
    worker_tx: mpsc::Sender<InboundMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut options = MqttOptions::new(format!("iot-gateway-{gateway_id}"), host, port);
    options.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(options, 64);

    loop {
        tokio::select! {
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(gateway = %gateway_id, "mqtt connected");
                    for topic in SENSOR_TOPICS {
                        let filter = format!("$share/{SHARED_GROUP}/{topic}");
                        if let Err(e) = client.subscribe(&filter, QoS::AtLeastOnce).await {
                            warn!(topic = %filter, "subscribe failed: {e}");
                        }
                    }
                }

                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    match parse_payload(&publish.topic, &publish.payload) {
                        Ok(msg) => {
                            // try_send keeps the ingest path bounded; a full
                            // worker queue sheds load instead of buffering
                            // without limit.
                            if worker_tx.try_send(msg).is_err() {
                                warn!(topic = %publish.topic, "worker queue full — dropping message");
                            }
                        }
                        Err(e) => {
                            warn!(topic = %publish.topic, "invalid json — dropping message: {e}");
                        }
                    }
                }

                Ok(_) => {}

                Err(e) => {
                    warn!("mqtt error: {e} — reconnecting in {}s", RECONNECT_DELAY.as_secs());
                    tokio::select! {
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            },

            _ = shutdown.changed() => break,
        }
    }

    info!(gateway = %gateway_id, "mqtt ingestor stopped");
}

// ===========================================================================
// Tests
// ===========================================================================
