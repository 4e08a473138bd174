//! Sensor simulator: publishes signed JSON readings over MQTT at a fixed
//! cadence for local development and load exercises.

mod profile;

use std::env;
use std::time::{Duration, Instant};

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::time::sleep;

/// Well-known provisioning signature accepted by the gateways.
const SIGNATURE: &str = "device-secret";

#[derive(Debug, Serialize)]
struct SensorPayload<'a> {
    #[serde(rename = "deviceId")]
    device_id: &'a str,
    signature: &'a str,
    #[serde(rename = "sensorType")]
    sensor_type: &'a str,
    timestamp: &'a str,
    value: f64,
    unit: &'a str,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── Env config ───────────────────────────────────────────────────
    let device_id = env::var("DEVICE_ID").unwrap_or_else(|_| "sensor-001".to_string());
    let sensor_type = env::var("SENSOR_TYPE").unwrap_or_else(|_| "temperature".to_string());
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "mqtt-broker".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let publish_interval_ms: u64 = env::var("PUBLISH_INTERVAL_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000);

    let Some(spec) = profile::spec_for(&sensor_type) else {
        anyhow::bail!("unsupported sensor type: {sensor_type}");
    };

    // ── MQTT setup ───────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new(format!("iot-sensor-{device_id}"), broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    // ── MQTT event loop task ─────────────────────────────────────────
    let el_device_id = device_id.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    tracing::info!(device = %el_device_id, "sensor connected to mqtt");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!("mqtt error: {e} — retrying");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    // ── Publish loop ─────────────────────────────────────────────────
    let started = Instant::now();
    tracing::info!(
        device = %device_id,
        sensor = %sensor_type,
        topic = spec.topic,
        interval_ms = publish_interval_ms,
        "sensor simulator started"
    );

    loop {
        let value = profile::sample_value(spec, &device_id, started.elapsed());
        let timestamp = OffsetDateTime::now_utc().format(&Rfc3339)?;

        let payload = SensorPayload {
            device_id: &device_id,
            signature: SIGNATURE,
            sensor_type: &sensor_type,
            timestamp: &timestamp,
            value,
            unit: spec.unit,
        };
        let body = serde_json::to_vec(&payload)?;

        match client.publish(spec.topic, QoS::AtLeastOnce, false, body).await {
            Ok(()) => tracing::info!(value, topic = spec.topic, "reading published"),
            Err(e) => tracing::error!("publish error: {e}"),
        }

        sleep(Duration::from_millis(publish_interval_ms)).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_serializes_with_wire_field_names() {
        let payload = SensorPayload {
            device_id: "sensor-001",
            signature: SIGNATURE,
            sensor_type: "temperature",
            timestamp: "2026-07-30T12:00:00Z",
            value: 21.5,
            unit: "°C",
        };
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["deviceId"], "sensor-001");
        assert_eq!(json["signature"], "device-secret");
        assert_eq!(json["sensorType"], "temperature");
        assert_eq!(json["value"], 21.5);
        assert_eq!(json.as_object().unwrap().len(), 6);
    }
}
