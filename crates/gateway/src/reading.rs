//! Wire model for sensor readings.
//!
//! Readings arrive as schemaless JSON from MQTT and travel unchanged through
//! buffering, replication, and cloud upload.  Known fields are typed; anything
//! else lands in the flattened `extra` bag so re-serialization forwards
//! unknown fields byte-for-byte.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    #[serde(rename = "deviceId", default = "unknown_device")]
    pub device_id: String,
    #[serde(rename = "sensorType", default = "unknown_sensor")]
    pub sensor_type: String,
    /// RFC-3339 timestamp, kept verbatim as produced by the sensor.
    pub timestamp: String,
    pub value: f64,
    pub unit: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Assigned exactly once, at the first gateway that accepts the message.
    #[serde(rename = "messageId", default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(rename = "profileKey", default, skip_serializing_if = "Option::is_none")]
    pub profile_key: Option<String>,
    #[serde(rename = "isAnomaly", default, skip_serializing_if = "Option::is_none")]
    pub is_anomaly: Option<bool>,
    #[serde(rename = "anomalyScore", default, skip_serializing_if = "Option::is_none")]
    pub anomaly_score: Option<f64>,
    #[serde(rename = "modelTimestamp", default, skip_serializing_if = "Option::is_none")]
    pub model_timestamp: Option<i64>,
    /// Origin gateway id, set when this record was pulled from a peer.
    #[serde(
        rename = "_replicated_from",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub replicated_from: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn unknown_device() -> String {
    "unknown-device".to_string()
}

fn unknown_sensor() -> String {
    "unknown-sensor".to_string()
}

/// Profile key for per-sensor-type model lookup: `"{deviceId}::{sensorType}"`.
pub fn profile_key(reading: &Reading) -> String {
    format!("{}::{}", reading.device_id, reading.sensor_type)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sensor_payload() -> &'static str {
        r#"{
            "deviceId": "sensor-001",
            "sensorType": "temperature",
            "timestamp": "2026-07-30T12:00:00Z",
            "value": 21.5,
            "unit": "C"
        }"#
    }

    #[test]
    fn deserialize_sensor_payload() {
        let r: Reading = serde_json::from_str(sensor_payload()).unwrap();
        assert_eq!(r.device_id, "sensor-001");
        assert_eq!(r.sensor_type, "temperature");
        assert_eq!(r.value, 21.5);
        assert!(r.message_id.is_none());
        assert!(r.extra.is_empty());
    }

    #[test]
    fn missing_device_id_falls_back() {
        let json = r#"{"sensorType":"temperature","timestamp":"t","value":1.0,"unit":"C"}"#;
        let r: Reading = serde_json::from_str(json).unwrap();
        assert_eq!(r.device_id, "unknown-device");
    }

    #[test]
    fn missing_value_is_an_error() {
        let json = r#"{"deviceId":"d","sensorType":"s","timestamp":"t","unit":"C"}"#;
        assert!(serde_json::from_str::<Reading>(json).is_err());
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let json = r#"{
            "deviceId": "d",
            "sensorType": "s",
            "timestamp": "t",
            "value": 1.0,
            "unit": "C",
            "firmware": "2.4.1"
        }"#;
        let r: Reading = serde_json::from_str(json).unwrap();
        assert_eq!(r.extra["firmware"], "2.4.1");

        let out = serde_json::to_value(&r).unwrap();
        assert_eq!(out["firmware"], "2.4.1");
    }

    #[test]
    fn optional_fields_omitted_when_absent() {
        let r: Reading = serde_json::from_str(sensor_payload()).unwrap();
        let out = serde_json::to_value(&r).unwrap();
        let obj = out.as_object().unwrap();
        assert!(!obj.contains_key("messageId"));
        assert!(!obj.contains_key("isAnomaly"));
        assert!(!obj.contains_key("_replicated_from"));
    }

    #[test]
    fn scored_fields_serialize_with_wire_names() {
        let mut r: Reading = serde_json::from_str(sensor_payload()).unwrap();
        r.message_id = Some("m-1".to_string());
        r.profile_key = Some(profile_key(&r));
        r.is_anomaly = Some(true);
        r.anomaly_score = Some(4.2);

        let out = serde_json::to_value(&r).unwrap();
        assert_eq!(out["messageId"], "m-1");
        assert_eq!(out["profileKey"], "sensor-001::temperature");
        assert_eq!(out["isAnomaly"], true);
        assert_eq!(out["anomalyScore"], 4.2);
    }

    #[test]
    fn profile_key_format() {
        let r: Reading = serde_json::from_str(sensor_payload()).unwrap();
        assert_eq!(profile_key(&r), "sensor-001::temperature");
    }
}
