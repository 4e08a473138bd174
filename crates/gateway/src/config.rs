//! Gateway configuration: local defaults, cloud-pushed updates, and TOML
//! bootstrap device seeding.

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::auth::DeviceRegistry;

// ---------------------------------------------------------------------------
// Runtime config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    pub batch_size: usize,
    pub max_wait_seconds: f64,
    /// Cadence (seconds) of the config-refresh + heartbeat ticker.
    pub config_check_interval: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_wait_seconds: 5.0,
            config_check_interval: 30,
        }
    }
}

/// Partial update as returned by `GET /config/{gatewayId}`.  Unknown keys in
/// the cloud document are ignored.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigUpdate {
    pub batch_size: Option<usize>,
    pub max_wait_seconds: Option<f64>,
    pub config_check_interval: Option<u64>,
}

impl GatewayConfig {
    /// Merge a cloud update into the local config.  Returns `true` when the
    /// buffer sizing changed and the buffer must be drained and swapped.
    pub fn merge(&mut self, update: &ConfigUpdate) -> bool {
        let mut sizing_changed = false;

        if let Some(batch_size) = update.batch_size {
            if batch_size != self.batch_size {
                self.batch_size = batch_size;
                sizing_changed = true;
            }
        }
        if let Some(max_wait) = update.max_wait_seconds {
            if max_wait != self.max_wait_seconds {
                self.max_wait_seconds = max_wait;
                sizing_changed = true;
            }
        }
        if let Some(interval) = update.config_check_interval {
            self.config_check_interval = interval;
        }

        sizing_changed
    }
}

// ---------------------------------------------------------------------------
// Bootstrap device seeding
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct DeviceFile {
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Deserialize)]
pub struct DeviceEntry {
    pub device_id: String,
    pub secret: String,
}

/// Read and parse a TOML device file.
pub fn load_devices(path: &str) -> Result<DeviceFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read device file: {path}"))?;
    let file: DeviceFile =
        toml::from_str(&contents).with_context(|| format!("failed to parse device file: {path}"))?;
    Ok(file)
}

/// Register all seeded devices.
pub fn apply_devices(file: &DeviceFile, registry: &mut DeviceRegistry) {
    for d in &file.devices {
        registry.add_device(&d.device_id, &d.secret);
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- merge --------------------------------------------------------------

    #[test]
    fn merge_empty_update_changes_nothing() {
        let mut cfg = GatewayConfig::default();
        assert!(!cfg.merge(&ConfigUpdate::default()));
        assert_eq!(cfg, GatewayConfig::default());
    }

    #[test]
    fn merge_reports_batch_size_change() {
        let mut cfg = GatewayConfig::default();
        let update = ConfigUpdate {
            batch_size: Some(10),
            ..Default::default()
        };
        assert!(cfg.merge(&update));
        assert_eq!(cfg.batch_size, 10);
    }

    #[test]
    fn merge_reports_max_wait_change() {
        let mut cfg = GatewayConfig::default();
        let update = ConfigUpdate {
            max_wait_seconds: Some(1.5),
            ..Default::default()
        };
        assert!(cfg.merge(&update));
        assert_eq!(cfg.max_wait_seconds, 1.5);
    }

    #[test]
    fn merge_same_values_is_not_a_sizing_change() {
        let mut cfg = GatewayConfig::default();
        let update = ConfigUpdate {
            batch_size: Some(cfg.batch_size),
            max_wait_seconds: Some(cfg.max_wait_seconds),
            ..Default::default()
        };
        assert!(!cfg.merge(&update));
    }

    #[test]
    fn merge_interval_alone_does_not_trigger_swap() {
        let mut cfg = GatewayConfig::default();
        let update = ConfigUpdate {
            config_check_interval: Some(60),
            ..Default::default()
        };
        assert!(!cfg.merge(&update));
        assert_eq!(cfg.config_check_interval, 60);
    }

    #[test]
    fn update_deserializes_partial_document() {
        let update: ConfigUpdate =
            serde_json::from_str(r#"{"batch_size": 25, "config_version": "3"}"#).unwrap();
        assert_eq!(update.batch_size, Some(25));
        assert!(update.max_wait_seconds.is_none());
    }

    // -- device file --------------------------------------------------------

    #[test]
    fn parse_device_file() {
        let file: DeviceFile = toml::from_str(
            r#"
[[devices]]
device_id = "sensor-001"
secret = "device-secret"

[[devices]]
device_id = "sensor-002"
secret = "device-secret"
"#,
        )
        .unwrap();
        assert_eq!(file.devices.len(), 2);
        assert_eq!(file.devices[0].device_id, "sensor-001");
    }

    #[test]
    fn parse_empty_device_file() {
        let file: DeviceFile = toml::from_str("").unwrap();
        assert!(file.devices.is_empty());
    }

    #[test]
    fn apply_seeds_registry() {
        let file: DeviceFile = toml::from_str(
            r#"
[[devices]]
device_id = "sensor-001"
secret = "device-secret"
"#,
        )
        .unwrap();
        let mut reg = DeviceRegistry::new();
        apply_devices(&file, &mut reg);
        assert!(reg.validate("sensor-001", "device-secret"));
    }
}
