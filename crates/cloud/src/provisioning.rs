//! Gateway and device secret registry.

use std::collections::HashMap;

use uuid::Uuid;

/// Shared secret that lets an unknown gateway auto-register at the ingest
/// boundary.
pub const GATEWAY_PROVISIONING_SECRET: &str = "gateway-secret";

#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub secret: String,
    pub gateway_id: String,
    pub status: String,
}

pub struct ProvisioningRegistry {
    gateways: HashMap<String, String>,
    devices: HashMap<String, DeviceRecord>,
}

impl ProvisioningRegistry {
    pub fn new() -> Self {
        let mut gateways = HashMap::new();
        // The permanent floor gateway is provisioned out of the box.
        gateways.insert(
            "gateway-01".to_string(),
            GATEWAY_PROVISIONING_SECRET.to_string(),
        );
        Self {
            gateways,
            devices: HashMap::new(),
        }
    }

    pub fn validate_gateway(&self, gateway_id: &str, secret: &str) -> bool {
        self.gateways.get(gateway_id).map(String::as_str) == Some(secret)
    }

    pub fn register_gateway(&mut self, gateway_id: &str, secret: &str) {
        self.gateways
            .insert(gateway_id.to_string(), secret.to_string());
    }

    /// Mint a device identity bound to the requesting gateway.
    pub fn register_device(&mut self, gateway_id: &str) -> (String, String) {
        let device_id = Uuid::new_v4().to_string();
        let device_secret = Uuid::new_v4().to_string();

        self.devices.insert(
            device_id.clone(),
            DeviceRecord {
                secret: device_secret.clone(),
                gateway_id: gateway_id.to_string(),
                status: "active".to_string(),
            },
        );

        (device_id, device_secret)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }
}

impl Default for ProvisioningRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
