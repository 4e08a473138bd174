//! Per-device shared-secret authentication with auto-provisioning.

use std::collections::HashMap;

/// Well-known provisioning value that bootstraps new sensors without
/// operator action.
pub const PROVISIONING_SECRET: &str = "device-secret";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Known device, signature matched.
    Accepted,
    /// Unknown device presenting the provisioning secret; now registered.
    AutoRegistered,
    /// Unknown device or bad signature; drop the message.
    Rejected,
}

#[derive(Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, String>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&mut self, device_id: &str, secret: &str) {
        self.devices
            .insert(device_id.to_string(), secret.to_string());
    }

    pub fn validate(&self, device_id: &str, secret: &str) -> bool {
        self.devices.get(device_id).map(String::as_str) == Some(secret)
    }

    /// Apply the acceptance rule to a message's signature.
    pub fn authenticate(&mut self, device_id: &str, signature: Option<&str>) -> AuthOutcome {
        match signature {
            Some(sig) if self.validate(device_id, sig) => AuthOutcome::Accepted,
            Some(PROVISIONING_SECRET) => {
                self.add_device(device_id, PROVISIONING_SECRET);
                AuthOutcome::AutoRegistered
            }
            _ => AuthOutcome::Rejected,
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_is_accepted() {
        let mut reg = DeviceRegistry::new();
        reg.add_device("sensor-001", "s3cret");
        assert_eq!(
            reg.authenticate("sensor-001", Some("s3cret")),
            AuthOutcome::Accepted
        );
    }

    #[test]
    fn unknown_device_with_provisioning_secret_auto_registers() {
        let mut reg = DeviceRegistry::new();
        assert_eq!(
            reg.authenticate("sensor-009", Some(PROVISIONING_SECRET)),
            AuthOutcome::AutoRegistered
        );
        // Subsequent messages authenticate normally.
        assert_eq!(
            reg.authenticate("sensor-009", Some(PROVISIONING_SECRET)),
            AuthOutcome::Accepted
        );
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let mut reg = DeviceRegistry::new();
        reg.add_device("sensor-001", "s3cret");
        assert_eq!(
            reg.authenticate("sensor-001", Some("nope")),
            AuthOutcome::Rejected
        );
    }

    #[test]
    fn missing_signature_is_rejected() {
        let mut reg = DeviceRegistry::new();
        reg.add_device("sensor-001", "s3cret");
        assert_eq!(reg.authenticate("sensor-001", None), AuthOutcome::Rejected);
    }

    #[test]
    fn unknown_device_with_random_secret_is_rejected() {
        let mut reg = DeviceRegistry::new();
        assert_eq!(
            reg.authenticate("sensor-009", Some("guess")),
            AuthOutcome::Rejected
        );
        assert!(reg.is_empty());
    }

    #[test]
    fn rejected_attempt_does_not_register() {
        let mut reg = DeviceRegistry::new();
        reg.authenticate("sensor-009", Some("guess"));
        assert_eq!(reg.authenticate("sensor-009", None), AuthOutcome::Rejected);
        assert_eq!(reg.len(), 0);
    }
}
