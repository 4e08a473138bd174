//! Process-wide gateway state, owned by the supervisor and passed by handle.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::auth::DeviceRegistry;
use crate::buffer::{BatchBuffer, SharedBuffer};
use crate::config::GatewayConfig;
use crate::detector::Detector;

pub struct GatewayState {
    pub gateway_id: String,
    pub config: Mutex<GatewayConfig>,
    pub buffer: SharedBuffer,
    pub devices: Mutex<DeviceRegistry>,
    pub detector: Detector,
    /// Messages accepted since the last heartbeat (sampled-and-reset).
    pub messages_accepted: AtomicU64,
    /// Cumulative records successfully uploaded to the cloud.
    pub records_sent: AtomicU64,
}

impl GatewayState {
    pub fn new(gateway_id: String, config: GatewayConfig) -> Arc<Self> {
        let buffer: SharedBuffer = Arc::new(Mutex::new(BatchBuffer::new(
            config.batch_size,
            config.max_wait_seconds,
        )));

        Arc::new(Self {
            gateway_id,
            config: Mutex::new(config),
            buffer,
            devices: Mutex::new(DeviceRegistry::new()),
            detector: Detector::new(),
            messages_accepted: AtomicU64::new(0),
            records_sent: AtomicU64::new(0),
        })
    }
}
