//! Control-plane client: config poll, heartbeat, and model poll against the
//! cloud API.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use sysinfo::System;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::buffer::{BatchBuffer, SharedBuffer};
use crate::config::ConfigUpdate;
use crate::state::GatewayState;

/// Cadence of the model poll.
pub const MODEL_REFRESH_INTERVAL: Duration = Duration::from_secs(20);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Deserialize)]
struct ConfigResponse {
    #[serde(default)]
    config: ConfigUpdate,
}

pub struct ControlPlane {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    state: Arc<GatewayState>,
    sys: Mutex<System>,
}

impl ControlPlane {
    pub fn new(state: Arc<GatewayState>, base_url: String, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key,
            state,
            sys: Mutex::new(System::new()),
        }
    }

    /// Fetch the per-gateway config and merge it into the local one.  A
    /// change to the buffer sizing drains the current buffer into a freshly
    /// sized one, preserving every pending record.
    pub async fn refresh_config(&self) -> Result<()> {
        let url = format!("{}/config/{}", self.base_url, self.state.gateway_id);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .context("config request failed")?;

        if !resp.status().is_success() {
            anyhow::bail!("config fetch returned {}", resp.status());
        }

        let body: ConfigResponse = resp.json().await.context("bad config response")?;

        let (sizing_changed, batch_size, max_wait_seconds) = {
            let mut config = self.state.config.lock().await;
            let changed = config.merge(&body.config);
            (changed, config.batch_size, config.max_wait_seconds)
        };

        if sizing_changed {
            let preserved =
                swap_buffer_sizing(&self.state.buffer, batch_size, max_wait_seconds).await;
            info!(
                gateway = %self.state.gateway_id,
                batch_size,
                max_wait_seconds,
                preserved,
                "buffer re-sized from cloud config"
            );
        }

        Ok(())
    }

    /// Report liveness and load.  `message_rate` is the accepted-message
    /// count since the previous heartbeat (sampled-and-reset atomically);
    /// `records_sent` is the uploader's cumulative counter.
    pub async fn send_heartbeat(&self) -> Result<()> {
        let message_rate = self.state.messages_accepted.swap(0, Ordering::Relaxed);
        let records_sent = self.state.records_sent.load(Ordering::Relaxed);

        let (cpu_percent, mem_percent) = {
            let mut sys = self.sys.lock().await;
            sys.refresh_cpu_usage();
            sys.refresh_memory();
            let mem = if sys.total_memory() == 0 {
                0.0
            } else {
                sys.used_memory() as f64 / sys.total_memory() as f64 * 100.0
            };
            (f64::from(sys.global_cpu_usage()), mem)
        };

        let timestamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .context("format heartbeat timestamp")?;

        let payload = json!({
            "gatewayId": self.state.gateway_id,
            "status": "alive",
            "timestamp": timestamp,
            "message_rate": message_rate,
            "records_sent": records_sent,
            "cpu_percent": cpu_percent,
            "mem_percent": mem_percent,
        });

        let resp = self
            .client
            .post(format!("{}/heartbeat", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .context("heartbeat request failed")?;

        if !resp.status().is_success() {
            anyhow::bail!("heartbeat returned {}", resp.status());
        }

        info!(
            gateway = %self.state.gateway_id,
            message_rate,
            records_sent,
            "heartbeat sent"
        );
        Ok(())
    }

    /// Poll for a newer cloud-trained model and hand it to the detector.
    /// A `pending` response is a no-op.
    pub async fn refresh_model(&self) -> Result<()> {
        let resp = self
            .client
            .get(format!("{}/ml/model", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .context("model request failed")?;

        if !resp.status().is_success() {
            anyhow::bail!("model fetch returned {}", resp.status());
        }

        let payload: Value = resp.json().await.context("bad model response")?;
        if payload.get("status").and_then(Value::as_str) == Some("pending") {
            debug!(gateway = %self.state.gateway_id, "model not ready yet");
            return Ok(());
        }

        let model = payload.get("model").unwrap_or(&payload);
        let profiles = self.state.detector.update_model(model).await;
        info!(gateway = %self.state.gateway_id, profiles, "model updated");
        Ok(())
    }

    /// Config refresh + heartbeat ticker.  The cadence itself is part of the
    /// config, so it is re-read every iteration.
    pub async fn run_control_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let interval = self.state.config.lock().await.config_check_interval;
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(interval)) => {}
                _ = shutdown.changed() => break,
            }

            if let Err(e) = self.refresh_config().await {
                warn!("config refresh failed: {e:#}");
            }
            if let Err(e) = self.send_heartbeat().await {
                warn!("heartbeat failed: {e:#}");
            }
        }
    }

    /// Model poll ticker.
    pub async fn run_model_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if let Err(e) = self.refresh_model().await {
                warn!("model refresh failed: {e:#}");
            }

            tokio::select! {
                _ = tokio::time::sleep(MODEL_REFRESH_INTERVAL) => {}
                _ = shutdown.changed() => break,
            }
        }
    }
}

/// Drain the buffer and replace it in place with one using the new sizing,
/// requeuing the drained records at the head.  Every holder of the shared
/// handle observes the swap atomically.  Returns the preserved record count.
pub(crate) async fn swap_buffer_sizing(
    buffer: &SharedBuffer,
    batch_size: usize,
    max_wait_seconds: f64,
) -> usize {
    let mut buf = buffer.lock().await;
    let old = buf.flush_all();
    let preserved = old.len();
    *buf = BatchBuffer::new(batch_size, max_wait_seconds);
    buf.requeue(old);
    preserved
}

// ===========================================================================
// Tests
// ===========================================================================
