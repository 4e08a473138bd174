//! Cloud uploader: retried batched POSTs with failed-batch requeue.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::reading::Reading;
use crate::state::GatewayState;

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(2);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared secret presented to the cloud's gateway auth middleware.
const GATEWAY_SECRET: &str = "gateway-secret";

/// Sleep when no batch is ready to drain.
const IDLE_SLEEP: Duration = Duration::from_millis(100);

#[derive(Serialize)]
struct IngestPayload<'a> {
    #[serde(rename = "gatewayId")]
    gateway_id: &'a str,
    data: &'a [Reading],
}

pub struct Uploader {
    client: reqwest::Client,
    ingest_url: String,
    api_key: String,
    state: Arc<GatewayState>,
}

impl Uploader {
    pub fn new(state: Arc<GatewayState>, cloud_url: &str, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            ingest_url: format!("{cloud_url}/ingest"),
            api_key,
            state,
        }
    }

    /// Send one batch to the cloud with retries.  On persistent failure the
    /// batch is requeued at the head of the buffer so its records retry
    /// ahead of newer data.
    pub async fn send_batch(&self, batch: Vec<Reading>) -> bool {
        let payload = IngestPayload {
            gateway_id: &self.state.gateway_id,
            data: &batch,
        };

        for attempt in 1..=MAX_RETRIES {
            let result = self
                .client
                .post(&self.ingest_url)
                .bearer_auth(&self.api_key)
                .header("gatewayId", &self.state.gateway_id)
                .header("secret", GATEWAY_SECRET)
                .json(&payload)
                .timeout(UPLOAD_TIMEOUT)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => {
                    let sent = batch.len() as u64;
                    let total = self.state.records_sent.fetch_add(sent, Ordering::Relaxed) + sent;
                    info!(
                        gateway = %self.state.gateway_id,
                        sent,
                        total,
                        "batch uploaded to cloud"
                    );
                    return true;
                }
                Ok(resp) => warn!(status = %resp.status(), "cloud rejected batch"),
                Err(e) => warn!("cloud upload network error: {e}"),
            }

            if attempt < MAX_RETRIES {
                debug!(attempt, max = MAX_RETRIES, "retrying upload");
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }

        warn!(
            requeued = batch.len(),
            "upload failed after retries — requeuing batch"
        );
        self.state.buffer.lock().await.requeue(batch);
        false
    }

    /// Best-effort shutdown drain: flush everything pending and send it in
    /// `batch_size` chunks, synchronously.
    pub async fn shutdown_drain(&self) {
        let batch_size = self.state.config.lock().await.batch_size;
        let remaining = self.state.buffer.lock().await.flush_all();
        if remaining.is_empty() {
            return;
        }

        info!(
            count = remaining.len(),
            "sending remaining records before exit"
        );
        for chunk in remaining.chunks(batch_size.max(1)) {
            self.send_batch(chunk.to_vec()).await;
        }
    }
}

/// Greedy drain loop: repeatedly drain *all* currently-ready batches so a
/// burst does not back up behind a single flush, then idle briefly.
pub async fn drain_loop(uploader: Arc<Uploader>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let mut sent_any = false;
        loop {
            let batch = { uploader.state.buffer.lock().await.get_batch_if_ready() };
            match batch {
                Some(batch) => {
                    let uploader = Arc::clone(&uploader);
                    tokio::spawn(async move {
                        uploader.send_batch(batch).await;
                    });
                    sent_any = true;
                }
                None => break,
            }
        }

        if !sent_any {
            tokio::select! {
                _ = tokio::time::sleep(IDLE_SLEEP) => {}
                _ = shutdown.changed() => break,
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
