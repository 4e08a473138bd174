//! Peer replication engine: append-only replication log, pull-based
//! anti-entropy sync, and the HTTP endpoint peers pull from.
//!
//! Records accepted locally are appended to a bounded ring and served to
//! peers; records pulled from peers go into the local buffer (so this
//! gateway also uploads them) but are never re-logged, which keeps
//! `_origin` pinned to the first-touch gateway and prevents replication
//! storms.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::{Query, State};
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::buffer::{DedupRing, SharedBuffer};
use crate::reading::Reading;

/// Seconds between peer sync rounds.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(10);

/// Startup warm-up before the first sync round.
const WARMUP_DELAY: Duration = Duration::from_secs(5);

/// Max records kept in memory for peer pulls.
const REPLICATION_LOG_MAX: usize = 5_000;

/// Max messageIds tracked for cross-gateway dedup.
const SEEN_CACHE_MAX: usize = 20_000;

const PEER_PULL_TIMEOUT: Duration = Duration::from_secs(3);
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// A replication log entry: the reading plus first-touch metadata.  The
/// underscore fields exist only inside the replication protocol; pulling a
/// record strips them structurally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(flatten)]
    pub reading: Reading,
    #[serde(rename = "_origin")]
    pub origin: String,
    #[serde(rename = "_repl_ts")]
    pub repl_ts: f64,
}

#[derive(Debug, Deserialize)]
struct PeerDataResponse {
    #[serde(default)]
    data: Vec<LogEntry>,
}

#[derive(Debug, Deserialize)]
struct GatewayStatusResponse {
    #[serde(default)]
    gateways: HashMap<String, GatewayStatusInfo>,
}

#[derive(Debug, Deserialize)]
struct GatewayStatusInfo {
    #[serde(default)]
    status: String,
}

fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct PeerSync {
    gateway_id: String,
    cloud_url: String,
    peer_port: u16,
    buffer: SharedBuffer,
    client: reqwest::Client,
    log: Mutex<VecDeque<LogEntry>>,
    seen: Mutex<DedupRing>,
    peers: Mutex<Vec<String>>,
    cursors: Mutex<HashMap<String, f64>>,
}

impl PeerSync {
    pub fn new(gateway_id: String, cloud_url: String, peer_port: u16, buffer: SharedBuffer) -> Self {
        Self {
            gateway_id,
            cloud_url,
            peer_port,
            buffer,
            client: reqwest::Client::new(),
            log: Mutex::new(VecDeque::new()),
            seen: Mutex::new(DedupRing::new(SEEN_CACHE_MAX)),
            peers: Mutex::new(Vec::new()),
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Append a locally-accepted record to the replication log so peers can
    /// pull it.  Records without a messageId, or already seen, are skipped.
    pub async fn add_to_log(&self, reading: &Reading) {
        let Some(id) = reading.message_id.as_deref() else {
            return;
        };
        {
            let mut seen = self.seen.lock().await;
            if !seen.insert(id) {
                return;
            }
        }

        let entry = LogEntry {
            reading: reading.clone(),
            origin: self.gateway_id.clone(),
            repl_ts: epoch_seconds(),
        };

        let mut log = self.log.lock().await;
        log.push_back(entry);
        while log.len() > REPLICATION_LOG_MAX {
            log.pop_front();
        }
    }

    /// Log entries appended after `since` (exclusive).
    pub async fn log_since(&self, since: f64) -> Vec<LogEntry> {
        let log = self.log.lock().await;
        log.iter().filter(|e| e.repl_ts > since).cloned().collect()
    }

    /// Refresh the peer table from the cloud's gateway status, keeping alive
    /// gateways other than ourselves.
    pub async fn discover_peers(&self) {
        let url = format!("{}/gateway-status", self.cloud_url);
        let resp = match self
            .client
            .get(&url)
            .timeout(DISCOVERY_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                warn!(gateway = %self.gateway_id, status = %resp.status(), "peer discovery failed");
                return;
            }
            Err(e) => {
                warn!(gateway = %self.gateway_id, "peer discovery failed: {e}");
                return;
            }
        };

        match resp.json::<GatewayStatusResponse>().await {
            Ok(status) => {
                let alive: Vec<String> = status
                    .gateways
                    .into_iter()
                    .filter(|(id, info)| id != &self.gateway_id && info.status == "alive")
                    .map(|(id, _)| id)
                    .collect();
                *self.peers.lock().await = alive;
            }
            Err(e) => warn!(gateway = %self.gateway_id, "bad gateway-status response: {e}"),
        }
    }

    /// Ingest one peer's pull response into the local buffer.  Every record
    /// is gated on the seen set, so across all pulls at most one copy of a
    /// messageId ever enters the buffer via the peer path.
    async fn absorb_peer_batch(&self, entries: Vec<LogEntry>) -> usize {
        let mut replicated = 0;

        for entry in entries {
            let Some(id) = entry.reading.message_id.clone() else {
                continue;
            };
            {
                let mut seen = self.seen.lock().await;
                if !seen.insert(&id) {
                    continue;
                }
            }

            let mut reading = entry.reading;
            reading.replicated_from = Some(entry.origin);
            let _ = self.buffer.lock().await.add(reading);
            replicated += 1;
        }

        replicated
    }

    /// Pull new records from each peer's replication log.
    pub async fn pull_from_peers(&self) {
        let peers = self.peers.lock().await.clone();

        for peer_id in peers {
            let since = self
                .cursors
                .lock()
                .await
                .get(&peer_id)
                .copied()
                .unwrap_or(0.0);

            let url = format!("http://{peer_id}:{}/peer/data", self.peer_port);
            let resp = self
                .client
                .get(&url)
                .query(&[("since", since)])
                .timeout(PEER_PULL_TIMEOUT)
                .send()
                .await;

            let resp = match resp {
                Ok(resp) if resp.status().is_success() => resp,
                Ok(resp) => {
                    warn!(peer = %peer_id, status = %resp.status(), "peer pull failed");
                    continue;
                }
                // Peer not reachable yet: normal during scale-up, stay quiet.
                Err(e) if e.is_connect() || e.is_timeout() => {
                    debug!(peer = %peer_id, "peer not reachable: {e}");
                    continue;
                }
                Err(e) => {
                    warn!(peer = %peer_id, "peer pull failed: {e}");
                    continue;
                }
            };

            match resp.json::<PeerDataResponse>().await {
                Ok(payload) => {
                    let replicated = self.absorb_peer_batch(payload.data).await;
                    self.cursors
                        .lock()
                        .await
                        .insert(peer_id.clone(), epoch_seconds());
                    if replicated > 0 {
                        info!(gateway = %self.gateway_id, peer = %peer_id, replicated, "replicated records from peer");
                    }
                }
                Err(e) => warn!(peer = %peer_id, "bad peer response: {e}"),
            }
        }
    }

    /// Discovery + pull loop.  Starts after a short warm-up so the rest of
    /// the gateway (and its peers) can come up first.
    pub async fn sync_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(WARMUP_DELAY) => {}
            _ = shutdown.changed() => return,
        }

        info!(gateway = %self.gateway_id, interval_secs = SYNC_INTERVAL.as_secs(), "peer sync active");

        loop {
            self.discover_peers().await;
            if !self.peers.lock().await.is_empty() {
                self.pull_from_peers().await;
            }

            tokio::select! {
                _ = tokio::time::sleep(SYNC_INTERVAL) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!(gateway = %self.gateway_id, "peer sync stopped");
    }
}

// ---------------------------------------------------------------------------
// Peer HTTP server
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SinceQuery {
    #[serde(default)]
    since: f64,
}

pub fn router(peer: Arc<PeerSync>) -> Router {
    Router::new()
        .route("/peer/data", get(peer_data))
        .route("/peer/health", get(peer_health))
        .with_state(peer)
}

async fn peer_data(
    State(peer): State<Arc<PeerSync>>,
    Query(query): Query<SinceQuery>,
) -> Json<serde_json::Value> {
    let data = peer.log_since(query.since).await;
    Json(json!({
        "gateway_id": peer.gateway_id,
        "count": data.len(),
        "data": data,
    }))
}

async fn peer_health(State(peer): State<Arc<PeerSync>>) -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "gateway_id": peer.gateway_id }))
}

/// Serve the replication endpoints until shutdown.
pub async fn serve(
    peer: Arc<PeerSync>,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(gateway = %peer.gateway_id, port, "peer replication server listening");

    axum::serve(listener, router(peer))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
