//! In-memory cloud store: ingested records, the server-side dedup ring,
//! per-profile training buffers, gateway configs and load tracking, and the
//! bounded training-snapshot export.
//!
//! Persistence is deliberately absent: the record list is an append-only
//! in-memory vector.  The only artifacts on disk are the training snapshot
//! and the model file on the shared volume, both written atomically.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::warn;

/// Per-profile ring size feeding the trainer.
pub const TRAINING_WINDOW_SIZE: usize = 50;

/// Max messageIds tracked for server-side dedup before FIFO eviction.
const INGEST_DEDUP_MAX: usize = 50_000;

/// Minimum seconds between automatic training-snapshot exports.
const AUTO_EXPORT_INTERVAL_SECONDS: f64 = 20.0;

const HISTORICAL_FILE: &str = "historical_data.json";
const MODEL_FILE: &str = "anomaly_model.json";

// ---------------------------------------------------------------------------
// Wire / storage types
// ---------------------------------------------------------------------------

/// A stored sensor reading.  Gateways may attach fields this tier does not
/// know about (scores, replication tags); the flattened bag keeps them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudReading {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "sensorType")]
    pub sensor_type: String,
    pub timestamp: String,
    pub value: f64,
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Optional on the wire: older gateways may omit it, which disables
    /// dedup for that record.
    #[serde(rename = "messageId", default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(rename = "profileKey", default, skip_serializing_if = "Option::is_none")]
    pub profile_key: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayLoad {
    pub status: String,
    pub message_rate: u64,
    pub records_sent: u64,
    pub last_heartbeat: String,
}

#[derive(Debug, Deserialize)]
pub struct Heartbeat {
    #[serde(rename = "gatewayId")]
    pub gateway_id: String,
    #[serde(default)]
    pub message_rate: u64,
    #[serde(default)]
    pub records_sent: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub received: usize,
    pub duplicates: usize,
    /// Records dropped for malformed timestamps; logged, never surfaced.
    pub rejected: usize,
}

// ---------------------------------------------------------------------------
// Dedup ring
// ---------------------------------------------------------------------------

/// FIFO-evicting set of messageIds with a bounded capacity.
struct DedupRing {
    seen: HashSet<String>,
    order: VecDeque<String>,
    cap: usize,
}

impl DedupRing {
    fn new(cap: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    /// Insert an id, evicting the oldest once over capacity.  Returns
    /// `false` when the id was already present.
    fn insert(&mut self, id: &str) -> bool {
        if !self.seen.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

pub fn default_config() -> Map<String, Value> {
    let mut config = Map::new();
    config.insert("batch_size".to_string(), json!(50));
    config.insert("max_wait_seconds".to_string(), json!(5));
    config
}

pub struct CloudStore {
    data_dir: PathBuf,
    records: Mutex<Vec<CloudReading>>,
    dedup: Mutex<DedupRing>,
    profiles: Mutex<HashMap<String, VecDeque<CloudReading>>>,
    configs: Mutex<HashMap<String, Map<String, Value>>>,
    loads: Mutex<HashMap<String, GatewayLoad>>,
    last_export: Mutex<f64>,
}

impl CloudStore {
    pub fn new(data_dir: PathBuf) -> Self {
        let mut configs = HashMap::new();
        configs.insert("gateway-01".to_string(), default_config());

        Self {
            data_dir,
            records: Mutex::new(Vec::new()),
            dedup: Mutex::new(DedupRing::new(INGEST_DEDUP_MAX)),
            profiles: Mutex::new(HashMap::new()),
            configs: Mutex::new(configs),
            loads: Mutex::new(HashMap::new()),
            last_export: Mutex::new(0.0),
        }
    }

    // -- ingest -------------------------------------------------------------

    /// Ingest a batch: dedup by messageId, stamp the profile key, and feed
    /// the per-profile training rings.
    pub async fn ingest(&self, batch: Vec<CloudReading>) -> IngestSummary {
        let mut summary = IngestSummary::default();

        for mut record in batch {
            if OffsetDateTime::parse(&record.timestamp, &Rfc3339).is_err() {
                warn!(
                    device = %record.device_id,
                    timestamp = %record.timestamp,
                    "malformed timestamp — rejecting record"
                );
                summary.rejected += 1;
                continue;
            }

            if let Some(id) = record.message_id.as_deref() {
                let mut dedup = self.dedup.lock().await;
                if !dedup.insert(id) {
                    summary.duplicates += 1;
                    continue;
                }
            }

            // The profile key is re-derived server-side regardless of what
            // the gateway sent.
            let key = format!("{}::{}", record.device_id, record.sensor_type);
            record.profile_key = Some(key.clone());

            {
                let mut profiles = self.profiles.lock().await;
                let ring = profiles.entry(key).or_default();
                ring.push_back(record.clone());
                while ring.len() > TRAINING_WINDOW_SIZE {
                    ring.pop_front();
                }
            }

            self.records.lock().await.push(record);
            summary.received += 1;
        }

        summary
    }

    pub async fn record_count(&self) -> usize {
        self.records.lock().await.len()
    }

    // -- read-only views ----------------------------------------------------

    pub async fn all_records(&self) -> Vec<CloudReading> {
        self.records.lock().await.clone()
    }

    pub async fn records_by_type(&self, sensor_type: &str) -> Vec<CloudReading> {
        self.records
            .lock()
            .await
            .iter()
            .filter(|r| r.sensor_type == sensor_type)
            .cloned()
            .collect()
    }

    pub async fn records_by_device(&self, device_id: &str) -> Vec<CloudReading> {
        self.records
            .lock()
            .await
            .iter()
            .filter(|r| r.device_id == device_id)
            .cloned()
            .collect()
    }

    // -- gateway configs ----------------------------------------------------

    pub async fn get_config(&self, gateway_id: &str) -> Map<String, Value> {
        self.configs
            .lock()
            .await
            .get(gateway_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Merge-update: existing keys survive unless overwritten by the patch.
    pub async fn update_config(
        &self,
        gateway_id: &str,
        patch: Map<String, Value>,
    ) -> Map<String, Value> {
        let mut configs = self.configs.lock().await;
        let config = configs.entry(gateway_id.to_string()).or_default();
        for (key, value) in patch {
            config.insert(key, value);
        }
        config.clone()
    }

    /// Create a default config for a newly-seen gateway.  Returns `true`
    /// when one was created.
    pub async fn ensure_config(&self, gateway_id: &str) -> bool {
        let mut configs = self.configs.lock().await;
        if configs.contains_key(gateway_id) {
            return false;
        }
        configs.insert(gateway_id.to_string(), default_config());
        true
    }

    // -- gateway load tracking ----------------------------------------------

    pub async fn record_heartbeat(&self, hb: &Heartbeat) {
        let last_heartbeat = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        self.loads.lock().await.insert(
            hb.gateway_id.clone(),
            GatewayLoad {
                status: "alive".to_string(),
                message_rate: hb.message_rate,
                records_sent: hb.records_sent,
                last_heartbeat,
            },
        );
    }

    pub async fn gateway_status(&self) -> Value {
        let loads = self.loads.lock().await;
        let total_records_sent: u64 = loads.values().map(|l| l.records_sent).sum();
        let gateways: Map<String, Value> = loads
            .iter()
            .map(|(id, load)| (id.clone(), json!(load)))
            .collect();

        json!({
            "gateways": gateways,
            "total_records_sent": total_records_sent,
            "count": loads.len(),
        })
    }

    pub async fn remove_gateway(&self, gateway_id: &str) -> bool {
        self.loads.lock().await.remove(gateway_id).is_some()
    }

    // -- training snapshot export -------------------------------------------

    /// Snapshot of the per-profile rings, sorted by timestamp (RFC-3339
    /// strings sort chronologically).
    async fn snapshot_training_records(&self) -> Vec<CloudReading> {
        let profiles = self.profiles.lock().await;
        let mut records: Vec<CloudReading> = profiles.values().flatten().cloned().collect();
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        records
    }

    /// Serialize the training snapshot to the shared volume via tmp +
    /// atomic rename.  Returns the exported record count.
    pub async fn export_snapshot(&self) -> Result<usize> {
        let records = self.snapshot_training_records().await;
        let body = serde_json::to_vec(&records).context("serialize training snapshot")?;

        let dest = self.data_dir.join(HISTORICAL_FILE);
        let tmp = self.data_dir.join(format!("{HISTORICAL_FILE}.tmp"));
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &dest)
            .await
            .with_context(|| format!("rename {} -> {}", tmp.display(), dest.display()))?;

        Ok(records.len())
    }

    /// Export if the auto-export interval has elapsed; called on the ingest
    /// path rather than from a timer, as bursts are what fill the rings.
    pub async fn maybe_auto_export(&self) -> Option<Result<usize>> {
        {
            let mut last = self.last_export.lock().await;
            let now = epoch_seconds();
            if now - *last < AUTO_EXPORT_INTERVAL_SECONDS {
                return None;
            }
            *last = now;
        }
        Some(self.export_snapshot().await)
    }

    // -- model artifact -----------------------------------------------------

    /// Current model artifact from the shared volume, or `None` while the
    /// trainer has not produced one (or mid-rotation).
    pub async fn model(&self) -> Option<Value> {
        let path = self.data_dir.join(MODEL_FILE);
        let bytes = tokio::fs::read(&path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(device: &str, sensor: &str, message_id: Option<&str>, ts: &str) -> CloudReading {
        CloudReading {
            device_id: device.to_string(),
            sensor_type: sensor.to_string(),
            timestamp: ts.to_string(),
            value: 21.5,
            unit: "C".to_string(),
            topic: None,
            message_id: message_id.map(str::to_string),
            profile_key: None,
            extra: Map::new(),
        }
    }

    fn store() -> CloudStore {
        CloudStore::new(std::env::temp_dir())
    }

    const TS: &str = "2026-07-30T12:00:00Z";

    // -- ingest / dedup -----------------------------------------------------

    #[tokio::test]
    async fn ingest_accepts_batch() {
        let store = store();
        let summary = store
            .ingest(vec![
                reading("d1", "temperature", Some("a"), TS),
                reading("d1", "temperature", Some("b"), TS),
                reading("d2", "humidity", Some("c"), TS),
            ])
            .await;

        assert_eq!(summary.received, 3);
        assert_eq!(summary.duplicates, 0);
        assert_eq!(store.record_count().await, 3);
    }

    #[tokio::test]
    async fn ingest_stores_exactly_one_record_per_message_id() {
        let store = store();
        // Same id repeated within one batch and across batches.
        store
            .ingest(vec![
                reading("d1", "temperature", Some("a"), TS),
                reading("d1", "temperature", Some("a"), TS),
            ])
            .await;
        let summary = store
            .ingest(vec![reading("d1", "temperature", Some("a"), TS)])
            .await;

        assert_eq!(summary.duplicates, 1);
        assert_eq!(store.record_count().await, 1);
    }

    #[tokio::test]
    async fn records_without_message_id_are_never_deduped() {
        let store = store();
        let summary = store
            .ingest(vec![
                reading("d1", "temperature", None, TS),
                reading("d1", "temperature", None, TS),
            ])
            .await;
        assert_eq!(summary.received, 2);
        assert_eq!(summary.duplicates, 0);
    }

    #[tokio::test]
    async fn ingest_stamps_profile_key_server_side() {
        let store = store();
        let mut spoofed = reading("d1", "temperature", Some("a"), TS);
        spoofed.profile_key = Some("whatever::lies".to_string());
        store.ingest(vec![spoofed]).await;

        let records = store.all_records().await;
        assert_eq!(records[0].profile_key.as_deref(), Some("d1::temperature"));
    }

    #[tokio::test]
    async fn malformed_timestamp_is_rejected() {
        let store = store();
        let summary = store
            .ingest(vec![reading("d1", "temperature", Some("a"), "yesterday")])
            .await;
        assert_eq!(summary.received, 0);
        assert_eq!(summary.rejected, 1);
        assert_eq!(store.record_count().await, 0);
    }

    // -- views --------------------------------------------------------------

    #[tokio::test]
    async fn views_filter_by_type_and_device() {
        let store = store();
        store
            .ingest(vec![
                reading("d1", "temperature", Some("a"), TS),
                reading("d2", "humidity", Some("b"), TS),
            ])
            .await;

        assert_eq!(store.records_by_type("temperature").await.len(), 1);
        assert_eq!(store.records_by_type("pressure").await.len(), 0);
        assert_eq!(store.records_by_device("d2").await.len(), 1);
    }

    // -- configs ------------------------------------------------------------

    #[tokio::test]
    async fn seeded_gateway_has_default_config() {
        let store = store();
        let config = store.get_config("gateway-01").await;
        assert_eq!(config["batch_size"], 50);
        assert_eq!(config["max_wait_seconds"], 5);
    }

    #[tokio::test]
    async fn unknown_gateway_config_is_empty() {
        let store = store();
        assert!(store.get_config("gateway-99").await.is_empty());
    }

    #[tokio::test]
    async fn update_config_merges_keys() {
        let store = store();
        let mut patch = Map::new();
        patch.insert("batch_size".to_string(), json!(10));
        store.update_config("gateway-02", patch).await;

        let mut patch = Map::new();
        patch.insert("max_wait_seconds".to_string(), json!(2));
        let merged = store.update_config("gateway-02", patch).await;

        assert_eq!(merged["batch_size"], 10);
        assert_eq!(merged["max_wait_seconds"], 2);
    }

    #[tokio::test]
    async fn ensure_config_creates_once() {
        let store = store();
        assert!(store.ensure_config("gateway-07").await);
        assert!(!store.ensure_config("gateway-07").await);
        assert_eq!(store.get_config("gateway-07").await["batch_size"], 50);
    }

    // -- load tracking ------------------------------------------------------

    #[tokio::test]
    async fn gateway_status_aggregates_loads() {
        let store = store();
        for (id, rate, sent) in [("gateway-01", 100, 500), ("gateway-02", 300, 700)] {
            store
                .record_heartbeat(&Heartbeat {
                    gateway_id: id.to_string(),
                    message_rate: rate,
                    records_sent: sent,
                    extra: Map::new(),
                })
                .await;
        }

        let status = store.gateway_status().await;
        assert_eq!(status["count"], 2);
        assert_eq!(status["total_records_sent"], 1200);
        assert_eq!(status["gateways"]["gateway-02"]["message_rate"], 300);
        assert_eq!(status["gateways"]["gateway-01"]["status"], "alive");
    }

    #[tokio::test]
    async fn remove_gateway_deletes_load_entry() {
        let store = store();
        store
            .record_heartbeat(&Heartbeat {
                gateway_id: "gateway-03".to_string(),
                message_rate: 1,
                records_sent: 1,
                extra: Map::new(),
            })
            .await;

        assert!(store.remove_gateway("gateway-03").await);
        assert!(!store.remove_gateway("gateway-03").await);
        assert_eq!(store.gateway_status().await["count"], 0);
    }

    // -- training snapshot --------------------------------------------------

    #[tokio::test]
    async fn profile_ring_is_bounded() {
        let store = store();
        for i in 0..(TRAINING_WINDOW_SIZE + 10) {
            store
                .ingest(vec![reading("d1", "temperature", Some(&format!("m-{i}")), TS)])
                .await;
        }
        let snapshot = store.snapshot_training_records().await;
        assert_eq!(snapshot.len(), TRAINING_WINDOW_SIZE);
        // Everything still lands in the append-only record list.
        assert_eq!(store.record_count().await, TRAINING_WINDOW_SIZE + 10);
    }

    #[tokio::test]
    async fn snapshot_is_sorted_by_timestamp() {
        let store = store();
        store
            .ingest(vec![
                reading("d1", "temperature", Some("b"), "2026-07-30T12:00:05Z"),
                reading("d2", "humidity", Some("a"), "2026-07-30T12:00:01Z"),
            ])
            .await;

        let snapshot = store.snapshot_training_records().await;
        assert_eq!(snapshot[0].timestamp, "2026-07-30T12:00:01Z");
        assert_eq!(snapshot[1].timestamp, "2026-07-30T12:00:05Z");
    }

    #[tokio::test]
    async fn export_writes_snapshot_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = CloudStore::new(dir.path().to_path_buf());
        store
            .ingest(vec![reading("d1", "temperature", Some("a"), TS)])
            .await;

        let count = store.export_snapshot().await.unwrap();
        assert_eq!(count, 1);

        let body = std::fs::read(dir.path().join(HISTORICAL_FILE)).unwrap();
        let parsed: Vec<CloudReading> = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].device_id, "d1");
        // No stale tmp file left behind.
        assert!(!dir.path().join(format!("{HISTORICAL_FILE}.tmp")).exists());
    }

    #[tokio::test]
    async fn auto_export_respects_interval() {
        let dir = tempfile::tempdir().unwrap();
        let store = CloudStore::new(dir.path().to_path_buf());
        store
            .ingest(vec![reading("d1", "temperature", Some("a"), TS)])
            .await;

        // First call exports (last_export starts at 0), second is gated.
        assert!(store.maybe_auto_export().await.is_some());
        assert!(store.maybe_auto_export().await.is_none());
    }

    // -- model --------------------------------------------------------------

    #[tokio::test]
    async fn model_absent_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CloudStore::new(dir.path().to_path_buf());
        assert!(store.model().await.is_none());
    }

    #[tokio::test]
    async fn model_reads_artifact_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(MODEL_FILE),
            r#"{"model_type":"zscore_anomaly_detector","features":{}}"#,
        )
        .unwrap();

        let store = CloudStore::new(dir.path().to_path_buf());
        let model = store.model().await.unwrap();
        assert_eq!(model["model_type"], "zscore_anomaly_detector");
    }

    // -- dedup ring ---------------------------------------------------------

    #[test]
    fn dedup_ring_evicts_oldest() {
        let mut ring = DedupRing::new(2);
        assert!(ring.insert("a"));
        assert!(ring.insert("b"));
        assert!(ring.insert("c"));
        // "a" was evicted, so it inserts cleanly again.
        assert!(ring.insert("a"));
        assert!(!ring.insert("c"));
    }
}
