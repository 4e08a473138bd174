//! Offline model trainer: periodically rebuilds per-profile z-score
//! statistics from the exported training snapshot and publishes the model
//! artifact atomically for the cloud API to serve.

mod model;

use std::env;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use model::TrainingRecord;

const TRAINING_INTERVAL: Duration = Duration::from_secs(20);

const HISTORICAL_FILE: &str = "historical_data.json";
const MODEL_FILE: &str = "anomaly_model.json";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let data_dir = PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "/data".to_string()));
    let historical_path = data_dir.join(HISTORICAL_FILE);
    let artifact_path = data_dir.join(MODEL_FILE);

    info!(
        data_dir = %data_dir.display(),
        interval_secs = TRAINING_INTERVAL.as_secs(),
        min_observations = model::MIN_OBSERVATIONS,
        "trainer started"
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        if let Err(e) = train_once(&historical_path, &artifact_path).await {
            warn!("training pass failed: {e:#}");
        }

        tokio::select! {
            _ = tokio::time::sleep(TRAINING_INTERVAL) => {}
            _ = &mut ctrl_c => break,
            _ = sigterm.recv() => break,
        }
    }

    info!("trainer stopped");
    Ok(())
}

/// One training pass.  An absent, empty, or mid-rotation snapshot is simply
/// "not ready yet", never an error.
async fn train_once(historical_path: &Path, artifact_path: &Path) -> Result<()> {
    let bytes = match tokio::fs::read(historical_path).await {
        Ok(bytes) if !bytes.is_empty() => bytes,
        Ok(_) => {
            debug!("historical data empty — waiting");
            return Ok(());
        }
        Err(_) => {
            debug!("no historical data yet — waiting");
            return Ok(());
        }
    };

    let records: Vec<TrainingRecord> = match serde_json::from_slice(&bytes) {
        Ok(records) => records,
        Err(e) => {
            warn!("unreadable historical data: {e}");
            return Ok(());
        }
    };

    let generated_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    let artifact = model::build_model(&records, generated_at);
    let profiles = artifact.features.len();

    let body = serde_json::to_vec(&artifact).context("serialize model artifact")?;
    let tmp = artifact_path.with_extension("json.tmp");
    tokio::fs::write(&tmp, body)
        .await
        .with_context(|| format!("write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, artifact_path)
        .await
        .with_context(|| format!("rename {} -> {}", tmp.display(), artifact_path.display()))?;

    info!(
        records = records.len(),
        profiles,
        "model artifact published"
    );
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
