//! Z-score profile building from exported training snapshots.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Minimum samples before a profile is trustworthy enough to emit.
pub const MIN_OBSERVATIONS: usize = 20;

/// Size of the per-profile ring the cloud feeds us; recorded in the
/// artifact for observability.
pub const TRAINING_WINDOW_SIZE: usize = 50;

const DEFAULT_N_SIGMA: f64 = 3.0;

/// Floor for degenerate stddev so downstream z-scores stay finite.
const MIN_STDDEV: f64 = 1e-4;

#[derive(Debug, Deserialize)]
pub struct TrainingRecord {
    #[serde(rename = "profileKey", default)]
    pub profile_key: Option<String>,
    #[serde(rename = "deviceId", default)]
    pub device_id: Option<String>,
    #[serde(rename = "sensorType", default)]
    pub sensor_type: Option<String>,
    pub value: f64,
}

#[derive(Debug, Serialize)]
pub struct FeatureProfile {
    pub mean: f64,
    pub stddev: f64,
    pub samples: usize,
    pub n_sigma: f64,
}

#[derive(Debug, Serialize)]
pub struct ModelArtifact {
    pub model_type: &'static str,
    pub generated_at: i64,
    pub training_window_size: usize,
    pub features: BTreeMap<String, FeatureProfile>,
}

/// Profile key for a record: the cloud-stamped key, or re-derived from the
/// device/sensor pair when a snapshot predates server-side stamping.
fn profile_key(record: &TrainingRecord) -> String {
    if let Some(key) = &record.profile_key {
        return key.clone();
    }
    format!(
        "{}::{}",
        record.device_id.as_deref().unwrap_or("unknown-device"),
        record.sensor_type.as_deref().unwrap_or("unknown-sensor"),
    )
}

/// Build the model artifact: per-profile mean and population stddev, gated
/// on `MIN_OBSERVATIONS`.
pub fn build_model(records: &[TrainingRecord], generated_at: i64) -> ModelArtifact {
    let mut groups: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for record in records {
        groups.entry(profile_key(record)).or_default().push(record.value);
    }

    let mut features = BTreeMap::new();
    for (key, values) in groups {
        if values.len() < MIN_OBSERVATIONS {
            continue;
        }

        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let stddev = variance.sqrt().max(MIN_STDDEV);

        features.insert(
            key,
            FeatureProfile {
                mean,
                stddev,
                samples: values.len(),
                n_sigma: DEFAULT_N_SIGMA,
            },
        );
    }

    ModelArtifact {
        model_type: "zscore_anomaly_detector",
        generated_at,
        training_window_size: TRAINING_WINDOW_SIZE,
        features,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
