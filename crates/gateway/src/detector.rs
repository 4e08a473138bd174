//! Edge anomaly detector: z-score scoring against cloud-trained profiles.
//!
//! The model is hot-swapped by the control-plane client; scoring never blocks
//! the pipeline on model absence.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;

/// Floor applied to degenerate (zero or negative) stddev values.
const MIN_STDDEV: f64 = 1e-4;

#[derive(Debug, Clone, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub mean: f64,
    #[serde(default = "default_stddev")]
    pub stddev: f64,
    #[serde(default = "default_n_sigma")]
    pub n_sigma: f64,
    #[serde(default)]
    pub samples: u64,
}

fn default_stddev() -> f64 {
    MIN_STDDEV
}

fn default_n_sigma() -> f64 {
    3.0
}

#[derive(Debug, Deserialize)]
struct ModelPayload {
    features: Option<HashMap<String, Profile>>,
    generated_at: Option<i64>,
}

#[derive(Default)]
struct Model {
    features: HashMap<String, Profile>,
    generated_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Score {
    pub is_anomaly: bool,
    pub score: f64,
    pub has_profile: bool,
    pub model_timestamp: Option<i64>,
}

#[derive(Default)]
pub struct Detector {
    model: RwLock<Model>,
}

impl Detector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap in a cloud-trained model artifact.  Payloads without a `features`
    /// object are ignored.
    pub async fn update_model(&self, payload: &Value) -> usize {
        let parsed: ModelPayload = match serde_json::from_value(payload.clone()) {
            Ok(p) => p,
            Err(_) => return self.profile_count().await,
        };
        let Some(features) = parsed.features else {
            return self.profile_count().await;
        };

        let count = features.len();
        let mut model = self.model.write().await;
        *model = Model {
            features,
            generated_at: parsed.generated_at,
        };
        count
    }

    /// Z-score a reading against its profile.  The lock is held only for the
    /// profile lookup.
    pub async fn score(&self, profile_key: &str, value: f64) -> Score {
        let (profile, generated_at) = {
            let model = self.model.read().await;
            (model.features.get(profile_key).cloned(), model.generated_at)
        };

        let Some(profile) = profile else {
            return Score {
                is_anomaly: false,
                score: 0.0,
                has_profile: false,
                model_timestamp: generated_at,
            };
        };

        let stddev = profile.stddev.max(MIN_STDDEV);
        let z = ((value - profile.mean) / stddev).abs();

        Score {
            is_anomaly: z > profile.n_sigma,
            score: z,
            has_profile: true,
            model_timestamp: generated_at,
        }
    }

    pub async fn profile_count(&self) -> usize {
        self.model.read().await.features.len()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
