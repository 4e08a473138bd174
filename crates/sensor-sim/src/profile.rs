//! Per-sensor-type behaviour presets and reading generation.

use std::time::Duration;

/// Chance of an out-of-range anomaly reading.
const ANOMALY_PROBABILITY: f64 = 0.05;

/// After this long, `sensor-001` shifts its baseline, exercising drift
/// handling downstream.
const BASELINE_SHIFT_AFTER: Duration = Duration::from_secs(60);

pub struct SensorSpec {
    pub topic: &'static str,
    pub unit: &'static str,
    pub baseline: (f64, f64),
    pub shifted: (f64, f64),
    pub anomaly: (f64, f64),
}

static TEMPERATURE: SensorSpec = SensorSpec {
    topic: "sensors/temperature",
    unit: "°C",
    baseline: (20.0, 25.0),
    shifted: (-5.0, 0.0),
    anomaly: (-50.0, 60.0),
};

static HUMIDITY: SensorSpec = SensorSpec {
    topic: "sensors/humidity",
    unit: "%",
    baseline: (30.0, 70.0),
    shifted: (30.0, 70.0),
    anomaly: (-100.0, 150.0),
};

static PRESSURE: SensorSpec = SensorSpec {
    topic: "sensors/pressure",
    unit: "hPa",
    baseline: (1000.0, 1020.0),
    shifted: (1000.0, 1020.0),
    anomaly: (900.0, 1100.0),
};

pub fn spec_for(sensor_type: &str) -> Option<&'static SensorSpec> {
    match sensor_type {
        "temperature" => Some(&TEMPERATURE),
        "humidity" => Some(&HUMIDITY),
        "pressure" => Some(&PRESSURE),
        _ => None,
    }
}

/// Produce one reading: mostly baseline noise, a small chance of an
/// out-of-range anomaly, and a shifted baseline for `sensor-001` once it
/// has been running for a while.
pub fn sample_value(spec: &SensorSpec, device_id: &str, elapsed: Duration) -> f64 {
    if fastrand::f64() < ANOMALY_PROBABILITY {
        return round2(uniform(spec.anomaly));
    }
    if device_id == "sensor-001" && elapsed > BASELINE_SHIFT_AFTER {
        return round2(uniform(spec.shifted));
    }
    round2(uniform(spec.baseline))
}

fn uniform((lo, hi): (f64, f64)) -> f64 {
    lo + fastrand::f64() * (hi - lo)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ===========================================================================
// Tests
// ===========================================================================
