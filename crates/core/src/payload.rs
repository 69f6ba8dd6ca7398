//! Payload records exchanged between the pipeline stages.
//!
//! All of them travel as JSON. Field names are the wire names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed text attached to every anomaly event.
pub const ANOMALY_DETAILS: &str = "Anomaly detected by Isolation Forest";

/// Per-sensor window summary produced upstream of the pipeline.
///
/// `mean`, `std` and `last` hold one value per sensor in sensor-index order.
/// Missing arrays decode as empty so the reducer can reject them softly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowedStats {
    pub machine_id: String,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    pub cycle: u64,
    #[serde(default)]
    pub mean: Vec<f64>,
    #[serde(default)]
    pub std: Vec<f64>,
    #[serde(default)]
    pub last: Vec<f64>,
}

/// Shape, energy and SNR descriptors of the selected sensor means.
///
/// A key missing from an incoming record reads as `0.0`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvancedFeatures {
    pub skewness: f64,
    pub kurtosis: f64,
    pub energy: f64,
    pub avg_snr: f64,
}

impl AdvancedFeatures {
    /// Model input order: `[skewness, kurtosis, energy, avg_snr]`.
    pub fn to_array(&self) -> [f64; 4] {
        [self.skewness, self.kurtosis, self.energy, self.avg_snr]
    }

    pub fn is_finite(&self) -> bool {
        self.to_array().iter().all(|v| v.is_finite())
    }
}

/// Masked per-sensor statistics, K values each.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelInputs {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

/// Output of the feature reducer, input of the anomaly scorer and RUL predictor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub machine_id: String,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    pub cycle: u64,
    #[serde(default, alias = "advanced_features", skip_serializing_if = "Option::is_none")]
    pub advanced: Option<AdvancedFeatures>,
    #[serde(default)]
    pub model_inputs: ModelInputs,
}

/// Published only when a fitted model classifies a vector as an outlier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub machine_id: String,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    pub cycle: u64,
    /// Negative means anomalous; the further below zero, the stronger.
    pub anomaly_score: f64,
    pub is_anomaly: bool,
    pub details: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RulPrediction {
    pub machine_id: String,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    pub cycle: u64,
    pub predicted_rul: f64,
}

/// RFC 3339 on the way out; RFC 3339 or a naive ISO-8601 timestamp (read
/// as UTC) on the way in.
pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw).ok_or_else(|| de::Error::custom(format!("unrecognised timestamp '{raw}'")))
    }

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Some(ts.with_timezone(&Utc));
        }
        ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
            .map(|naive| naive.and_utc())
    }
}
