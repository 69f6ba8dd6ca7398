//! Worker heartbeat payloads.

use serde::{Deserialize, Serialize};

/// Health status reported by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Running normally.
    Healthy,
    /// Running, but results are not trustworthy (e.g. a model on random weights).
    Degraded,
    /// Stopping or failed.
    Unhealthy,
}

/// Periodic heartbeat published on [`WORKER_HEALTH`](super::topics::WORKER_HEALTH).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHealth {
    /// Worker identity, normally the stage's consumer group id.
    pub worker_id: String,
    /// Current health status.
    pub status: WorkerStatus,
    /// Messages the worker has processed so far.
    #[serde(default)]
    pub processed: u64,
    /// Seconds since the worker started.
    #[serde(default)]
    pub uptime_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&WorkerStatus::Degraded).unwrap();
        assert_eq!(json, "\"degraded\"");
    }

    #[test]
    fn health_without_counters_still_decodes() {
        let health: WorkerHealth =
            serde_json::from_str(r#"{"worker_id":"rul-prediction-group","status":"healthy"}"#).unwrap();
        assert_eq!(health.processed, 0);
        assert_eq!(health.status, WorkerStatus::Healthy);
    }
}
