//! Reserved topics.
//!
//! Stage data topics are configured per deployment; only the control-plane
//! topics below are fixed. They live under the `mantis.` namespace so a
//! data-topic subscription never matches them by prefix.

/// Periodic worker health heartbeat.
pub const WORKER_HEALTH: &str = "mantis.worker.health";
