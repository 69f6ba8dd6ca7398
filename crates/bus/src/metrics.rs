//! Counters for the broker and for each pipeline stage, served as JSON.
//!
//! - [`BrokerMetrics`]: per-topic traffic and the last heartbeat of every
//!   worker, kept by the proxy loop.
//! - [`StageMetrics`]: processed/emitted/dropped counters, anomalies
//!   detected, a processing-latency histogram and a liveness gauge.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::{watch, Mutex};

use crate::messages::events::{WorkerHealth, WorkerStatus};

// ── Broker metrics ───────────────────────────────────────────────────

/// Traffic seen on one topic since the broker started.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TopicTraffic {
    pub messages: u64,
    pub bytes: u64,
}

/// Latest heartbeat of a worker, as seen by the broker.
#[derive(Debug, Clone, Serialize)]
pub struct TrackedWorker {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub processed: u64,
    pub uptime_secs: f64,
    pub last_seen_secs_ago: f64,
}

/// JSON body of the broker's `GET /metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerSnapshot {
    pub total_messages: u64,
    pub uptime_secs: f64,
    pub topics: BTreeMap<String, TopicTraffic>,
    pub workers: Vec<TrackedWorker>,
}

#[derive(Debug, Default)]
struct Ledger {
    topics: BTreeMap<String, TopicTraffic>,
    workers: BTreeMap<String, (WorkerHealth, Instant)>,
}

/// Forwarding counters of the broker. Cheap to clone.
#[derive(Debug, Clone)]
pub struct BrokerMetrics {
    total: Arc<AtomicU64>,
    ledger: Arc<Mutex<Ledger>>,
    start: Instant,
}

impl BrokerMetrics {
    pub fn new() -> Self {
        Self {
            total: Arc::new(AtomicU64::new(0)),
            ledger: Arc::new(Mutex::new(Ledger::default())),
            start: Instant::now(),
        }
    }

    /// Messages forwarded so far, all topics together.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub async fn record_message(&self, topic: &str, bytes: u64) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let mut ledger = self.ledger.lock().await;
        let traffic = ledger.topics.entry(topic.to_string()).or_default();
        traffic.messages += 1;
        traffic.bytes += bytes;
    }

    /// Remember the latest heartbeat of `health.worker_id`.
    pub async fn record_worker_health(&self, health: WorkerHealth) {
        let mut ledger = self.ledger.lock().await;
        ledger
            .workers
            .insert(health.worker_id.clone(), (health, Instant::now()));
    }

    pub async fn snapshot(&self) -> BrokerSnapshot {
        let ledger = self.ledger.lock().await;
        let workers = ledger
            .workers
            .values()
            .map(|(health, seen)| TrackedWorker {
                worker_id: health.worker_id.clone(),
                status: health.status,
                processed: health.processed,
                uptime_secs: health.uptime_secs,
                last_seen_secs_ago: seen.elapsed().as_secs_f64(),
            })
            .collect();
        BrokerSnapshot {
            total_messages: self.total(),
            uptime_secs: self.start.elapsed().as_secs_f64(),
            topics: ledger.topics.clone(),
            workers,
        }
    }
}

impl Default for BrokerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

// ── Stage metrics ────────────────────────────────────────────────────

/// Upper bounds (seconds) of the processing-latency histogram buckets.
pub const LATENCY_BUCKETS: [f64; 10] = [
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.5, 1.0,
];

/// Cumulative latency histogram with fixed buckets plus an overflow bucket.
#[derive(Debug)]
struct LatencyHistogram {
    buckets: [AtomicU64; LATENCY_BUCKETS.len() + 1],
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        let slot = LATENCY_BUCKETS
            .iter()
            .position(|&upper| secs <= upper)
            .unwrap_or(LATENCY_BUCKETS.len());
        self.buckets[slot].fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        let mut running = 0;
        let mut buckets = Vec::with_capacity(LATENCY_BUCKETS.len() + 1);
        for (i, bucket) in self.buckets.iter().enumerate() {
            running += bucket.load(Ordering::Relaxed);
            buckets.push(BucketCount {
                le: LATENCY_BUCKETS.get(i).copied().unwrap_or(f64::INFINITY),
                count: running,
            });
        }
        HistogramSnapshot {
            buckets,
            sum_secs: self.sum_micros.load(Ordering::Relaxed) as f64 / 1e6,
            count: self.count.load(Ordering::Relaxed),
        }
    }
}

/// One cumulative histogram bucket: observations `<= le` seconds.
#[derive(Debug, Clone, Serialize)]
pub struct BucketCount {
    #[serde(serialize_with = "serialize_bound")]
    pub le: f64,
    pub count: u64,
}

fn serialize_bound<S: serde::Serializer>(le: &f64, s: S) -> Result<S::Ok, S::Error> {
    if le.is_finite() {
        s.serialize_f64(*le)
    } else {
        s.serialize_str("+Inf")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    pub buckets: Vec<BucketCount>,
    pub sum_secs: f64,
    pub count: u64,
}

#[derive(Debug)]
struct StageInner {
    stage: String,
    processed: AtomicU64,
    emitted: AtomicU64,
    dropped: AtomicU64,
    publish_failures: AtomicU64,
    anomalies: AtomicU64,
    live: AtomicBool,
    latency: LatencyHistogram,
    start: Instant,
}

/// Lock-free counters for one pipeline stage. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StageMetrics {
    inner: Arc<StageInner>,
}

/// JSON body of a stage's `GET /metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct StageMetricsSnapshot {
    pub stage: String,
    pub messages_processed: u64,
    pub messages_emitted: u64,
    pub messages_dropped: u64,
    pub publish_failures: u64,
    pub anomalies_detected: u64,
    pub processing_seconds: HistogramSnapshot,
    pub up: u8,
    pub uptime_secs: f64,
}

impl StageMetrics {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(StageInner {
                stage: stage.into(),
                processed: AtomicU64::new(0),
                emitted: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                publish_failures: AtomicU64::new(0),
                anomalies: AtomicU64::new(0),
                live: AtomicBool::new(false),
                latency: LatencyHistogram::new(),
                start: Instant::now(),
            }),
        }
    }

    /// A message went through the stage, whatever the outcome.
    pub fn record_processed(&self, elapsed: Duration) {
        self.inner.processed.fetch_add(1, Ordering::Relaxed);
        self.inner.latency.observe(elapsed);
    }

    pub fn record_emitted(&self) {
        self.inner.emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.inner.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_failure(&self) {
        self.inner.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_anomaly(&self) {
        self.inner.anomalies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_live(&self, live: bool) {
        self.inner.live.store(live, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }

    pub fn processed(&self) -> u64 {
        self.inner.processed.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.inner.start.elapsed()
    }

    pub fn snapshot(&self) -> StageMetricsSnapshot {
        let inner = &self.inner;
        StageMetricsSnapshot {
            stage: inner.stage.clone(),
            messages_processed: inner.processed.load(Ordering::Relaxed),
            messages_emitted: inner.emitted.load(Ordering::Relaxed),
            messages_dropped: inner.dropped.load(Ordering::Relaxed),
            publish_failures: inner.publish_failures.load(Ordering::Relaxed),
            anomalies_detected: inner.anomalies.load(Ordering::Relaxed),
            processing_seconds: inner.latency.snapshot(),
            up: u8::from(self.is_live()),
            uptime_secs: self.uptime().as_secs_f64(),
        }
    }
}

// ── HTTP server ──────────────────────────────────────────────────────

/// Serve the broker's `GET /metrics` on `port` until `shutdown` flips.
pub fn spawn_broker_metrics_server(
    port: u16,
    metrics: BrokerMetrics,
    shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let app = Router::new()
        .route("/metrics", axum::routing::get(broker_metrics_handler))
        .with_state(metrics);
    spawn_http(port, app, shutdown)
}

/// Serve a stage's `GET /metrics` and `GET /health` (503 when not live).
pub fn spawn_stage_metrics_server(
    port: u16,
    metrics: StageMetrics,
    shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let app = Router::new()
        .route("/metrics", axum::routing::get(stage_metrics_handler))
        .route("/health", axum::routing::get(stage_health_handler))
        .with_state(metrics);
    spawn_http(port, app, shutdown)
}

fn spawn_http(
    port: u16,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(port, error = %e, "cannot bind metrics port");
                return;
            }
        };
        tracing::info!(port, "serving metrics");

        let stopped = async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                // a dropped sender also ends the server
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        };
        if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(stopped).await {
            tracing::warn!(port, error = %e, "metrics server failed");
        }
    })
}

async fn broker_metrics_handler(State(metrics): State<BrokerMetrics>) -> Json<BrokerSnapshot> {
    Json(metrics.snapshot().await)
}

async fn stage_metrics_handler(State(metrics): State<StageMetrics>) -> Json<StageMetricsSnapshot> {
    Json(metrics.snapshot())
}

async fn stage_health_handler(State(metrics): State<StageMetrics>) -> (StatusCode, &'static str) {
    if metrics.is_live() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "down")
    }
}
