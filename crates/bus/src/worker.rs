//! Worker lifecycle.
//!
//! [`Worker`] is implemented by every long-running stage process,
//! [`WorkerBuilder`] configures the runner and [`WorkerRunner`] drives the
//! lifecycle: start, periodic health pings, wait for a shutdown signal,
//! stop with a timeout, final ping.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::error::BusError;
use crate::message::Message;
use crate::messages::events::{WorkerHealth, WorkerStatus};
use crate::messages::topics::WORKER_HEALTH;
use crate::traits::EventPublisher;

// ── Worker trait ─────────────────────────────────────────────────────

#[async_trait]
pub trait Worker: Send + Sync {
    /// Called once before the first health ping. Set up subscriptions here.
    async fn start(&self) -> Result<(), BusError>;

    /// Called once during shutdown. Must make the worker's loop finish its
    /// current message and return.
    async fn stop(&self) -> Result<(), BusError>;

    /// Identity used in health pings and logs.
    fn name(&self) -> &str;

    /// Status reported in the next health ping.
    fn status(&self) -> WorkerStatus {
        WorkerStatus::Healthy
    }

    /// Messages processed so far, reported in health pings.
    fn processed(&self) -> u64 {
        0
    }
}

// ── WorkerBuilder ────────────────────────────────────────────────────

pub struct WorkerBuilder {
    name: String,
    health_interval: Duration,
    shutdown_timeout: Duration,
}

impl WorkerBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            health_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(5),
        }
    }

    /// Interval between health pings (default: 30s).
    pub fn health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    /// How long `stop()` may take before the runner gives up on it (default: 5s).
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn build(self) -> WorkerRunnerConfig {
        WorkerRunnerConfig {
            name: self.name,
            health_interval: self.health_interval,
            shutdown_timeout: self.shutdown_timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerRunnerConfig {
    pub name: String,
    pub health_interval: Duration,
    pub shutdown_timeout: Duration,
}

// ── WorkerRunner ─────────────────────────────────────────────────────

/// Publishes `WorkerHealth` pings for one worker.
#[derive(Clone)]
struct Heartbeat {
    worker: Arc<dyn Worker>,
    publisher: Arc<dyn EventPublisher>,
    name: String,
    started_at: Instant,
}

impl Heartbeat {
    async fn send(&self, status: WorkerStatus) {
        let health = WorkerHealth {
            worker_id: self.name.clone(),
            status,
            processed: self.worker.processed(),
            uptime_secs: self.started_at.elapsed().as_secs_f64(),
        };
        let sent = match Message::new(WORKER_HEALTH, &health) {
            Ok(msg) => self.publisher.publish(msg.keyed(&self.name)).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            warn!(worker = %self.name, error = %e, "health ping not sent");
        }
    }

    /// Ping with the worker's own status every `every`, forever.
    fn spawn(self, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.send(self.worker.status()).await;
            }
        })
    }
}

pub struct WorkerRunner;

impl WorkerRunner {
    /// Run a worker until SIGINT/SIGTERM or until `shutdown_notify` fires.
    ///
    /// A worker that hits a fatal error ends its own run by calling
    /// `notify_one()` on `shutdown_notify`.
    pub async fn run(
        worker: Arc<dyn Worker>,
        publisher: Arc<dyn EventPublisher>,
        config: WorkerRunnerConfig,
        shutdown_notify: Option<Arc<Notify>>,
    ) -> Result<(), BusError> {
        let name = config.name;
        info!(worker = %name, "starting worker");
        worker.start().await?;

        let heartbeat = Heartbeat {
            worker: worker.clone(),
            publisher,
            name: name.clone(),
            started_at: Instant::now(),
        };
        heartbeat.send(worker.status()).await;
        let pings = heartbeat.clone().spawn(config.health_interval);

        let requested = async {
            match &shutdown_notify {
                Some(notify) => notify.notified().await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = shutdown_signal() => info!(worker = %name, "signal received"),
            _ = requested => info!(worker = %name, "shutdown requested"),
        }
        pings.abort();

        match tokio::time::timeout(config.shutdown_timeout, worker.stop()).await {
            Ok(Ok(())) => info!(worker = %name, "worker stopped"),
            Ok(Err(e)) => warn!(worker = %name, error = %e, "worker stop failed"),
            Err(_) => warn!(worker = %name, timeout = ?config.shutdown_timeout, "worker stop timed out"),
        }
        heartbeat.send(WorkerStatus::Unhealthy).await;
        Ok(())
    }
}

/// Resolve on SIGINT or SIGTERM (Ctrl+C elsewhere).
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "could not register SIGTERM handler, waiting for ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::memory::{MemoryBus, MemorySubscriber};
    use crate::traits::EventSubscriber;

    struct Probe {
        starts: AtomicU32,
        stops: AtomicU32,
        status: WorkerStatus,
    }

    impl Probe {
        fn new(status: WorkerStatus) -> Arc<Self> {
            Arc::new(Self {
                starts: AtomicU32::new(0),
                stops: AtomicU32::new(0),
                status,
            })
        }
    }

    #[async_trait]
    impl Worker for Probe {
        async fn start(&self) -> Result<(), BusError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<(), BusError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &str {
            "probe"
        }

        fn status(&self) -> WorkerStatus {
            self.status
        }

        fn processed(&self) -> u64 {
            7
        }
    }

    async fn health_listener(bus: &MemoryBus) -> MemorySubscriber {
        let sub = bus.subscriber();
        sub.subscribe(WORKER_HEALTH).await.unwrap();
        sub
    }

    async fn next_ping(sub: &MemorySubscriber) -> WorkerHealth {
        tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("no health ping")
            .unwrap()
            .decode()
            .unwrap()
    }

    #[tokio::test]
    async fn pings_until_shutdown_then_reports_unhealthy() {
        let bus = MemoryBus::new();
        let pings = health_listener(&bus).await;
        let worker = Probe::new(WorkerStatus::Degraded);
        let shutdown = Arc::new(Notify::new());
        let config = WorkerBuilder::new("rul-prediction-group")
            .health_interval(Duration::from_millis(40))
            .shutdown_timeout(Duration::from_secs(1))
            .build();

        let handle = tokio::spawn(WorkerRunner::run(
            worker.clone(),
            Arc::new(bus.publisher()),
            config,
            Some(shutdown.clone()),
        ));

        for _ in 0..2 {
            let ping = next_ping(&pings).await;
            assert_eq!(ping.worker_id, "rul-prediction-group");
            assert_eq!(ping.status, WorkerStatus::Degraded);
            assert_eq!(ping.processed, 7);
        }

        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("runner did not finish")
            .unwrap()
            .unwrap();
        assert_eq!(worker.starts.load(Ordering::SeqCst), 1);
        assert_eq!(worker.stops.load(Ordering::SeqCst), 1);

        let mut last = next_ping(&pings).await;
        while let Ok(Ok(msg)) = tokio::time::timeout(Duration::from_millis(50), pings.recv()).await {
            last = msg.decode().unwrap();
        }
        assert_eq!(last.status, WorkerStatus::Unhealthy);
    }

    #[tokio::test]
    async fn notify_before_wait_is_not_lost() {
        // a stage can fail before the runner starts waiting
        let bus = MemoryBus::new();
        let worker = Probe::new(WorkerStatus::Healthy);
        let shutdown = Arc::new(Notify::new());
        shutdown.notify_one();

        let config = WorkerBuilder::new("early").build();
        tokio::time::timeout(
            Duration::from_secs(2),
            WorkerRunner::run(worker.clone(), Arc::new(bus.publisher()), config, Some(shutdown)),
        )
        .await
        .expect("runner hung")
        .unwrap();
        assert_eq!(worker.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn builder_defaults() {
        let config = WorkerBuilder::new("feature-extraction-group").build();
        assert_eq!(config.name, "feature-extraction-group");
        assert_eq!(config.health_interval, Duration::from_secs(30));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
    }
}
