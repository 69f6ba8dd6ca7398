//! Consume-transform-publish loop shared by the stage binaries.
//!
//! [`StageWorker`] is the handle the [`WorkerRunner`](mantis_bus::WorkerRunner)
//! drives (subscribe, stop, health). [`StageLoop`] owns the stage itself and
//! is the only thing that ever touches its state.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use mantis_bus::events::WorkerStatus;
use mantis_bus::{
    retry, BusError, EventPublisher, EventSubscriber, Message, RetryPolicy, StageMetrics, Worker,
};
use mantis_core::config::StageIo;

use crate::error::StageError;
use crate::pipeline::{MachineRecord, Stage};

/// Pause after a failed receive before trying again.
const RECV_BACKOFF: Duration = Duration::from_millis(100);

// ── StageWorker ─────────────────────────────────────────────────────

/// Lifecycle handle for one stage process.
pub struct StageWorker {
    io: StageIo,
    subscriber: Arc<dyn EventSubscriber>,
    metrics: StageMetrics,
    stop: Arc<Notify>,
    degraded: AtomicBool,
    subscribed: AtomicBool,
}

impl StageWorker {
    pub fn new(io: StageIo, subscriber: Arc<dyn EventSubscriber>, metrics: StageMetrics) -> Arc<Self> {
        Arc::new(Self {
            io,
            subscriber,
            metrics,
            stop: Arc::new(Notify::new()),
            degraded: AtomicBool::new(false),
            subscribed: AtomicBool::new(false),
        })
    }

    pub fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }

    pub fn io(&self) -> &StageIo {
        &self.io
    }

    /// Build the loop that will own `stage`.
    pub fn stage_loop<S: Stage>(
        self: &Arc<Self>,
        stage: S,
        publisher: Arc<dyn EventPublisher>,
        publish_policy: RetryPolicy,
    ) -> StageLoop<S> {
        self.degraded.store(stage.is_degraded(), Ordering::Relaxed);
        StageLoop {
            stage,
            worker: self.clone(),
            publisher,
            publish_policy,
        }
    }
}

#[async_trait]
impl Worker for StageWorker {
    /// Subscribes to the input topic. Safe to call more than once; the
    /// subscription has to exist before the loop starts receiving.
    async fn start(&self) -> Result<(), BusError> {
        if self.subscribed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.subscriber.subscribe(&self.io.input_topic).await {
            self.subscribed.store(false, Ordering::SeqCst);
            return Err(e);
        }
        self.metrics.set_live(true);
        info!(
            worker = %self.io.group_id,
            input = %self.io.input_topic,
            output = %self.io.output_topic,
            "subscribed"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<(), BusError> {
        // notify_one keeps the permit if the loop is mid-message
        self.stop.notify_one();
        Ok(())
    }

    fn name(&self) -> &str {
        &self.io.group_id
    }

    fn status(&self) -> WorkerStatus {
        if !self.metrics.is_live() {
            WorkerStatus::Unhealthy
        } else if self.degraded.load(Ordering::Relaxed) {
            WorkerStatus::Degraded
        } else {
            WorkerStatus::Healthy
        }
    }

    fn processed(&self) -> u64 {
        self.metrics.processed()
    }
}

// ── StageLoop ───────────────────────────────────────────────────────

/// Single owner of a stage's state. Messages are handled strictly one at a
/// time in arrival order.
pub struct StageLoop<S: Stage> {
    stage: S,
    worker: Arc<StageWorker>,
    publisher: Arc<dyn EventPublisher>,
    publish_policy: RetryPolicy,
}

impl<S: Stage> StageLoop<S> {
    pub fn stage(&self) -> &S {
        &self.stage
    }

    /// Run until stopped or until the stage hits a fatal error.
    ///
    /// On a fatal error the stage is marked not live, `shutdown` is notified
    /// so the runner winds the process down, and the error is returned.
    pub async fn run(mut self, shutdown: Option<Arc<Notify>>) -> Result<(), StageError> {
        let name = self.stage.name();
        self.worker.metrics.set_live(true);
        info!(
            stage = name,
            input = %self.worker.io.input_topic,
            output = %self.worker.io.output_topic,
            degraded = self.stage.is_degraded(),
            "stage loop running"
        );

        loop {
            let msg = tokio::select! {
                _ = self.worker.stop.notified() => {
                    info!(stage = name, "stage loop stopping");
                    break;
                }
                received = self.worker.subscriber.recv() => match received {
                    Ok(msg) => msg,
                    Err(BusError::Closed) => {
                        warn!(stage = name, "input closed, stage loop ending");
                        break;
                    }
                    Err(e) => {
                        warn!(stage = name, error = %e, "receive failed");
                        tokio::time::sleep(RECV_BACKOFF).await;
                        continue;
                    }
                },
            };

            if let Err(e) = self.handle(msg).await {
                error!(stage = name, error = %e, "fatal stage error, shutting down");
                self.worker.metrics.set_live(false);
                if let Some(shutdown) = &shutdown {
                    shutdown.notify_one();
                }
                return Err(e);
            }
        }
        self.worker.metrics.set_live(false);
        Ok(())
    }

    /// Process one message. Only fatal errors are returned; everything else
    /// is logged, counted and dropped here.
    pub async fn handle(&mut self, msg: Message) -> Result<(), StageError> {
        if msg.topic != self.worker.io.input_topic {
            debug!(topic = %msg.topic, "ignoring message for another topic");
            return Ok(());
        }

        let metrics = self.worker.metrics.clone();
        let started = Instant::now();

        let input: S::Input = match msg.decode() {
            Ok(input) => input,
            Err(e) => {
                let (machine_id, cycle) = msg.context();
                warn!(?machine_id, ?cycle, error = %e, "undecodable payload, dropping");
                metrics.record_dropped();
                metrics.record_processed(started.elapsed());
                return Ok(());
            }
        };
        let machine_id = input.machine_id().to_string();
        let cycle = input.cycle();

        let stage = &mut self.stage;
        let outcome = catch_unwind(AssertUnwindSafe(|| stage.process(input)));
        metrics.record_processed(started.elapsed());

        let output = match outcome {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.is_fatal() => return Err(e),
            Ok(Err(e)) => {
                warn!(%machine_id, cycle, error = %e, "dropping message");
                metrics.record_dropped();
                return Ok(());
            }
            Err(panic) => {
                error!(%machine_id, cycle, panic = %panic_message(&*panic), "stage panicked, skipping message");
                metrics.record_dropped();
                return Ok(());
            }
        };

        let Some(output) = output else {
            return Ok(());
        };
        if S::EMITS_ANOMALIES {
            metrics.record_anomaly();
            info!(%machine_id, cycle, "anomaly detected");
        }
        self.publish(&output, &msg).await;
        Ok(())
    }

    async fn publish(&self, output: &S::Output, input: &Message) {
        let topic = &self.worker.io.output_topic;
        let metrics = &self.worker.metrics;

        let msg = match Message::with_correlation(topic.as_str(), output, input.correlation_id) {
            Ok(msg) => msg.keyed(output.machine_id()),
            Err(e) => {
                error!(machine_id = %output.machine_id(), cycle = output.cycle(), error = %e, "failed to serialize output");
                metrics.record_publish_failure();
                return;
            }
        };

        let publisher = &self.publisher;
        let sent = retry("publish", &self.publish_policy, || {
            let msg = msg.clone();
            async move { publisher.publish(msg).await }
        })
        .await;

        match sent {
            Ok(()) => {
                metrics.record_emitted();
                debug!(topic = %topic, machine_id = %output.machine_id(), cycle = output.cycle(), "published");
            }
            Err(e) => {
                metrics.record_publish_failure();
                error!(
                    topic = %topic,
                    machine_id = %output.machine_id(),
                    cycle = output.cycle(),
                    error = %e,
                    "publish failed after retries, dropping output"
                );
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
