//! The PUB/SUB proxy every stage talks through.
//!
//! Publishers connect to the frontend, subscribers to the backend, and a
//! REP socket answers liveness probes with `ok`. `zeromq` 0.4 has no
//! XPUB/XSUB, so the frontend subscribes to everything and topic filtering
//! happens at each subscriber.

use tokio::sync::watch;
use zeromq::prelude::*;
use zeromq::{PubSocket, RepSocket, SubSocket, ZmqMessage};

use crate::error::BusError;
use crate::messages::events::WorkerHealth;
use crate::messages::topics::WORKER_HEALTH;
use crate::metrics::{spawn_broker_metrics_server, BrokerMetrics};
use crate::pubsub::from_frames;
use crate::transport::Transport;

/// Socket layout of the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    /// Publishers connect here.
    pub frontend: Transport,
    /// Subscribers connect here.
    pub backend: Transport,
    /// Liveness probes.
    pub health: Transport,
    /// `GET /metrics` port, if any.
    pub metrics_port: Option<u16>,
}

impl BrokerConfig {
    pub fn tcp(host: &str, frontend_port: u16, backend_port: u16, health_port: u16) -> Self {
        Self {
            frontend: Transport::tcp(host, frontend_port),
            backend: Transport::tcp(host, backend_port),
            health: Transport::tcp(host, health_port),
            metrics_port: None,
        }
    }

    /// From endpoint strings such as `tcp://0.0.0.0:5555`.
    pub fn from_endpoints(frontend: &str, backend: &str, health: &str) -> Result<Self, BusError> {
        Ok(Self {
            frontend: Transport::parse(frontend)?,
            backend: Transport::parse(backend)?,
            health: Transport::parse(health)?,
            metrics_port: None,
        })
    }
}

impl Default for BrokerConfig {
    /// IPC sockets under `/tmp/mantis`, matching the stages' default endpoints.
    fn default() -> Self {
        Self {
            frontend: Transport::ipc("broker-frontend"),
            backend: Transport::ipc("broker-backend"),
            health: Transport::ipc("broker-health"),
            metrics_port: None,
        }
    }
}

pub struct EventBroker {
    config: BrokerConfig,
    metrics: BrokerMetrics,
    stop: watch::Sender<bool>,
}

impl EventBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            metrics: BrokerMetrics::new(),
            stop: watch::channel(false).0,
        }
    }

    /// Per-topic traffic and worker heartbeats seen so far.
    pub fn metrics(&self) -> &BrokerMetrics {
        &self.metrics
    }

    /// Make `run` return. A message already received is still forwarded.
    pub fn shutdown(&self) {
        self.stop.send_replace(true);
    }

    /// Bind all sockets and forward until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<(), BusError> {
        for transport in [&self.config.frontend, &self.config.backend, &self.config.health] {
            transport.ensure_ipc_dir()?;
            transport.remove_stale_socket()?;
        }

        let mut frontend = SubSocket::new();
        frontend.bind(&self.config.frontend.endpoint()).await?;
        frontend.subscribe("").await?;
        let mut backend = PubSocket::new();
        backend.bind(&self.config.backend.endpoint()).await?;
        let mut probes = RepSocket::new();
        probes.bind(&self.config.health.endpoint()).await?;
        tracing::info!(
            frontend = %self.config.frontend,
            backend = %self.config.backend,
            health = %self.config.health,
            "broker listening"
        );

        tokio::spawn(answer_probes(probes, self.stop.subscribe()));
        if let Some(port) = self.config.metrics_port {
            spawn_broker_metrics_server(port, self.metrics.clone(), self.stop.subscribe());
        }

        let mut stop = self.stop.subscribe();
        loop {
            let received = tokio::select! {
                _ = stop.wait_for(|&stopped| stopped) => break,
                received = frontend.recv() => received,
            };
            match received {
                Ok(frames) => self.forward(&mut backend, frames).await,
                Err(e) => tracing::warn!(error = %e, "frontend recv failed"),
            }
        }

        tracing::info!(total = self.metrics.total(), "broker stopped");
        Ok(())
    }

    async fn forward(&self, backend: &mut PubSocket, frames: ZmqMessage) {
        let topic = topic_of(&frames);
        let bytes = frames.iter().map(|f| f.len() as u64).sum();
        self.metrics.record_message(&topic, bytes).await;
        if topic == WORKER_HEALTH {
            if let Some(health) = heartbeat_of(&frames) {
                self.metrics.record_worker_health(health).await;
            }
        }
        tracing::trace!(%topic, bytes, "forwarding");
        if let Err(e) = backend.send(frames).await {
            tracing::warn!(%topic, error = %e, "backend send failed");
        }
    }
}

async fn answer_probes(mut socket: RepSocket, mut stop: watch::Receiver<bool>) {
    loop {
        let probe = tokio::select! {
            _ = stop.wait_for(|&stopped| stopped) => return,
            probe = socket.recv() => probe,
        };
        let replied = match probe {
            Ok(_) => socket.send(ZmqMessage::from("ok")).await,
            Err(e) => Err(e),
        };
        if let Err(e) = replied {
            tracing::warn!(error = %e, "health probe failed");
        }
    }
}

/// First frame, lossily decoded.
fn topic_of(frames: &ZmqMessage) -> String {
    frames
        .iter()
        .next()
        .map(|frame| String::from_utf8_lossy(frame).into_owned())
        .unwrap_or_default()
}

fn heartbeat_of(frames: &ZmqMessage) -> Option<WorkerHealth> {
    from_frames(frames).ok()?.decode().ok()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::messages::events::WorkerStatus;
    use crate::Message;

    #[test]
    fn default_layout_is_local_ipc() {
        let cfg = BrokerConfig::default();
        assert_eq!(cfg.frontend.endpoint(), "ipc:///tmp/mantis/broker-frontend.sock");
        assert_eq!(cfg.backend.endpoint(), "ipc:///tmp/mantis/broker-backend.sock");
        assert_eq!(cfg.metrics_port, None);
    }

    #[test]
    fn endpoints_parse_or_fail() {
        let cfg = BrokerConfig::from_endpoints(
            "tcp://0.0.0.0:5555",
            "tcp://0.0.0.0:5556",
            "tcp://0.0.0.0:5557",
        )
        .unwrap();
        assert_eq!(cfg, BrokerConfig::tcp("0.0.0.0", 5555, 5556, 5557));
        assert!(BrokerConfig::from_endpoints("localhost:9092", "tcp://a:1", "tcp://a:2").is_err());
    }

    #[test]
    fn topic_frame_is_read_lossily() {
        assert_eq!(topic_of(&ZmqMessage::from("features-data")), "features-data");
        let odd = topic_of(&ZmqMessage::from(vec![b'a', 0xff]));
        assert!(odd.starts_with('a'));
    }

    #[test]
    fn heartbeat_is_read_from_the_envelope() {
        let health = WorkerHealth {
            worker_id: "feature-extraction-group".into(),
            status: WorkerStatus::Healthy,
            processed: 3,
            uptime_secs: 1.5,
        };
        let envelope = Message::new(WORKER_HEALTH, &health).unwrap().to_bytes().unwrap();
        let mut frames = ZmqMessage::from(WORKER_HEALTH);
        frames.push_back(envelope.into());

        assert_eq!(heartbeat_of(&frames), Some(health));
        assert_eq!(heartbeat_of(&ZmqMessage::from(WORKER_HEALTH)), None);
    }

    #[tokio::test]
    async fn shutdown_ends_run() {
        let broker = Arc::new(EventBroker::new(BrokerConfig::tcp("127.0.0.1", 16050, 16051, 16052)));
        let running = broker.clone();
        let handle = tokio::spawn(async move { running.run().await });
        tokio::time::sleep(Duration::from_millis(200)).await;

        broker.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("broker kept running")
            .unwrap();
        assert!(result.is_ok());
    }
}
