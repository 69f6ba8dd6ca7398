pub mod broker;
pub mod error;
pub mod memory;
pub mod message;
pub mod messages;
pub mod metrics;
pub mod pubsub;
pub mod retry;
pub mod traits;
pub mod transport;
pub mod worker;

pub use broker::{BrokerConfig, EventBroker};
pub use error::BusError;
pub use memory::{MemoryBus, MemoryPublisher, MemorySubscriber};
pub use message::Message;
pub use messages::events;
pub use messages::topics;
pub use metrics::{BrokerMetrics, BrokerSnapshot, StageMetrics, StageMetricsSnapshot};
pub use pubsub::{ZmqPublisher, ZmqSubscriber};
pub use retry::{retry, RetryPolicy};
pub use traits::{EventPublisher, EventSubscriber};
pub use transport::Transport;
pub use worker::{shutdown_signal, Worker, WorkerBuilder, WorkerRunner, WorkerRunnerConfig};
