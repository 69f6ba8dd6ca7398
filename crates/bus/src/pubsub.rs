//! ZeroMQ publisher and subscriber.
//!
//! Wire format is two frames: the topic (SUB sockets prefix-match on it)
//! and the MessagePack [`Message`] envelope. Stages connect to the broker;
//! `bind` exists for broker-less setups and tests.

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use zeromq::prelude::*;
use zeromq::{PubSocket, SubSocket, ZmqMessage};

use crate::error::BusError;
use crate::message::Message;
use crate::traits::{EventPublisher, EventSubscriber};
use crate::transport::Transport;

fn to_frames(message: &Message) -> Result<ZmqMessage, BusError> {
    let mut frames = ZmqMessage::from(message.topic.as_str());
    frames.push_back(message.to_bytes()?.into());
    Ok(frames)
}

/// The envelope is the last frame, so a bare single-frame envelope decodes too.
pub(crate) fn from_frames(frames: &ZmqMessage) -> Result<Message, BusError> {
    let envelope = frames
        .iter()
        .last()
        .ok_or_else(|| BusError::Transport("empty ZMQ message".into()))?;
    Ok(Message::from_bytes(envelope.as_ref())?)
}

/// PUB side. One per stage, shared by the output topic and health pings.
pub struct ZmqPublisher {
    socket: Mutex<PubSocket>,
}

impl ZmqPublisher {
    /// Connect to the broker frontend.
    #[instrument(skip_all, fields(endpoint = %transport))]
    pub async fn connect(transport: &Transport) -> Result<Self, BusError> {
        let mut socket = PubSocket::new();
        socket.connect(&transport.endpoint()).await?;
        info!("publisher connected");
        Ok(Self { socket: Mutex::new(socket) })
    }

    #[instrument(skip_all, fields(endpoint = %transport))]
    pub async fn bind(transport: &Transport) -> Result<Self, BusError> {
        let mut socket = PubSocket::new();
        socket.bind(&transport.endpoint()).await?;
        info!("publisher bound");
        Ok(Self { socket: Mutex::new(socket) })
    }
}

#[async_trait]
impl EventPublisher for ZmqPublisher {
    async fn publish(&self, message: Message) -> Result<(), BusError> {
        let frames = to_frames(&message)?;
        self.socket.lock().await.send(frames).await?;
        debug!(topic = %message.topic, key = ?message.key, "published");
        Ok(())
    }
}

/// SUB side, connected to the broker backend.
///
/// `recv` holds the socket lock until a message arrives, so subscribe
/// before handing the subscriber to a receive loop.
pub struct ZmqSubscriber {
    socket: Mutex<SubSocket>,
}

impl ZmqSubscriber {
    #[instrument(skip_all, fields(endpoint = %transport))]
    pub async fn connect(transport: &Transport) -> Result<Self, BusError> {
        let mut socket = SubSocket::new();
        socket.connect(&transport.endpoint()).await?;
        info!("subscriber connected");
        Ok(Self { socket: Mutex::new(socket) })
    }
}

#[async_trait]
impl EventSubscriber for ZmqSubscriber {
    /// Prefix match; `""` receives everything.
    async fn subscribe(&self, topic_prefix: &str) -> Result<(), BusError> {
        self.socket.lock().await.subscribe(topic_prefix).await?;
        info!(topic_prefix, "subscribed");
        Ok(())
    }

    async fn recv(&self) -> Result<Message, BusError> {
        let frames = self.socket.lock().await.recv().await?;
        let message = from_frames(&frames)?;
        debug!(topic = %message.topic, "received");
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::time::{sleep, timeout};

    const WAIT: Duration = Duration::from_secs(2);

    async fn bound_pair(port: u16, prefix: &str) -> (ZmqPublisher, ZmqSubscriber) {
        let transport = Transport::tcp("127.0.0.1", port);
        let publisher = ZmqPublisher::bind(&transport).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        let subscriber = ZmqSubscriber::connect(&transport).await.unwrap();
        subscriber.subscribe(prefix).await.unwrap();
        sleep(Duration::from_millis(100)).await;
        (publisher, subscriber)
    }

    #[test]
    fn frames_are_topic_then_envelope() {
        let msg = Message::new("features-data", &1u8).unwrap();
        let frames = to_frames(&msg).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames.iter().next().unwrap().as_ref(), b"features-data");
        assert_eq!(from_frames(&frames).unwrap().correlation_id, msg.correlation_id);
    }

    #[test]
    fn bare_envelope_still_decodes() {
        let msg = Message::new("rul-predictions", &2u8).unwrap();
        let frames = ZmqMessage::from(msg.to_bytes().unwrap());
        assert_eq!(from_frames(&frames).unwrap().topic, "rul-predictions");
    }

    #[tokio::test]
    async fn keyed_message_survives_the_wire() {
        let (publisher, subscriber) = bound_pair(15700, "rul-predictions").await;

        let msg = Message::new("rul-predictions", &87.5f64).unwrap().keyed("m1");
        let correlation_id = msg.correlation_id;
        publisher.publish(msg).await.unwrap();

        let received = timeout(WAIT, subscriber.recv()).await.expect("timed out").unwrap();
        assert_eq!(received.correlation_id, correlation_id);
        assert_eq!(received.key.as_deref(), Some("m1"));
        assert_eq!(received.decode::<f64>().unwrap(), 87.5);
    }

    #[tokio::test]
    async fn other_prefixes_are_filtered_out() {
        let (publisher, subscriber) = bound_pair(15701, "anomaly-events").await;

        publisher
            .publish(Message::new("anomaly-events", &"flagged").unwrap())
            .await
            .unwrap();
        publisher
            .publish(Message::new("rul-predictions", &"ignored").unwrap())
            .await
            .unwrap();

        let received = timeout(WAIT, subscriber.recv()).await.expect("timed out").unwrap();
        assert_eq!(received.topic, "anomaly-events");
        assert!(timeout(Duration::from_millis(300), subscriber.recv()).await.is_err());
    }

    #[tokio::test]
    async fn feature_topic_fans_out_to_both_consumers() {
        let (publisher, anomaly_sub) = bound_pair(15720, "features-data").await;
        let rul_sub = ZmqSubscriber::connect(&Transport::tcp("127.0.0.1", 15720)).await.unwrap();
        rul_sub.subscribe("features-data").await.unwrap();
        sleep(Duration::from_millis(100)).await;

        let msg = Message::new("features-data", &42u64).unwrap();
        let cid = msg.correlation_id;
        publisher.publish(msg).await.unwrap();

        for sub in [&anomaly_sub, &rul_sub] {
            let got = timeout(WAIT, sub.recv()).await.expect("timed out").unwrap();
            assert_eq!(got.correlation_id, cid);
            assert_eq!(got.decode::<u64>().unwrap(), 42);
        }
    }
}
