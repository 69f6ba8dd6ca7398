use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wire-format envelope carried between pipeline stages.
///
/// The envelope itself is MessagePack-encoded; the `payload` inside it is
/// JSON so every stage record keeps its documented JSON shape on the wire.
/// `key` carries the machine id when the producer knows it, which lets
/// consumers log context for payloads they cannot decode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Routing topic for PUB/SUB filtering (e.g. "features-data").
    pub topic: String,

    /// JSON-encoded payload bytes.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,

    /// When this message was created.
    pub timestamp: DateTime<Utc>,

    /// Correlation ID, carried from an input message to the outputs derived from it.
    pub correlation_id: Uuid,

    /// Partition key (machine id).
    #[serde(default)]
    pub key: Option<String>,

    /// Schema version for forward-compatible evolution.
    #[serde(default = "default_version")]
    pub version: u16,
}

fn default_version() -> u16 {
    1
}

impl Message {
    /// Create a new message, serializing the payload as JSON.
    pub fn new<T: Serialize>(topic: impl Into<String>, payload: &T) -> Result<Self, serde_json::Error> {
        Self::with_correlation(topic, payload, Uuid::new_v4())
    }

    /// Create a message with an explicit correlation ID (for derived outputs).
    pub fn with_correlation<T: Serialize>(
        topic: impl Into<String>,
        payload: &T,
        correlation_id: Uuid,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            topic: topic.into(),
            payload: serde_json::to_vec(payload)?,
            timestamp: Utc::now(),
            correlation_id,
            key: None,
            version: 1,
        })
    }

    /// Wrap an already-encoded JSON payload, e.g. one produced by an upstream system.
    pub fn from_json(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            payload,
            timestamp: Utc::now(),
            correlation_id: Uuid::new_v4(),
            key: None,
            version: 1,
        }
    }

    /// Attach a partition key.
    pub fn keyed(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Deserialize the JSON payload into the expected type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// Best-effort `(machine_id, cycle)` for log context, read from the raw payload.
    ///
    /// Falls back to the envelope key when the payload is not a JSON object.
    pub fn context(&self) -> (Option<String>, Option<u64>) {
        let value: Option<serde_json::Value> = serde_json::from_slice(&self.payload).ok();
        let machine_id = value
            .as_ref()
            .and_then(|v| v.get("machine_id"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| self.key.clone());
        let cycle = value
            .as_ref()
            .and_then(|v| v.get("cycle"))
            .and_then(|v| v.as_u64());
        (machine_id, cycle)
    }

    /// Serialize this entire envelope to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    /// Deserialize an envelope from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

/// Helper module for serde to handle `Vec<u8>` as raw bytes in MessagePack.
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let bytes: &[u8] = Deserialize::deserialize(d)?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Reading {
        machine_id: String,
        cycle: u64,
    }

    #[test]
    fn payload_is_json() {
        let msg = Message::new("features-data", &Reading { machine_id: "m1".into(), cycle: 7 }).unwrap();
        let raw: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(raw["machine_id"], "m1");
        assert_eq!(raw["cycle"], 7);
    }

    #[test]
    fn envelope_bytes_keep_key_and_correlation() {
        let msg = Message::new("features-data", &42u64).unwrap().keyed("engine-3");
        let decoded = Message::from_bytes(&msg.to_bytes().unwrap()).unwrap();

        assert_eq!(decoded.topic, "features-data");
        assert_eq!(decoded.key.as_deref(), Some("engine-3"));
        assert_eq!(decoded.correlation_id, msg.correlation_id);
        assert_eq!(decoded.decode::<u64>().unwrap(), 42);
    }

    #[test]
    fn with_correlation_preserves_id() {
        let id = Uuid::new_v4();
        let msg = Message::with_correlation("rul-predictions", &true, id).unwrap();
        assert_eq!(msg.correlation_id, id);
    }

    #[test]
    fn context_reads_machine_and_cycle() {
        let msg = Message::from_json("preprocessed-data", br#"{"machine_id":"m9","cycle":12,"mean":"oops"}"#.to_vec());
        assert_eq!(msg.context(), (Some("m9".to_string()), Some(12)));
    }

    #[test]
    fn context_falls_back_to_key() {
        let msg = Message::from_json("preprocessed-data", b"not json".to_vec()).keyed("m2");
        assert_eq!(msg.context(), (Some("m2".to_string()), None));
    }
}
