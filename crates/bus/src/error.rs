use thiserror::Error;

/// Errors raised by the messaging layer.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("envelope encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("envelope decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("zeromq error: {0}")]
    Zmq(#[from] zeromq::ZmqError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("bus closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
