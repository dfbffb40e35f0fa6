//! Error taxonomy for the broker client.
//!
//! Each component gets its own `thiserror`-derived enum, mirroring this
//! corpus's per-crate `XxxError` convention (see `fc-queue::error::QueueError`).
//! `BrokerError` is a thin umbrella for call sites that need one type.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("AMQP connection failed: {0}")]
    Connect(String),

    #[error("connect attempt timed out after {0}ms")]
    Timeout(u64),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("authentication/authorization refused: {0}")]
    Auth(String),

    #[error("topology precondition failed: {0}")]
    Precondition(String),

    #[error("reconnection attempts exhausted ({0} attempts)")]
    MaxReconnectAttempts(u32),

    #[error("connection is closing")]
    Closing,
}

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("AMQP operation failed: {0}")]
    Amqp(String),

    #[error("handler for routing key '{0}' returned an error: {1}")]
    Handler(String, String),

    #[error("failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ProducerError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("producer is not connected")]
    NotConnected,

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("request timed out waiting for a reply")]
    RequestTimeout,

    #[error("client shutdown: request cancelled")]
    ShutdownCancelled,

    #[error("failed to decode reply: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Consumer(#[from] ConsumerError),

    #[error(transparent)]
    Producer(#[from] ProducerError),
}

impl From<lapin::Error> for ConnectionError {
    fn from(e: lapin::Error) -> Self {
        match crate::classify::classify_lapin_error(&e) {
            crate::classify::ErrorClass::Terminal => ConnectionError::Precondition(e.to_string()),
            crate::classify::ErrorClass::Recoverable => ConnectionError::Channel(e.to_string()),
        }
    }
}
