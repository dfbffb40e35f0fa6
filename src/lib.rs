//! AMQP 0-9-1 broker client: a retrying, dead-lettering `Consumer` and an
//! RPC `Producer`, sharing a reconnecting `ConnectionCore` per broker URI.
//!
//! Grounded on this corpus's `fc-queue::activemq` connect/reconnect shape,
//! generalized into a full state machine (backoff, an event bus, a
//! leak-preventing connect timeout) and paired with a composable middleware
//! chain around Consumer handlers, mirroring `fc-router`'s handler-registry
//! and lifecycle conventions.

pub mod backoff;
pub mod classify;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod events;
pub mod exchange_guard;
pub mod logging;
pub mod middleware;
pub mod producer;
pub mod registry;
pub mod shutdown;
pub mod signal;

pub use config::{ConnectionOptions, ListenOptions, ReconnectPolicy, RetryOptions, SendOptions, ShutdownOptions};
pub use connection::{ConnectionCore, ConnectionRegistry, ConnectionState};
pub use consumer::Consumer;
pub use error::{BrokerError, ConnectionError, ConsumerError, ProducerError};
pub use events::ConnectionEvent;
pub use middleware::{HandlerContext, HandlerError, HandlerResult, Middleware, ReplyFn};
pub use producer::{Producer, ShutdownResult};
pub use registry::{Handler, HandlerEntry, HandlerFuture, HandlerRegistry};
pub use shutdown::ShutdownOrchestrator;
