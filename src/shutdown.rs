//! Coordinates a graceful shutdown across one Consumer and zero-or-more
//! Producers sharing a connection, the way `fc-router::LifecycleManager`
//! sequences its own background tasks down before releasing shared state.
//! Order: Consumer first (stop consuming), then Producers (reject
//! in-flight), then an optional user callback, then each connection's
//! registry entry is dropped so a later `Consumer::new`/`Producer::new`
//! against the same URI starts a fresh `ConnectionCore`.

use std::future::Future;
use std::pin::Pin;

use crate::config::ShutdownOptions;
use crate::connection::ConnectionRegistry;
use crate::consumer::Consumer;
use crate::producer::{Producer, ShutdownResult};

pub type ShutdownCallback = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = Result<(), String>> + Send>> + Send>;

pub struct ShutdownOrchestrator {
    consumer: Option<Consumer>,
    producers: Vec<Producer>,
    callback: Option<ShutdownCallback>,
}

impl ShutdownOrchestrator {
    pub fn new() -> Self {
        Self { consumer: None, producers: Vec::new(), callback: None }
    }

    pub fn with_consumer(mut self, consumer: Consumer) -> Self {
        self.consumer = Some(consumer);
        self
    }

    pub fn with_producer(mut self, producer: Producer) -> Self {
        self.producers.push(producer);
        self
    }

    pub fn with_callback(mut self, callback: ShutdownCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Runs the full sequence and returns the aggregated result. A
    /// callback error propagates and aborts before the connection registry
    /// is touched.
    pub async fn run(self, options: ShutdownOptions) -> Result<ShutdownResult, String> {
        let mut aggregate = ShutdownResult { success: true, pending_count: 0, timed_out: false };
        let mut cores = Vec::new();

        if let Some(consumer) = &self.consumer {
            let result = consumer.shutdown(options.timeout_ms, options.force).await;
            aggregate.success &= result.success;
            aggregate.pending_count += result.pending_count;
            aggregate.timed_out |= result.timed_out;
            cores.push(consumer.connection_core().clone());
        }

        for producer in &self.producers {
            let result = producer.shutdown(options).await;
            aggregate.success &= result.success;
            aggregate.pending_count += result.pending_count;
            aggregate.timed_out |= result.timed_out;
            cores.push(producer.connection_core().clone());
        }

        if let Some(callback) = self.callback {
            callback().await?;
        }

        for core in cores {
            let uri = core.uri().to_string();
            core.close().await;
            ConnectionRegistry::remove(&uri);
        }

        Ok(aggregate)
    }
}

impl Default for ShutdownOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}
