//! Consumer: binds routing keys to handlers, declares the queue/retry
//! topology on a dedicated channel, and dispatches deliveries through the
//! middleware chain. Grounded on `fc-queue::activemq::ActiveMqConsumer` for
//! the connect/listen/shutdown shape, generalized from one fixed queue to an
//! arbitrary `HandlerRegistry` of routing keys.

mod dispatch;
mod topology;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::config::{ConnectionOptions, ListenOptions, RetryOptions};
use crate::connection::{ConnectionCore, ConnectionRegistry};
use crate::error::ConsumerError;
use crate::events::ConnectionEvent;
use crate::middleware::Middleware;
use crate::producer::ShutdownResult;
use crate::registry::{Handler, HandlerRegistry};

/// Shared state behind every clone of a `Consumer` handle.
pub(crate) struct ConsumerShared {
    pub(crate) app_name: String,
    pub(crate) exchange_name: String,
    pub(crate) core: Arc<ConnectionCore>,
    pub(crate) registry: RwLock<HandlerRegistry>,
    pub(crate) middlewares: RwLock<Vec<Middleware>>,
    pub(crate) listening: AtomicBool,
    pub(crate) prefetch: RwLock<Option<u16>>,
    pub(crate) consumer_tag: RwLock<Option<String>>,
    /// Deliveries currently inside the middleware chain, keyed by a
    /// per-dispatch id; used only to let `shutdown` wait for drain.
    pub(crate) inflight: DashMap<u64, ()>,
    pub(crate) next_dispatch_id: AtomicU64,
    pub(crate) channel_id: RwLock<Option<u64>>,
}

/// A bound, listening consumer for one application/exchange pair. Cheap to
/// clone; every clone shares the same topology, registry, and channel.
#[derive(Clone)]
pub struct Consumer {
    shared: Arc<ConsumerShared>,
}

impl Consumer {
    /// Builds a Consumer bound to `app_name`'s queue on `exchange_name`,
    /// sharing a `ConnectionCore` with any other Consumer/Producer already
    /// registered against `options.uri`.
    pub fn new(app_name: impl Into<String>, exchange_name: impl Into<String>, options: ConnectionOptions) -> Self {
        let core = ConnectionRegistry::get_or_create(options);
        Self {
            shared: Arc::new(ConsumerShared {
                app_name: app_name.into(),
                exchange_name: exchange_name.into(),
                core,
                registry: RwLock::new(HandlerRegistry::new()),
                middlewares: RwLock::new(Vec::new()),
                listening: AtomicBool::new(false),
                prefetch: RwLock::new(None),
                consumer_tag: RwLock::new(None),
                inflight: DashMap::new(),
                next_dispatch_id: AtomicU64::new(0),
                channel_id: RwLock::new(None),
            }),
        }
    }

    /// Registers a handler for `routing_key`, replacing any prior handler
    /// for that key. Must be called before `listen`; calling it afterward
    /// only takes effect on the next reconnect's topology re-declaration.
    pub fn on(&self, routing_key: impl Into<String>, retry: RetryOptions, handler: Handler) -> &Self {
        self.shared.registry.write().register(routing_key, handler, retry);
        self
    }

    /// Appends `middleware` to the end of the chain. Order of registration
    /// is the order middlewares run in.
    pub fn use_middleware(&self, middleware: Middleware) -> &Self {
        self.shared.middlewares.write().push(middleware);
        self
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ConnectionEvent> {
        self.shared.core.subscribe()
    }

    /// Declares topology and starts consuming. Idempotent: a second call
    /// while already listening is a no-op.
    pub async fn listen(&self, options: ListenOptions) -> Result<(), ConsumerError> {
        if self.shared.registry.read().is_empty() {
            warn!(app = %self.shared.app_name, "listen() called with no handlers registered");
        }
        *self.shared.prefetch.write() = options.prefetch;

        let setup = topology::build_setup(self.shared.clone());
        let (channel_id, _channel) = self.shared.core.create_channel(Some(setup)).await?;
        *self.shared.channel_id.write() = Some(channel_id);

        info!(app = %self.shared.app_name, exchange = %self.shared.exchange_name, "consumer listening");
        Ok(())
    }

    /// Cancels consumption and releases the channel. Waits up to
    /// `timeout_ms` for in-flight deliveries to finish their handler unless
    /// `force` is set, in which case it returns immediately and in-flight
    /// handlers are left to finish (or be dropped) on their own tasks.
    /// Calling this again after the consumer has already shut down is a
    /// no-op that reports `pending_count: 0`.
    pub async fn shutdown(&self, timeout_ms: u64, force: bool) -> ShutdownResult {
        self.shared.listening.store(false, Ordering::SeqCst);

        if let Some(tag) = self.shared.consumer_tag.write().take() {
            if let Some(channel) = self.live_channel().await {
                if let Err(e) = channel
                    .basic_cancel(&tag, lapin::options::BasicCancelOptions::default())
                    .await
                {
                    warn!(app = %self.shared.app_name, error = %e, "failed to cancel consumer on the broker");
                }
            }
        }

        let mut timed_out = false;
        if !force {
            let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
            while !self.shared.inflight.is_empty() && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(std::time::Duration::from_millis(25)).await;
            }
            if !self.shared.inflight.is_empty() {
                timed_out = true;
                warn!(
                    app = %self.shared.app_name,
                    remaining = self.shared.inflight.len(),
                    "shutdown timeout elapsed with deliveries still in flight"
                );
            }
        }
        let pending_count = self.shared.inflight.len();

        if let Some(id) = self.shared.channel_id.write().take() {
            self.shared.core.unregister_channel(id);
        }

        ShutdownResult { success: !timed_out, pending_count, timed_out }
    }

    pub(crate) fn connection_core(&self) -> &Arc<ConnectionCore> {
        &self.shared.core
    }

    async fn live_channel(&self) -> Option<lapin::Channel> {
        let id = (*self.shared.channel_id.read())?;
        self.shared.core.channel_handle(id).await
    }
}
