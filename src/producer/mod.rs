//! Producer: publishes messages and, for request/response use, correlates
//! replies delivered to an exclusive per-instance reply queue. Grounded on
//! `fc-queue::activemq`'s publish path for the connect/publish shape and on
//! the reactor-task pattern in the corpus's RPC-client reference material,
//! adapted to a `DashMap`-backed pending-request registry so the publish
//! call site, the reply-consumer task, and any timeout task can all touch
//! it concurrently without a single reactor owning it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{ConnectionOptions, SendOptions, ShutdownOptions};
use crate::connection::{ConnectionCore, ConnectionRegistry};
use crate::error::ProducerError;
use crate::exchange_guard;

struct PendingRequest {
    resolver: oneshot::Sender<Result<serde_json::Value, ProducerError>>,
    timeout_task: Option<JoinHandle<()>>,
}

pub(crate) struct ProducerShared {
    exchange_name: String,
    core: Arc<ConnectionCore>,
    channel_id: RwLock<Option<u64>>,
    channel: RwLock<Option<Channel>>,
    reply_queue: RwLock<Option<String>>,
    pending: DashMap<Uuid, PendingRequest>,
    connected: AtomicBool,
    cancel: CancellationToken,
}

/// Result of a `Producer`/`Consumer` shutdown, and of the aggregate
/// `ShutdownOrchestrator` run across both.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShutdownResult {
    pub success: bool,
    pub pending_count: usize,
    pub timed_out: bool,
}

/// A publisher bound to one exchange, optionally used for RPC via `send`.
/// Cheap to clone; every clone shares the same channel and pending-request
/// registry.
#[derive(Clone)]
pub struct Producer {
    shared: Arc<ProducerShared>,
}

impl Producer {
    pub fn new(exchange_name: impl Into<String>, options: ConnectionOptions) -> Self {
        let core = ConnectionRegistry::get_or_create(options);
        Self {
            shared: Arc::new(ProducerShared {
                exchange_name: exchange_name.into(),
                core,
                channel_id: RwLock::new(None),
                channel: RwLock::new(None),
                reply_queue: RwLock::new(None),
                pending: DashMap::new(),
                connected: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Declares the exchange, creates this instance's exclusive reply
    /// queue, and installs the reply-matching consumer. Re-run
    /// automatically by `ConnectionCore` after every reconnect.
    pub async fn connect(&self) -> Result<(), ProducerError> {
        let setup = build_setup(self.shared.clone());
        let (channel_id, channel) = self.shared.core.create_channel(Some(setup)).await?;
        *self.shared.channel_id.write() = Some(channel_id);
        *self.shared.channel.write() = Some(channel);
        self.shared.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Publishes `message` to `routing_key` and, if `options.timeout_ms` is
    /// `Some`, waits for a correlated reply or the timeout, whichever comes
    /// first.
    pub async fn send<T: DeserializeOwned>(
        &self,
        routing_key: &str,
        message: impl Serialize,
        options: SendOptions,
    ) -> Result<T, ProducerError> {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(ProducerError::NotConnected);
        }
        let channel = self.shared.channel.read().clone().ok_or(ProducerError::NotConnected)?;
        let reply_queue = self.shared.reply_queue.read().clone().ok_or(ProducerError::NotConnected)?;

        let correlation_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();

        let timeout_task = options.timeout_ms.map(|ms| {
            let shared = self.shared.clone();
            let cid = correlation_id;
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
                if let Some((_, pending)) = shared.pending.remove(&cid) {
                    let _ = pending.resolver.send(Err(ProducerError::RequestTimeout));
                }
            })
        });

        self.shared.pending.insert(
            correlation_id,
            PendingRequest { resolver: tx, timeout_task },
        );

        let body = serde_json::to_vec(&message)?;
        let mut props = BasicProperties::default()
            .with_reply_to(reply_queue.into())
            .with_correlation_id(correlation_id.to_string().into())
            .with_delivery_mode(if options.persistent { 2 } else { 1 });

        if options.framework_compat {
            props = props.with_message_id(correlation_id.to_string().into());
        }

        if let Some(headers) = &options.headers {
            let mut table = FieldTable::default();
            for (k, v) in headers {
                table.insert(k.as_str().into(), AMQPValue::LongString(v.as_str().into()));
            }
            props = props.with_headers(table);
        }

        if let Err(e) = channel
            .basic_publish(&self.shared.exchange_name, routing_key, BasicPublishOptions::default(), &body, props)
            .await
        {
            if let Some((_, pending)) = self.shared.pending.remove(&correlation_id) {
                if let Some(handle) = pending.timeout_task {
                    handle.abort();
                }
            }
            return Err(ProducerError::Publish(e.to_string()));
        }

        let cancel = self.shared.cancel.clone();
        tokio::select! {
            result = rx => {
                match result {
                    Ok(Ok(value)) => Ok(serde_json::from_value(value)?),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(ProducerError::ShutdownCancelled),
                }
            }
            _ = cancel.cancelled() => Err(ProducerError::ShutdownCancelled),
        }
    }

    /// Alias for `shutdown(ShutdownOptions { force: true, .. })`.
    pub async fn close(&self) -> ShutdownResult {
        self.shutdown(ShutdownOptions { force: true, ..Default::default() }).await
    }

    pub async fn shutdown(&self, options: ShutdownOptions) -> ShutdownResult {
        self.shared.connected.store(false, Ordering::SeqCst);

        let pending_count = self.shared.pending.len();
        if options.force {
            self.shared.cancel.cancel();
            let ids: Vec<Uuid> = self.shared.pending.iter().map(|e| *e.key()).collect();
            for id in ids {
                if let Some((_, pending)) = self.shared.pending.remove(&id) {
                    if let Some(handle) = pending.timeout_task {
                        handle.abort();
                    }
                    let _ = pending.resolver.send(Err(ProducerError::ShutdownCancelled));
                }
            }
        } else if pending_count > 0 {
            warn!(
                orphaned = pending_count,
                "producer shutdown without force left pending requests unresolved"
            );
        }

        if let Some(id) = self.shared.channel_id.write().take() {
            self.shared.core.unregister_channel(id);
        }
        *self.shared.channel.write() = None;

        ShutdownResult { success: true, pending_count, timed_out: false }
    }

    pub(crate) fn connection_core(&self) -> &Arc<ConnectionCore> {
        &self.shared.core
    }
}

fn build_setup(shared: Arc<ProducerShared>) -> crate::connection::SetupFn {
    Arc::new(move |channel: Channel| {
        let shared = shared.clone();
        Box::pin(async move { run_setup(shared, channel).await })
    })
}

async fn run_setup(shared: Arc<ProducerShared>, channel: Channel) -> Result<(), crate::error::ConnectionError> {
    exchange_guard::assert_exchange(&channel, &shared.exchange_name).await?;

    let queue = channel
        .queue_declare(
            "",
            QueueDeclareOptions { exclusive: true, durable: false, ..Default::default() },
            FieldTable::default(),
        )
        .await?;
    let queue_name = queue.name().to_string();
    *shared.reply_queue.write() = Some(queue_name.clone());

    let consumer_tag = format!("reply-{}", Uuid::new_v4());
    let mut consumer = channel
        .basic_consume(
            &queue_name,
            &consumer_tag,
            BasicConsumeOptions { no_ack: false, ..Default::default() },
            FieldTable::default(),
        )
        .await?;

    let shared_for_loop = shared.clone();
    tokio::spawn(async move {
        while let Some(delivery_result) = consumer.next().await {
            let Ok(delivery) = delivery_result else { break };

            let correlation_id = delivery
                .properties
                .correlation_id()
                .as_ref()
                .and_then(|s| Uuid::parse_str(s.as_str()).ok());

            if let Some(cid) = correlation_id {
                if let Some((_, pending)) = shared_for_loop.pending.remove(&cid) {
                    if let Some(handle) = pending.timeout_task {
                        handle.abort();
                    }
                    let decoded = serde_json::from_slice::<serde_json::Value>(&delivery.data)
                        .map_err(ProducerError::from);
                    let _ = pending.resolver.send(decoded);
                } else {
                    debug!(correlation_id = %cid, "reply arrived with no matching pending request, dropping");
                }
            } else {
                debug!("reply arrived without a parseable correlation id, dropping");
            }

            let _ = delivery.ack(BasicAckOptions::default()).await;
        }
    });

    Ok(())
}
