//! Per-delivery dispatch: decode, run the middleware chain, then ack and
//! route the outcome — success acks, failure either republishes to the
//! retry queue (incrementing `x-retry-count`) or copies to the DLQ once
//! retries are exhausted, acking the original delivery either way so it
//! never sits redelivered-in-place.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use lapin::options::{BasicAckOptions, BasicPublishOptions};
use lapin::types::AMQPValue;
use lapin::{BasicProperties, Channel};
use tracing::{error, warn};

use crate::middleware::{self, HandlerContext, ReplyFn};

use super::topology;
use super::ConsumerShared;

pub(super) const HEADER_RETRY_COUNT: &str = "x-retry-count";
pub(super) const HEADER_ORIGINAL_ROUTING_KEY: &str = "x-original-routing-key";

pub(super) async fn handle_delivery(shared: Arc<ConsumerShared>, channel: Channel, delivery: lapin::message::Delivery) {
    let dispatch_id = shared.next_dispatch_id.fetch_add(1, Ordering::SeqCst);
    shared.inflight.insert(dispatch_id, ());
    let _guard = InflightGuard { shared: shared.clone(), id: dispatch_id };

    let routing_key = delivery.routing_key.as_str().to_string();

    let Some(entry) = shared.registry.read().get(&routing_key).cloned() else {
        warn!(app = %shared.app_name, routing_key = %routing_key, "no handler registered for routing key, acking without processing");
        let _ = channel.basic_ack(delivery.delivery_tag, BasicAckOptions::default()).await;
        return;
    };

    let content: serde_json::Value = match serde_json::from_slice(&delivery.data) {
        Ok(v) => v,
        Err(e) => {
            error!(app = %shared.app_name, routing_key = %routing_key, error = %e, "malformed message body, acking without retry");
            let _ = channel.basic_ack(delivery.delivery_tag, BasicAckOptions::default()).await;
            return;
        }
    };

    let headers = header_map(&delivery);
    let ctx = HandlerContext { content, routing_key: routing_key.clone(), headers };
    let reply = build_reply_fn(&channel, &delivery);

    let middlewares = shared.middlewares.read().clone();
    let result = middleware::invoke(&middlewares, entry.handler.clone(), ctx, reply.clone()).await;

    match result {
        Ok(value) => {
            reply(value).await;
            if let Err(e) = channel.basic_ack(delivery.delivery_tag, BasicAckOptions::default()).await {
                error!(app = %shared.app_name, error = %e, "failed to ack a successfully handled delivery");
            }
        }
        Err(e) => {
            let retry_count = current_retry_count(&delivery);
            warn!(
                app = %shared.app_name,
                routing_key = %routing_key,
                retry_count,
                error = %e,
                "handler failed"
            );

            if entry.retry.enabled && retry_count < entry.retry.max_retries {
                republish_for_retry(&shared, &channel, &delivery, &routing_key, retry_count, entry.retry.retry_ttl_ms).await;
            } else {
                copy_to_dlq(&shared, &channel, &delivery, &routing_key, retry_count).await;
            }

            if let Err(e) = channel.basic_ack(delivery.delivery_tag, BasicAckOptions::default()).await {
                error!(app = %shared.app_name, error = %e, "failed to ack a delivery routed for retry/dead-lettering");
            }
        }
    }
}

struct InflightGuard {
    shared: Arc<ConsumerShared>,
    id: u64,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.shared.inflight.remove(&self.id);
    }
}

fn header_map(delivery: &lapin::message::Delivery) -> HashMap<String, String> {
    let mut out = HashMap::new();
    if let Some(table) = delivery.properties.headers() {
        for (key, value) in table.inner() {
            if let AMQPValue::LongString(s) = value {
                out.insert(key.to_string(), s.to_string());
            }
        }
    }
    out
}

fn current_retry_count(delivery: &lapin::message::Delivery) -> u32 {
    delivery
        .properties
        .headers()
        .as_ref()
        .and_then(|t| t.inner().get(HEADER_RETRY_COUNT))
        .and_then(|v| match v {
            AMQPValue::LongUInt(n) => Some(*n),
            AMQPValue::LongInt(n) => Some(*n as u32),
            _ => None,
        })
        .unwrap_or(0)
}

async fn republish_for_retry(
    shared: &ConsumerShared,
    channel: &Channel,
    delivery: &lapin::message::Delivery,
    routing_key: &str,
    retry_count: u32,
    retry_ttl_ms: u64,
) {
    let mut headers = delivery.properties.headers().clone().unwrap_or_default();
    headers.insert(HEADER_RETRY_COUNT.into(), AMQPValue::LongUInt(retry_count + 1));
    headers.insert(HEADER_ORIGINAL_ROUTING_KEY.into(), AMQPValue::LongString(routing_key.into()));

    let props = delivery
        .properties
        .clone()
        .with_headers(headers)
        .with_delivery_mode(2)
        .with_expiration(retry_ttl_ms.to_string().into());
    let publish = channel
        .basic_publish(
            "",
            &topology::retry_queue_name(&shared.app_name),
            BasicPublishOptions::default(),
            &delivery.data,
            props,
        )
        .await;

    if let Err(e) = publish {
        error!(app = %shared.app_name, error = %e, "failed to republish a delivery to the retry queue");
    }
}

async fn copy_to_dlq(
    shared: &ConsumerShared,
    channel: &Channel,
    delivery: &lapin::message::Delivery,
    routing_key: &str,
    retry_count: u32,
) {
    let mut headers = delivery.properties.headers().clone().unwrap_or_default();
    headers.insert(HEADER_RETRY_COUNT.into(), AMQPValue::LongUInt(retry_count));
    headers.insert(HEADER_ORIGINAL_ROUTING_KEY.into(), AMQPValue::LongString(routing_key.into()));

    let props = delivery.properties.clone().with_headers(headers).with_delivery_mode(2);
    let publish = channel
        .basic_publish(
            "",
            &topology::dlq_name(&shared.app_name),
            BasicPublishOptions::default(),
            &delivery.data,
            props,
        )
        .await;

    if let Err(e) = publish {
        error!(app = %shared.app_name, error = %e, "failed to copy an exhausted delivery to the dead-letter queue");
    }
}

/// Builds a reply closure bound to this delivery's `reply_to`/`correlation_id`.
/// Sending is a no-op when either is absent, so calling it unconditionally
/// after every dispatch is safe for non-RPC messages.
fn build_reply_fn(channel: &Channel, delivery: &lapin::message::Delivery) -> ReplyFn {
    let channel = channel.clone();
    let reply_to = delivery.properties.reply_to().clone();
    let correlation_id = delivery.properties.correlation_id().clone();

    Arc::new(move |value: serde_json::Value| -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let channel = channel.clone();
        let reply_to = reply_to.clone();
        let correlation_id = correlation_id.clone();
        Box::pin(async move {
            let Some(reply_to) = reply_to else { return };
            let body = match serde_json::to_vec(&value) {
                Ok(b) => b,
                Err(e) => {
                    error!(error = %e, "failed to serialize an RPC reply");
                    return;
                }
            };

            let mut props = BasicProperties::default();
            if let Some(cid) = correlation_id {
                props = props.with_correlation_id(cid);
            }

            if let Err(e) = channel
                .basic_publish(
                    "",
                    reply_to.as_str(),
                    BasicPublishOptions::default(),
                    &body,
                    props,
                )
                .await
            {
                error!(error = %e, "failed to publish an RPC reply");
            }
        })
    })
}
