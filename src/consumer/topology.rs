//! Queue/exchange topology for a Consumer.
//!
//! A retry is never requeued in place and never slept on client-side: a
//! failed delivery is republished straight into the retry queue (via the
//! default exchange, by queue name) carrying `x-retry-count` and
//! `x-original-routing-key` headers and a per-message `expiration`. When
//! that TTL elapses the broker dead-letters it to a small *return* queue
//! bound by one fixed literal key; this Consumer also consumes that queue
//! and republishes each arrival to the primary exchange under its original
//! routing key, landing it back on the main queue. Routing this way (queue
//! name, then one fixed literal key) keeps every binding an exact match —
//! no wildcard pattern is needed on the direct exchange `ExchangeGuard`
//! declares, and a retry never also lands on the main queue immediately the
//! way a direct wildcard-bound retry queue on the same exchange would.
//!
//! Declared fresh on every channel — initial `listen()` and every
//! post-reconnect `ConnectionCore` setup re-run — so it must be idempotent.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::StreamExt;
use lapin::options::{BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel};
use tracing::{error, info, warn};

use crate::connection::SetupFn;
use crate::error::ConnectionError;
use crate::exchange_guard;

use super::dispatch::{self, HEADER_ORIGINAL_ROUTING_KEY};
use super::ConsumerShared;

pub(super) fn dlq_name(app_name: &str) -> String {
    format!("{app_name}.dlq")
}

pub(super) fn retry_queue_name(app_name: &str) -> String {
    format!("{app_name}.retry")
}

pub(super) fn return_queue_name(app_name: &str) -> String {
    format!("{app_name}.retry.return")
}

fn return_routing_key(app_name: &str) -> String {
    format!("{app_name}.retry.return")
}

/// Builds the closure `ConnectionCore::create_channel` runs on every new
/// channel for this Consumer (first connect and every reconnect).
pub(super) fn build_setup(shared: Arc<ConsumerShared>) -> SetupFn {
    Arc::new(move |channel: Channel| {
        let shared = shared.clone();
        Box::pin(async move { run_setup(shared, channel).await })
    })
}

async fn run_setup(shared: Arc<ConsumerShared>, channel: Channel) -> Result<(), ConnectionError> {
    declare_topology(&shared, &channel).await.map_err(ConnectionError::from)?;

    if let Some(prefetch) = *shared.prefetch.read() {
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(ConnectionError::from)?;
    }

    let main_tag = format!("{}-{}", shared.app_name, uuid::Uuid::new_v4());
    let main_consumer = channel
        .basic_consume(
            &shared.app_name,
            &main_tag,
            BasicConsumeOptions { no_ack: false, ..Default::default() },
            FieldTable::default(),
        )
        .await
        .map_err(ConnectionError::from)?;

    let return_tag = format!("{}-return-{}", shared.app_name, uuid::Uuid::new_v4());
    let return_consumer = channel
        .basic_consume(
            &return_queue_name(&shared.app_name),
            &return_tag,
            BasicConsumeOptions { no_ack: false, ..Default::default() },
            FieldTable::default(),
        )
        .await
        .map_err(ConnectionError::from)?;

    *shared.consumer_tag.write() = Some(main_tag);

    let was_listening = shared.listening.swap(true, Ordering::SeqCst);
    if was_listening {
        info!(app = %shared.app_name, "re-installed consumer after reconnect");
    }

    spawn_consume_loop(shared.clone(), channel.clone(), main_consumer);
    spawn_return_loop(shared, channel, return_consumer);
    Ok(())
}

async fn declare_topology(shared: &ConsumerShared, channel: &Channel) -> Result<(), lapin::Error> {
    exchange_guard::assert_exchange(channel, &shared.exchange_name).await?;

    channel
        .queue_declare(
            &dlq_name(&shared.app_name),
            QueueDeclareOptions { durable: true, ..Default::default() },
            FieldTable::default(),
        )
        .await?;

    // No queue-wide `x-message-ttl`: each republish sets its own per-message
    // `expiration` from that route's `RetryOptions::retry_ttl_ms` (see
    // `dispatch::republish_for_retry`), so one shared retry queue still
    // honors a different delay per routing key.
    let mut retry_args = FieldTable::default();
    retry_args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(shared.exchange_name.clone().into()),
    );
    retry_args.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(return_routing_key(&shared.app_name).into()),
    );
    channel
        .queue_declare(
            &retry_queue_name(&shared.app_name),
            QueueDeclareOptions { durable: true, ..Default::default() },
            retry_args,
        )
        .await?;

    channel
        .queue_declare(
            &return_queue_name(&shared.app_name),
            QueueDeclareOptions { durable: true, ..Default::default() },
            FieldTable::default(),
        )
        .await?;
    channel
        .queue_bind(
            &return_queue_name(&shared.app_name),
            &shared.exchange_name,
            &return_routing_key(&shared.app_name),
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    channel
        .queue_declare(
            &shared.app_name,
            QueueDeclareOptions { durable: true, ..Default::default() },
            FieldTable::default(),
        )
        .await?;

    for routing_key in shared.registry.read().routing_keys() {
        channel
            .queue_bind(
                &shared.app_name,
                &shared.exchange_name,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
    }

    Ok(())
}

/// Each delivery is dispatched onto its own task so handler latency for one
/// message never blocks the stream from handing out the next; concurrency
/// is bounded by `basic_qos` prefetch on the broker side.
fn spawn_consume_loop(shared: Arc<ConsumerShared>, channel: Channel, mut consumer: lapin::Consumer) {
    tokio::spawn(async move {
        while let Some(delivery_result) = consumer.next().await {
            match delivery_result {
                Ok(delivery) => {
                    let shared = shared.clone();
                    let channel = channel.clone();
                    tokio::spawn(async move {
                        dispatch::handle_delivery(shared, channel, delivery).await;
                    });
                }
                Err(e) => {
                    error!(app = %shared.app_name, error = %e, "consumer stream error, stopping this channel's dispatch loop");
                    break;
                }
            }
        }
    });
}

/// Forwards every dead-lettered retry back onto the primary exchange under
/// its original routing key, so it lands on the main queue exactly as if it
/// had just been published there.
fn spawn_return_loop(shared: Arc<ConsumerShared>, channel: Channel, mut consumer: lapin::Consumer) {
    tokio::spawn(async move {
        while let Some(delivery_result) = consumer.next().await {
            match delivery_result {
                Ok(delivery) => {
                    let headers = delivery.properties.headers().clone().unwrap_or_default();
                    let original_key = headers
                        .inner()
                        .get(HEADER_ORIGINAL_ROUTING_KEY)
                        .and_then(|v| match v {
                            AMQPValue::LongString(s) => Some(s.to_string()),
                            _ => None,
                        });

                    match original_key {
                        Some(routing_key) => {
                            let props = BasicProperties::default()
                                .with_headers(headers)
                                .with_delivery_mode(2);
                            let publish = channel
                                .basic_publish(
                                    &shared.exchange_name,
                                    &routing_key,
                                    BasicPublishOptions::default(),
                                    &delivery.data,
                                    props,
                                )
                                .await;
                            if let Err(e) = publish {
                                error!(app = %shared.app_name, error = %e, "failed to return a retried message to the main queue");
                            }
                        }
                        None => {
                            warn!(app = %shared.app_name, "retried message missing its original routing key header, dropping");
                        }
                    }

                    if let Err(e) = channel.basic_ack(delivery.delivery_tag, Default::default()).await {
                        error!(app = %shared.app_name, error = %e, "failed to ack a returned retry message");
                    }
                }
                Err(e) => {
                    error!(app = %shared.app_name, error = %e, "return-queue consumer stream error, stopping");
                    break;
                }
            }
        }
    });
}
