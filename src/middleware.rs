//! Composable middleware chain around a Consumer's terminal (user) handler.
//!
//! Middlewares run in registration order; any middleware may short-circuit
//! by not invoking `next`, may call `reply` before/after/never invoking
//! `next`, and any error returned aborts the remainder of the chain — the
//! Consumer's dispatch loop catches it for retry/DLQ routing.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;

use crate::registry::{Handler, HandlerFuture};

#[derive(Error, Debug)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

pub type HandlerResult = Result<serde_json::Value, HandlerError>;

/// What a handler or middleware sees for a single delivery.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub content: serde_json::Value,
    pub routing_key: String,
    pub headers: HashMap<String, String>,
}

/// Sends a reply over the delivery's `reply_to`/`correlation_id`, if present;
/// a no-op otherwise. Independent of chain completion — callable any number
/// of times, before or after `next`.
pub type ReplyFn = Arc<dyn Fn(serde_json::Value) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// An owned, call-once continuation to the remainder of the chain (or, at
/// the tail, the terminal handler). A fresh chain is built per delivery, so
/// `FnOnce` is sufficient and avoids cloning closures per dispatch.
pub type Next = Box<dyn FnOnce(HandlerContext, ReplyFn) -> HandlerFuture + Send>;

pub type Middleware = Arc<dyn Fn(HandlerContext, Next, ReplyFn) -> HandlerFuture + Send + Sync>;

/// Binds an ordered list of middlewares around a terminal handler and
/// immediately invokes the resulting chain for one delivery. Called once per
/// dispatch by `crate::consumer::dispatch`.
pub fn invoke(
    middlewares: &[Middleware],
    terminal: Handler,
    ctx: HandlerContext,
    reply: ReplyFn,
) -> HandlerFuture {
    let mut next: Next = Box::new(move |ctx, reply| terminal(ctx, reply));

    for mw in middlewares.iter().rev() {
        let mw = mw.clone();
        let inner = next;
        next = Box::new(move |ctx, reply| mw(ctx, inner, reply));
    }

    next(ctx, reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop_reply() -> ReplyFn {
        Arc::new(|_v| Box::pin(async {}))
    }

    fn terminal_ok() -> Handler {
        Arc::new(|_ctx, _reply| Box::pin(async { Ok(json!({"ok": true})) }))
    }

    fn ctx() -> HandlerContext {
        HandlerContext {
            content: json!({}),
            routing_key: "k".to_string(),
            headers: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn middlewares_run_in_registration_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mk = |label: &'static str, order: Arc<std::sync::Mutex<Vec<&'static str>>>| -> Middleware {
            Arc::new(move |c, next, reply| {
                let order = order.clone();
                Box::pin(async move {
                    order.lock().unwrap().push(label);
                    next(c, reply).await
                })
            })
        };

        let mws = vec![mk("first", order.clone()), mk("second", order.clone())];
        let result = invoke(&mws, terminal_ok(), ctx(), noop_reply()).await;

        assert!(result.is_ok());
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn a_middleware_that_skips_next_short_circuits_the_chain() {
        let terminal_calls = Arc::new(AtomicUsize::new(0));
        let calls = terminal_calls.clone();
        let terminal: Handler = Arc::new(move |_c, _r| {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(json!({})) })
        });

        let short_circuit: Middleware = Arc::new(|_c, _next, _reply| {
            Box::pin(async { Ok(json!({"short": true})) })
        });

        let result = invoke(&[short_circuit], terminal, ctx(), noop_reply()).await;

        assert_eq!(result.unwrap()["short"], json!(true));
        assert_eq!(terminal_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn an_error_aborts_the_remainder_of_the_chain() {
        let second_called = Arc::new(AtomicUsize::new(0));

        let failing: Middleware = Arc::new(|_c, _next, _reply| {
            Box::pin(async { Err(HandlerError::new("boom")) })
        });

        let second_flag = second_called.clone();
        let second: Middleware = Arc::new(move |c, next, reply| {
            second_flag.fetch_add(1, Ordering::SeqCst);
            next(c, reply)
        });

        let result = invoke(&[failing, second], terminal_ok(), ctx(), noop_reply()).await;

        assert!(result.is_err());
        assert_eq!(second_called.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reply_can_be_called_independently_of_chain_completion() {
        let reply_seen = Arc::new(std::sync::Mutex::new(None));
        let seen = reply_seen.clone();
        let reply: ReplyFn = Arc::new(move |v| {
            let seen = seen.clone();
            Box::pin(async move {
                *seen.lock().unwrap() = Some(v);
            })
        });

        let mw: Middleware = Arc::new(|c, next, reply| {
            Box::pin(async move {
                reply(json!({"early": true})).await;
                next(c, reply).await
            })
        });

        let result = invoke(&[mw], terminal_ok(), ctx(), reply).await;
        assert!(result.is_ok());
        assert_eq!(*reply_seen.lock().unwrap(), Some(json!({"early": true})));
    }
}
