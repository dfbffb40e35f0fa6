//! `HandlerRegistry`: the routing-key to handler map a `Consumer` builds up
//! via repeated calls to `on()` before `listen()`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::config::RetryOptions;
use crate::middleware::{HandlerContext, HandlerResult, ReplyFn};

pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;
pub type Handler = Arc<dyn Fn(HandlerContext, ReplyFn) -> HandlerFuture + Send + Sync>;

#[derive(Clone)]
pub struct HandlerEntry {
    pub handler: Handler,
    pub retry: RetryOptions,
}

/// Last registration for a given routing key wins. Iteration order carries
/// no meaning; the key set is read once, at topology declaration time, to
/// bind the main queue.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    entries: HashMap<String, HandlerEntry>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, routing_key: impl Into<String>, handler: Handler, retry: RetryOptions) {
        self.entries.insert(routing_key.into(), HandlerEntry { handler, retry });
    }

    pub fn get(&self, routing_key: &str) -> Option<&HandlerEntry> {
        self.entries.get(routing_key)
    }

    pub fn routing_keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop_handler() -> Handler {
        Arc::new(|_ctx, _reply| Box::pin(async { Ok(json!({})) }))
    }

    #[test]
    fn last_registration_for_a_key_wins() {
        let mut registry = HandlerRegistry::new();
        registry.register("orders.created", noop_handler(), RetryOptions::default());
        let mut second = RetryOptions::default();
        second.max_retries = 9;
        registry.register("orders.created", noop_handler(), second);

        assert_eq!(registry.get("orders.created").unwrap().retry.max_retries, 9);
        assert_eq!(registry.routing_keys().count(), 1);
    }

    #[test]
    fn unknown_key_returns_none() {
        let registry = HandlerRegistry::new();
        assert!(registry.get("nope").is_none());
    }
}
