//! Singleton-per-URI connection store. A Consumer and a Producer built
//! against the same `uri` share one `ConnectionCore`, and therefore one
//! reconnect loop and one event bus, the way a single `fc-queue::activemq`
//! connection backed multiple consumers/publishers in this corpus's
//! services. Avoids bare global mutable state by keying a process-wide
//! `DashMap` behind a `OnceLock`.

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;

use crate::config::ConnectionOptions;

use super::ConnectionCore;

static REGISTRY: OnceLock<DashMap<String, Arc<ConnectionCore>>> = OnceLock::new();

pub struct ConnectionRegistry;

impl ConnectionRegistry {
    fn map() -> &'static DashMap<String, Arc<ConnectionCore>> {
        REGISTRY.get_or_init(DashMap::new)
    }

    /// Returns the existing `ConnectionCore` for `options.uri`, or creates and
    /// registers a new one. `options` is only consulted on first creation;
    /// later calls for an already-registered URI ignore it, matching the
    /// "first caller wins" topology-sharing contract.
    pub fn get_or_create(options: ConnectionOptions) -> Arc<ConnectionCore> {
        Self::map()
            .entry(options.uri.clone())
            .or_insert_with(|| ConnectionCore::new(options.uri.clone(), options))
            .clone()
    }

    /// Drops the registry's handle to `uri` so a subsequent `get_or_create`
    /// builds a fresh `ConnectionCore`. Does not close the connection itself;
    /// callers close it first via `ConnectionCore::close`.
    pub fn remove(uri: &str) {
        Self::map().remove(uri);
    }

    #[cfg(test)]
    pub(crate) fn clear_for_test() {
        Self::map().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_uri_returns_the_same_core() {
        ConnectionRegistry::clear_for_test();
        let a = ConnectionRegistry::get_or_create(ConnectionOptions {
            uri: "amqp://test-a".to_string(),
            ..ConnectionOptions::default()
        });
        let b = ConnectionRegistry::get_or_create(ConnectionOptions {
            uri: "amqp://test-a".to_string(),
            ..ConnectionOptions::default()
        });
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn different_uris_return_different_cores() {
        ConnectionRegistry::clear_for_test();
        let a = ConnectionRegistry::get_or_create(ConnectionOptions {
            uri: "amqp://test-b".to_string(),
            ..ConnectionOptions::default()
        });
        let b = ConnectionRegistry::get_or_create(ConnectionOptions {
            uri: "amqp://test-c".to_string(),
            ..ConnectionOptions::default()
        });
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
