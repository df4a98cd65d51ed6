// Copyright (c) 2025 - Cowboy AI, Inc.
//! Configuration-Driven Flows
//!
//! Two sources bind flows to the host's configuration admin:
//!
//! - [`configuration`] follows a single pid. Each delivery replaces the
//!   stored dictionary; the previous token goes out on `removed` and a
//!   token for the new dictionary on `added`.
//! - [`configurations`] follows a factory pid, maintaining one token per
//!   factory instance.
//!
//! # First-Delivery Behavior of `configuration`
//!
//! The single-pid source pre-initializes its slot with a token carrying
//! no dictionary. The first delivery emits that empty token on `removed`
//! and does **not** emit on `added`; only the second delivery produces
//! the first `added` token. This is a known quirk, kept deliberately —
//! consumers that must react to the initial configuration should pair
//! the `removed` stream or use [`configurations`], which has no such
//! asymmetry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::channel::{Channel, Emitter};
use crate::flow::{CloseAction, Execution, Flow, StartAction};
use crate::host::{
    ConfigDictionary, ConfigurationListener, FactoryConfigurationListener, ListenerHandle,
};
use crate::token::Token;

/// Follow the configuration dictionary published under `pid`
///
/// `start` registers the listener; `close` unregisters it. Tokens carry
/// `Option<ConfigDictionary>`: the pre-initialized slot token carries
/// `None` and only ever surfaces on `removed`.
pub fn configuration(pid: &str) -> Flow<Option<ConfigDictionary>> {
    let pid = pid.to_string();
    Flow::from_operation(move |registry| {
        let added = Channel::new();
        let removed = Channel::new();

        let listener = Arc::new(SingletonConfigListener {
            added_source: added.emitter(),
            removed_source: removed.emitter(),
            slot: Mutex::new(ConfigSlot {
                token: Token::new(None),
                delivered: false,
            }),
        });

        let handle: Arc<Mutex<Option<Box<dyn ListenerHandle>>>> = Arc::new(Mutex::new(None));

        let start: StartAction = {
            let registry = Arc::clone(registry);
            let pid = pid.clone();
            let listener = Arc::clone(&listener);
            let handle = Arc::clone(&handle);
            Arc::new(move || {
                let registration = registry
                    .watch_configuration(&pid, listener.clone() as Arc<dyn ConfigurationListener>)?;
                *handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(registration);
                debug!(pid = %pid, "configuration listener registered");
                Ok(())
            })
        };

        let close: CloseAction = Arc::new(move || {
            let registration = handle.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(registration) = registration {
                registration.unregister();
            }
        });

        Ok(Execution::new(added, removed, start, close))
    })
}

struct ConfigSlot {
    token: Token<Option<ConfigDictionary>>,
    delivered: bool,
}

struct SingletonConfigListener {
    added_source: Emitter<Option<ConfigDictionary>>,
    removed_source: Emitter<Option<ConfigDictionary>>,
    slot: Mutex<ConfigSlot>,
}

impl ConfigurationListener for SingletonConfigListener {
    fn updated(&self, properties: ConfigDictionary) {
        let next = Token::new(Some(properties));
        let (previous, first) = {
            let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
            let previous = std::mem::replace(&mut slot.token, next.clone());
            let first = !slot.delivered;
            slot.delivered = true;
            (previous, first)
        };

        self.removed_source.emit(previous);
        if !first {
            self.added_source.emit(next);
        }
    }
}

/// Follow every instance of the factory configuration `factory_pid`
///
/// Each instance pid maps to its current token: an update replaces the
/// token (removed then added), a deletion removes it. Close unregisters
/// the listener, then drains every still-held token on `removed`.
pub fn configurations(factory_pid: &str) -> Flow<ConfigDictionary> {
    let factory_pid = factory_pid.to_string();
    Flow::from_operation(move |registry| {
        let added = Channel::new();
        let removed = Channel::new();

        let listener = Arc::new(FactoryConfigListener {
            added_source: added.emitter(),
            removed_source: removed.emitter(),
            entries: Mutex::new(HashMap::new()),
        });

        let handle: Arc<Mutex<Option<Box<dyn ListenerHandle>>>> = Arc::new(Mutex::new(None));

        let start: StartAction = {
            let registry = Arc::clone(registry);
            let factory_pid = factory_pid.clone();
            let listener = Arc::clone(&listener);
            let handle = Arc::clone(&handle);
            Arc::new(move || {
                let registration = registry.watch_factory_configurations(
                    &factory_pid,
                    listener.clone() as Arc<dyn FactoryConfigurationListener>,
                )?;
                *handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(registration);
                debug!(factory_pid = %factory_pid, "factory configuration listener registered");
                Ok(())
            })
        };

        let close: CloseAction = {
            let listener = Arc::clone(&listener);
            Arc::new(move || {
                let registration = handle.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(registration) = registration {
                    registration.unregister();
                }
                listener.drain();
            })
        };

        Ok(Execution::new(added, removed, start, close))
    })
}

struct FactoryConfigListener {
    added_source: Emitter<ConfigDictionary>,
    removed_source: Emitter<ConfigDictionary>,
    entries: Mutex<HashMap<String, Token<ConfigDictionary>>>,
}

impl FactoryConfigListener {
    /// Emit every still-held token on `removed`; order is unspecified.
    fn drain(&self) {
        let drained: Vec<Token<ConfigDictionary>> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, token)| token)
            .collect();
        for token in drained {
            self.removed_source.emit(token);
        }
    }
}

impl FactoryConfigurationListener for FactoryConfigListener {
    fn updated(&self, instance_pid: &str, properties: ConfigDictionary) {
        let token = Token::new(properties);
        let previous = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(instance_pid.to_string(), token.clone());
        if let Some(previous) = previous {
            self.removed_source.emit(previous);
        }
        self.added_source.emit(token);
    }

    fn deleted(&self, instance_pid: &str) {
        let token = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(instance_pid);
        if let Some(token) = token {
            self.removed_source.emit(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRegistry;
    use serde_json::json;

    fn dictionary(pairs: &[(&str, serde_json::Value)]) -> ConfigDictionary {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn observe<T: Clone + Send + Sync + 'static>(
        execution: &Execution<T>,
    ) -> (
        Arc<Mutex<Vec<Token<T>>>>,
        Arc<Mutex<Vec<Token<T>>>>,
    ) {
        let added = Arc::new(Mutex::new(Vec::new()));
        let removed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&added);
        execution
            .added()
            .subscribe(move |t| sink.lock().unwrap().push(t.clone()));
        let sink = Arc::clone(&removed);
        execution
            .removed()
            .subscribe(move |t| sink.lock().unwrap().push(t.clone()));
        (added, removed)
    }

    #[test]
    fn test_configuration_first_delivery_emits_only_on_removed() {
        let memory = MemoryRegistry::new();
        let registry = memory.context();

        let execution = configuration("svc.db").materialize(&registry).unwrap();
        let (added, removed) = observe(&execution);
        execution.start().unwrap();

        memory.update_configuration("svc.db", dictionary(&[("url", json!("pg://a"))]));

        // The pre-initialized empty token surfaces on removed; the first
        // delivery produces no added token.
        assert!(added.lock().unwrap().is_empty());
        let removed_guard = removed.lock().unwrap();
        assert_eq!(removed_guard.len(), 1);
        assert!(removed_guard[0].value().is_none());
    }

    #[test]
    fn test_configuration_second_delivery_pairs_with_first() {
        let memory = MemoryRegistry::new();
        let registry = memory.context();

        let execution = configuration("svc.db").materialize(&registry).unwrap();
        let (added, removed) = observe(&execution);
        execution.start().unwrap();

        memory.update_configuration("svc.db", dictionary(&[("url", json!("pg://a"))]));
        memory.update_configuration("svc.db", dictionary(&[("url", json!("pg://b"))]));

        let added = added.lock().unwrap();
        let removed = removed.lock().unwrap();

        // Second delivery: the first delivery's token goes out on
        // removed, the new dictionary arrives on added.
        assert_eq!(removed.len(), 2);
        assert_eq!(added.len(), 1);
        assert_eq!(
            removed[1].value().as_ref().and_then(|d| d.get("url")),
            Some(&json!("pg://a"))
        );
        assert_eq!(
            added[0].value().as_ref().and_then(|d| d.get("url")),
            Some(&json!("pg://b"))
        );
    }

    #[test]
    fn test_configuration_close_only_unregisters() {
        let memory = MemoryRegistry::new();
        let registry = memory.context();

        let execution = configuration("svc.db").materialize(&registry).unwrap();
        let (added, removed) = observe(&execution);
        execution.start().unwrap();

        memory.update_configuration("svc.db", dictionary(&[("url", json!("pg://a"))]));
        execution.close();

        let removed_before = removed.lock().unwrap().len();
        memory.update_configuration("svc.db", dictionary(&[("url", json!("pg://b"))]));

        assert!(added.lock().unwrap().is_empty());
        assert_eq!(removed.lock().unwrap().len(), removed_before);
    }

    #[test]
    fn test_configurations_update_and_delete() {
        let memory = MemoryRegistry::new();
        let registry = memory.context();

        let execution = configurations("pool.factory").materialize(&registry).unwrap();
        let (added, removed) = observe(&execution);
        execution.start().unwrap();

        memory.update_factory_configuration(
            "pool.factory",
            "x",
            dictionary(&[("size", json!(4))]),
        );
        assert_eq!(added.lock().unwrap().len(), 1);
        assert!(removed.lock().unwrap().is_empty());

        // Updating the same instance pid replaces its token.
        memory.update_factory_configuration(
            "pool.factory",
            "x",
            dictionary(&[("size", json!(8))]),
        );
        assert_eq!(added.lock().unwrap().len(), 2);
        assert_eq!(removed.lock().unwrap().len(), 1);
        assert_eq!(
            removed.lock().unwrap()[0].id(),
            added.lock().unwrap()[0].id()
        );

        memory.delete_factory_configuration("pool.factory", "x");
        assert_eq!(removed.lock().unwrap().len(), 2);
        assert_eq!(
            removed.lock().unwrap()[1].id(),
            added.lock().unwrap()[1].id()
        );
    }

    #[test]
    fn test_configurations_close_drains_held_tokens() {
        let memory = MemoryRegistry::new();
        let registry = memory.context();

        let execution = configurations("pool.factory").materialize(&registry).unwrap();
        let (added, removed) = observe(&execution);
        execution.start().unwrap();

        memory.update_factory_configuration(
            "pool.factory",
            "x",
            dictionary(&[("size", json!(4))]),
        );
        memory.update_factory_configuration(
            "pool.factory",
            "y",
            dictionary(&[("size", json!(16))]),
        );
        assert_eq!(added.lock().unwrap().len(), 2);

        execution.close();

        // Exactly the two held tokens drain on removed, in some order.
        let added = added.lock().unwrap();
        let removed = removed.lock().unwrap();
        assert_eq!(removed.len(), 2);
        let mut expected: Vec<_> = added.iter().map(|t| t.id()).collect();
        let mut drained: Vec<_> = removed.iter().map(|t| t.id()).collect();
        expected.sort();
        drained.sort();
        assert_eq!(expected, drained);
    }
}
