// Copyright (c) 2025 - Cowboy AI, Inc.
//! End-to-end dependency tracking scenarios
//!
//! These tests execute complete flows against `MemoryRegistry` and
//! assert the token sequences an application would observe.

mod fixtures;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;

use cim_service_flow::{
    bundles, configuration, configurations, just, on_close, register, run, service_instance,
    service_references, services, BundleState, MemoryRegistry, ServiceInstance,
    ServiceProperties,
};

use fixtures::{
    dictionary, properties, DbService, RecordingSink, CACHE_INTERFACE, DB_INTERFACE, DB_PID,
    POOL_FACTORY_PID,
};

fn db_id(service: &ServiceInstance) -> u32 {
    service
        .downcast_ref::<DbService>()
        .map(|db| db.id)
        .unwrap_or(0)
}

/// User Story: F1 - Static Values
///
/// As an application author
/// I want a flow that simply carries a value
/// So that constant wiring composes with dynamic wiring
///
/// ```mermaid
/// graph LR
///     Just[just 42] -->|added| Consumer
/// ```
#[test]
fn test_just_emits_once_and_closes_quietly() {
    let registry = MemoryRegistry::new().context();

    let flow = just(42);
    let execution = flow.materialize(&registry).unwrap();
    let sink = RecordingSink::attach(&execution);
    execution.start().unwrap();

    assert_eq!(sink.added_values(), vec![42]);
    assert_eq!(sink.removed_count(), 0);

    execution.close();
    assert_eq!(sink.added_count(), 1);
    assert_eq!(sink.removed_count(), 0);
}

/// User Story: F2 - Dependency Cascade
///
/// As an application author
/// I want derived computations per present service
/// So that wiring follows services as they come and go
///
/// ```mermaid
/// graph LR
///     Registry[Service Registry]
///     Registry -->|service a appears| InnerA[inner flow for a]
///     Registry -->|service b appears| InnerB[inner flow for b]
///     Registry -->|service a departs| TearA[tear down a's inner flow]
/// ```
#[test]
fn test_service_cascade_follows_registrations() {
    let memory = MemoryRegistry::new();
    let registry = memory.context();

    let flow = services(DB_INTERFACE, None).flat_map(|service| just(db_id(&service)));
    let execution = flow.materialize(&registry).unwrap();
    let sink = RecordingSink::attach(&execution);
    execution.start().unwrap();

    let a = registry
        .register_service(
            DB_INTERFACE,
            service_instance(DbService { id: 1 }),
            ServiceProperties::new(),
        )
        .unwrap();
    assert_eq!(sink.added_values(), vec![1]);

    let b = registry
        .register_service(
            DB_INTERFACE,
            service_instance(DbService { id: 2 }),
            ServiceProperties::new(),
        )
        .unwrap();
    assert_eq!(sink.added_values(), vec![1, 2]);
    assert_eq!(memory.active_checkouts(b.reference().id()), 1);

    a.unregister().unwrap();
    assert_eq!(sink.removed_count(), 1);
    assert_eq!(sink.removed_ids(), vec![sink.added_ids()[0]]);

    // Closing tears down b's inner execution and the tracker: the
    // checked-out instance is returned, and later registrations are
    // invisible.
    execution.close();
    assert_eq!(memory.active_checkouts(b.reference().id()), 0);
    registry
        .register_service(
            DB_INTERFACE,
            service_instance(DbService { id: 3 }),
            ServiceProperties::new(),
        )
        .unwrap();
    assert_eq!(sink.added_count(), 2);
}

/// User Story: F3 - Modification Visibility
///
/// As a subscriber
/// I want property changes surfaced as remove-then-add
/// So that every observed state has a single coherent identity
#[test]
fn test_modification_is_remove_then_add_with_fresh_identity() {
    let memory = MemoryRegistry::new();
    let registry = memory.context();

    let execution = service_references(DB_INTERFACE, None)
        .materialize(&registry)
        .unwrap();
    let sink = RecordingSink::attach(&execution);
    execution.start().unwrap();

    let registration = registry
        .register_service(DB_INTERFACE, service_instance(()), ServiceProperties::new())
        .unwrap();
    memory
        .update_service_properties(
            registration.reference().id(),
            properties(&[("tier", json!("gold"))]),
        )
        .unwrap();

    // add(A), remove(A), add(A') with A ≠ A'.
    assert_eq!(sink.added_count(), 2);
    assert_eq!(sink.removed_count(), 1);
    let added = sink.added_ids();
    let removed = sink.removed_ids();
    assert_eq!(removed[0], added[0]);
    assert_ne!(added[1], added[0]);
}

/// User Story: F4 - Factory Configuration Cleanup
///
/// As an application author
/// I want factory instances drained at teardown
/// So that per-instance wiring unwinds even when the platform never
/// delivered deletions
#[test]
fn test_configurations_drain_on_close() {
    let memory = MemoryRegistry::new();
    let registry = memory.context();

    let execution = configurations(POOL_FACTORY_PID)
        .materialize(&registry)
        .unwrap();
    let sink = RecordingSink::attach(&execution);
    execution.start().unwrap();

    memory.update_factory_configuration(
        POOL_FACTORY_PID,
        "x",
        dictionary(&[("size", json!(4))]),
    );
    memory.update_factory_configuration(
        POOL_FACTORY_PID,
        "y",
        dictionary(&[("size", json!(16))]),
    );
    assert_eq!(sink.added_count(), 2);
    assert_eq!(sink.removed_count(), 0);

    execution.close();

    // Exactly the two current tokens drain, in some order.
    let mut added = sink.added_ids();
    let mut removed = sink.removed_ids();
    added.sort();
    removed.sort();
    assert_eq!(added, removed);
}

/// User Story: F5 - First-Match Restriction
///
/// As an application author
/// I want to bind to exactly one of many equivalent providers
/// So that singleton wiring stays stable while providers churn
///
/// ```mermaid
/// graph LR
///     Bundles[active bundles X, Y, Z …] -->|first only| Once[once]
///     Once -->|X| Wiring[singleton wiring]
/// ```
#[test]
fn test_once_binds_to_the_first_bundle_only() {
    let memory = MemoryRegistry::new();
    let registry = memory.context();

    let x = memory.install_bundle("bundle-x", BundleState::Active);
    let y = memory.install_bundle("bundle-y", BundleState::Active);

    let flow = bundles(BundleState::Active.into())
        .once()
        .flat_map(|bundle| just(bundle.id()));
    let execution = flow.materialize(&registry).unwrap();
    let sink = RecordingSink::attach(&execution);
    execution.start().unwrap();

    // Exactly one binding; which of x/y wins depends on tracker
    // enumeration order.
    assert_eq!(sink.added_count(), 1);
    let chosen_id = sink.added_values()[0];
    assert!(chosen_id == x.id() || chosen_id == y.id());

    memory.install_bundle("bundle-z", BundleState::Active);
    memory.install_bundle("bundle-w", BundleState::Active);
    assert_eq!(sink.added_count(), 1);

    // Stopping the chosen bundle yields no removed token.
    memory
        .set_bundle_state(chosen_id, BundleState::Stopping)
        .unwrap();
    assert_eq!(sink.removed_count(), 0);
}

/// User Story: F6 - Idempotent Shutdown
///
/// As an operator
/// I want repeated close calls to be harmless
/// So that shutdown paths can overlap safely
#[test]
fn test_top_level_close_runs_once() {
    let registry = MemoryRegistry::new().context();

    let closes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closes);
    let flow = on_close(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let execution = run(&registry, &flow).unwrap();
    execution.close();
    execution.close();
    execution.close();

    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

/// Cascade closure: closing the outer execution closes every live inner
/// execution exactly once, and at most one inner execution is ever live
/// per outer identity.
#[test]
fn test_cascade_spawns_and_closes_inner_executions_exactly_once() {
    let memory = MemoryRegistry::new();
    let registry = memory.context();

    let spawned = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicUsize::new(0));

    let spawn_counter = Arc::clone(&spawned);
    let close_counter = Arc::clone(&closed);
    let flow = services(CACHE_INTERFACE, None).flat_map(move |_| {
        spawn_counter.fetch_add(1, Ordering::SeqCst);
        let close_counter = Arc::clone(&close_counter);
        on_close(move || {
            close_counter.fetch_add(1, Ordering::SeqCst);
        })
    });

    let execution = run(&registry, &flow).unwrap();

    let a = registry
        .register_service(CACHE_INTERFACE, service_instance(1u8), Default::default())
        .unwrap();
    registry
        .register_service(CACHE_INTERFACE, service_instance(2u8), Default::default())
        .unwrap();
    assert_eq!(spawned.load(Ordering::SeqCst), 2);
    assert_eq!(closed.load(Ordering::SeqCst), 0);

    // A modification closes the old inner execution before spawning the
    // replacement: never two live inners for one provider.
    memory
        .update_service_properties(a.reference().id(), properties(&[("v", json!(2))]))
        .unwrap();
    assert_eq!(spawned.load(Ordering::SeqCst), 3);
    assert_eq!(closed.load(Ordering::SeqCst), 1);

    execution.close();
    assert_eq!(closed.load(Ordering::SeqCst), spawned.load(Ordering::SeqCst));

    execution.close();
    assert_eq!(closed.load(Ordering::SeqCst), spawned.load(Ordering::SeqCst));
}

/// User Story: F7 - Configuration Hot-Swap
///
/// As an application author
/// I want configuration replacements surfaced as token swaps
/// So that dependent wiring rebuilds against the new dictionary
///
/// The single-pid source keeps its known first-delivery asymmetry: the
/// pre-initialized empty token drains on `removed` and the first
/// dictionary produces no `added` token.
#[test]
fn test_configuration_swaps_tokens_per_delivery() {
    let memory = MemoryRegistry::new();
    let registry = memory.context();

    let execution = configuration(DB_PID).materialize(&registry).unwrap();
    let sink = RecordingSink::attach(&execution);
    execution.start().unwrap();

    memory.update_configuration(DB_PID, dictionary(&[("url", json!("pg://a"))]));
    assert_eq!(sink.added_count(), 0);
    let removed = sink.removed_tokens();
    assert_eq!(removed.len(), 1);
    assert!(removed[0].value().is_none());

    memory.update_configuration(DB_PID, dictionary(&[("url", json!("pg://b"))]));
    let added = sink.added_tokens();
    assert_eq!(added.len(), 1);
    assert_eq!(
        added[0].value().as_ref().and_then(|d| d.get("url")),
        Some(&json!("pg://b"))
    );
    assert_eq!(sink.removed_count(), 2);
}

/// `just(v).then(q)` is transparent: observers see exactly `q`'s tokens.
#[test]
fn test_just_then_is_transparent() {
    let memory = MemoryRegistry::new();
    let registry = memory.context();

    let direct = register(
        CACHE_INTERFACE,
        service_instance("cache"),
        ServiceProperties::new(),
    );
    let sequenced = just(0).then(direct.clone().map(|_| "registered"));

    let execution = sequenced.materialize(&registry).unwrap();
    let sink = RecordingSink::attach(&execution);
    execution.start().unwrap();

    assert_eq!(sink.added_values(), vec!["registered"]);
    assert_eq!(memory.service_count(CACHE_INTERFACE), 1);

    execution.close();
    assert_eq!(memory.service_count(CACHE_INTERFACE), 0);
}
