// Copyright (c) 2025 - Cowboy AI, Inc.
//! Property-Based Tests for Flow Invariants
//!
//! These tests drive flows with arbitrary registry operation sequences
//! and prove the invariants that must hold for every valid sequence:
//!
//! 1. **Identity preservation**: `map` never changes a token's identity.
//! 2. **Pairing**: every identity emitted on `removed` was previously
//!    emitted on `added`, at most once, and closing drains every live
//!    identity.
//! 3. **Cascade closure**: every inner execution a cascade spawns is
//!    closed exactly once by the time the outer execution closes.
//! 4. **Once restriction**: a `once` flow adds at most one token, ever.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use proptest::prelude::*;
use serde_json::json;

use cim_service_flow::{
    bundles, on_close, service_instance, service_references, services, BundleState, Channel,
    MemoryRegistry, ServiceProperties, ServiceRegistration, Token, TokenId,
};

// ============================================================================
// Operation Sequences
// ============================================================================

/// One step applied to the service registry
#[derive(Debug, Clone)]
enum RegistryOp {
    /// Register a fresh service carrying the payload
    Register(u8),
    /// Unregister the n-th live registration (modulo), if any
    Unregister(usize),
    /// Replace the properties of the n-th live registration (modulo)
    Update(usize),
}

fn registry_op() -> impl Strategy<Value = RegistryOp> {
    prop_oneof![
        any::<u8>().prop_map(RegistryOp::Register),
        (0usize..8).prop_map(RegistryOp::Unregister),
        (0usize..8).prop_map(RegistryOp::Update),
    ]
}

fn op_sequence() -> impl Strategy<Value = Vec<RegistryOp>> {
    prop::collection::vec(registry_op(), 0..40)
}

/// Apply one operation, maintaining the set of live registrations
fn apply_op(
    memory: &MemoryRegistry,
    live: &mut Vec<Arc<dyn ServiceRegistration>>,
    op: &RegistryOp,
    revision: &mut u32,
) {
    let registry = memory.context();
    match op {
        RegistryOp::Register(payload) => {
            let registration = registry
                .register_service(
                    "svc.prop",
                    service_instance(*payload),
                    ServiceProperties::new(),
                )
                .expect("registration succeeds");
            live.push(registration);
        }
        RegistryOp::Unregister(index) => {
            if live.is_empty() {
                return;
            }
            let registration = live.remove(index % live.len());
            registration.unregister().expect("still registered");
        }
        RegistryOp::Update(index) => {
            if live.is_empty() {
                return;
            }
            *revision += 1;
            let registration = &live[index % live.len()];
            let mut properties = ServiceProperties::new();
            properties.insert("revision".to_string(), json!(*revision));
            memory
                .update_service_properties(registration.reference().id(), properties)
                .expect("still registered");
        }
    }
}

/// Interleaved event log captured from one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Added(TokenId),
    Removed(TokenId),
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    /// Property: map preserves token identity through arbitrary chains
    #[test]
    fn prop_channel_map_preserves_identity(values in prop::collection::vec(any::<u32>(), 0..50)) {
        let channel = Channel::new();
        let mapped = channel.map(|x: u32| x as u64 + 1).map(|x| x.to_string());

        let upstream: Arc<Mutex<Vec<TokenId>>> = Arc::new(Mutex::new(Vec::new()));
        let downstream: Arc<Mutex<Vec<(TokenId, String)>>> = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&upstream);
        channel.subscribe(move |t| sink.lock().unwrap().push(t.id()));
        let sink = Arc::clone(&downstream);
        mapped.subscribe(move |t| sink.lock().unwrap().push((t.id(), t.value().clone())));

        let emitter = channel.emitter();
        for value in &values {
            emitter.emit(Token::new(*value));
        }

        let upstream = upstream.lock().unwrap();
        let downstream = downstream.lock().unwrap();
        prop_assert_eq!(upstream.len(), downstream.len());
        for (i, value) in values.iter().enumerate() {
            prop_assert_eq!(upstream[i], downstream[i].0);
            prop_assert_eq!(&downstream[i].1, &(*value as u64 + 1).to_string());
        }
    }

    /// Property: pairing holds under arbitrary registry churn
    ///
    /// Scanning the interleaved event log, every removal refers to a
    /// live identity, no identity is added twice, and closing the
    /// execution drains exactly the identities still live.
    #[test]
    fn prop_pairing_holds_under_registry_churn(ops in op_sequence()) {
        let memory = MemoryRegistry::new();
        let registry = memory.context();

        let execution = service_references("svc.prop", None)
            .materialize(&registry)
            .expect("materializes");

        let log: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        execution
            .added()
            .subscribe(move |t| sink.lock().unwrap().push(Event::Added(t.id())));
        let sink = Arc::clone(&log);
        execution
            .removed()
            .subscribe(move |t| sink.lock().unwrap().push(Event::Removed(t.id())));

        execution.start().expect("starts");

        let mut live_registrations = Vec::new();
        let mut revision = 0;
        for op in &ops {
            apply_op(&memory, &mut live_registrations, op, &mut revision);
        }

        execution.close();

        let log = log.lock().unwrap();
        let mut seen: HashSet<TokenId> = HashSet::new();
        let mut live: HashSet<TokenId> = HashSet::new();
        for event in log.iter() {
            match event {
                Event::Added(id) => {
                    prop_assert!(seen.insert(*id), "identity added twice");
                    live.insert(*id);
                }
                Event::Removed(id) => {
                    prop_assert!(live.remove(id), "removed identity was not live");
                }
            }
        }

        // Closing drained every identity that was still live.
        prop_assert!(live.is_empty(), "identities left live after close: {}", live.len());
    }

    /// Property: a cascade closes every inner execution exactly once
    #[test]
    fn prop_cascade_spawn_close_balance(ops in op_sequence()) {
        let memory = MemoryRegistry::new();
        let registry = memory.context();

        let spawned = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));

        let spawn_counter = Arc::clone(&spawned);
        let close_counter = Arc::clone(&closed);
        let flow = services("svc.prop", None).flat_map(move |_| {
            spawn_counter.fetch_add(1, Ordering::SeqCst);
            let close_counter = Arc::clone(&close_counter);
            on_close(move || {
                close_counter.fetch_add(1, Ordering::SeqCst);
            })
        });

        let execution = flow.materialize(&registry).expect("materializes");
        execution.start().expect("starts");

        let mut live_registrations = Vec::new();
        let mut revision = 0;
        for op in &ops {
            apply_op(&memory, &mut live_registrations, op, &mut revision);
        }

        // While running, at most one inner execution per live provider.
        let spawned_now = spawned.load(Ordering::SeqCst);
        let closed_now = closed.load(Ordering::SeqCst);
        prop_assert_eq!(spawned_now - closed_now, live_registrations.len());

        execution.close();
        prop_assert_eq!(spawned.load(Ordering::SeqCst), closed.load(Ordering::SeqCst));

        // Redundant close stays a no-op.
        execution.close();
        prop_assert_eq!(spawned.load(Ordering::SeqCst), closed.load(Ordering::SeqCst));
    }

    /// Property: once adds at most one token regardless of churn
    #[test]
    fn prop_once_adds_at_most_one_token(
        states in prop::collection::vec(
            prop_oneof![
                Just(BundleState::Installed),
                Just(BundleState::Active),
                Just(BundleState::Starting),
            ],
            0..30,
        )
    ) {
        let memory = MemoryRegistry::new();
        let registry = memory.context();

        let flow = bundles(BundleState::Active.into())
            .once()
            .map(|bundle| bundle.symbolic_name().to_string());
        let execution = flow.materialize(&registry).expect("materializes");

        let adds = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&adds);
        execution
            .added()
            .subscribe(move |_| {
                sink.fetch_add(1, Ordering::SeqCst);
            });

        execution.start().expect("starts");

        let mut any_active = false;
        for (i, state) in states.iter().enumerate() {
            memory.install_bundle(&format!("bundle-{i}"), *state);
            any_active |= *state == BundleState::Active;
        }

        let expected = usize::from(any_active);
        prop_assert_eq!(adds.load(Ordering::SeqCst), expected);

        execution.close();
        prop_assert_eq!(adds.load(Ordering::SeqCst), expected);
    }
}
