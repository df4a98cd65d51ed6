// Copyright (c) 2025 - Cowboy AI, Inc.
//! Registry-Backed Flow Sources
//!
//! The primitives in this module bind flows to the host registry:
//! registering a service, tracking references, checking out instances,
//! holding prototype handles, and following bundle lifecycles.
//!
//! # Single-Valued vs Multi-Valued Sources
//!
//! [`register`] and [`service_references`] produce plain [`Flow`]s.
//! [`services`], [`prototypes`], and [`bundles`] produce a
//! [`MultiFlow`]: a flow whose source is a registry view that naturally
//! emits many concurrent tokens. A `MultiFlow` composes like any flow,
//! but its `flat_map` is *integrated* — one host tracker both observes
//! the registry and drives the cascade, instead of a tracker feeding a
//! second identity table.
//!
//! ```text
//! registry event ──► tracker ──► checkout ──► spawn inner flow
//!                       │                          │
//!                       └── departure ──► close ───┘──► removed token
//! ```
//!
//! # Modification Semantics
//!
//! Every source translates a host `modified` callback into a removal of
//! the old token followed by an addition carrying a fresh identity.
//! Subscribers cannot distinguish a modification from a departure and
//! re-appearance; this is by design.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::channel::{Channel, Emitter};
use crate::errors::FlowResult;
use crate::flow::{just, nothing, CloseAction, Execution, Flow, StartAction};
use crate::host::{
    Bundle, BundleId, BundleObserver, BundleStateMask, HostContext, ServiceId, ServiceInstance,
    ServiceObjects, ServiceObserver, ServiceProperties, ServiceRef, ServiceRegistration,
    TrackerHandle,
};
use crate::token::Token;

/// Register a service for the lifetime of the flow
///
/// Registration happens when the flow is materialized (before start);
/// `start` emits a token carrying the registration handle; close
/// withdraws the registration, swallowing any error from the host.
///
/// # Errors (at materialization)
///
/// Propagates the host's registration failure.
pub fn register(
    interface: &str,
    instance: ServiceInstance,
    properties: ServiceProperties,
) -> Flow<Arc<dyn ServiceRegistration>> {
    let interface = interface.to_string();
    Flow::from_operation(move |registry| {
        let registration =
            registry.register_service(&interface, Arc::clone(&instance), properties.clone())?;
        debug!(interface = %interface, "service registered by flow");

        let added = Channel::new();
        let emitter = added.emitter();
        let token = Token::new(Arc::clone(&registration));
        let start: StartAction = Arc::new(move || {
            emitter.emit(token.clone());
            Ok(())
        });
        let close: CloseAction = Arc::new(move || {
            if let Err(err) = registration.unregister() {
                warn!(error = %err, "unregister failed during teardown");
            }
        });
        Ok(Execution::new(added, Channel::new(), start, close))
    })
}

/// Track references to services matching `interface` and an optional
/// filter expression
///
/// `start` opens the tracker (reporting current matches first); each
/// appearing reference is an `added` token, each departure emits the
/// previously issued token on `removed`. Modifications are
/// remove-then-add with distinct identities.
pub fn service_references(interface: &str, expression: Option<&str>) -> Flow<ServiceRef> {
    let interface = interface.to_string();
    let expression = expression.map(str::to_string);
    Flow::from_operation(move |registry| {
        let filter = registry.create_filter(&interface, expression.as_deref())?;

        let added = Channel::new();
        let removed = Channel::new();
        let observer = Arc::new(ReferenceObserver {
            added_source: added.emitter(),
            removed_source: removed.emitter(),
            tracked: Mutex::new(HashMap::new()),
        });

        let tracker: Arc<dyn TrackerHandle> =
            Arc::from(registry.track_services(&filter, observer));
        let open = Arc::clone(&tracker);
        let start: StartAction = Arc::new(move || open.open());
        let close: CloseAction = Arc::new(move || tracker.close());
        Ok(Execution::new(added, removed, start, close))
    })
}

/// Track services matching `interface`, checking out an instance per
/// appearance
///
/// Tokens carry the checked-out [`ServiceInstance`]. On departure the
/// original token is emitted on `removed`, then the instance is
/// returned through the same service-objects handle.
pub fn services(interface: &str, expression: Option<&str>) -> MultiFlow<ServiceInstance> {
    let interface_owned = interface.to_string();
    let expression_owned = expression.map(str::to_string);

    let flow = {
        let interface = interface_owned.clone();
        let expression = expression_owned.clone();
        Flow::from_operation(move |registry| {
            let filter = registry.create_filter(&interface, expression.as_deref())?;

            let added = Channel::new();
            let removed = Channel::new();
            let observer = Arc::new(CheckoutObserver {
                registry: Arc::clone(registry),
                added_source: added.emitter(),
                removed_source: removed.emitter(),
                tracked: Mutex::new(HashMap::new()),
            });

            let tracker: Arc<dyn TrackerHandle> =
                Arc::from(registry.track_services(&filter, observer));
            let open = Arc::clone(&tracker);
            let start: StartAction = Arc::new(move || open.open());
            let close: CloseAction = Arc::new(move || tracker.close());
            Ok(Execution::new(added, removed, start, close))
        })
    };

    let cascade: CascadeFactory<ServiceInstance> = {
        let interface = interface_owned;
        let expression = expression_owned;
        Arc::new(
            move |registry: &HostContext, sink: Arc<dyn CascadeSink<ServiceInstance>>| {
                let filter = registry.create_filter(&interface, expression.as_deref())?;
                let observer = Arc::new(CheckoutCascadeObserver {
                    registry: Arc::clone(registry),
                    sink,
                    tracked: Mutex::new(HashMap::new()),
                });
                Ok(registry.track_services(&filter, observer))
            },
        )
    };

    MultiFlow { flow, cascade }
}

/// Track services matching `interface`, carrying the service-objects
/// handle itself
///
/// No checkout happens at this layer; the consumer manages prototype
/// instance lifecycles through the handle.
pub fn prototypes(
    interface: &str,
    expression: Option<&str>,
) -> MultiFlow<Arc<dyn ServiceObjects>> {
    let interface_owned = interface.to_string();
    let expression_owned = expression.map(str::to_string);

    let flow = {
        let interface = interface_owned.clone();
        let expression = expression_owned.clone();
        Flow::from_operation(move |registry| {
            let filter = registry.create_filter(&interface, expression.as_deref())?;

            let added = Channel::new();
            let removed = Channel::new();
            let observer = Arc::new(ObjectsObserver {
                registry: Arc::clone(registry),
                added_source: added.emitter(),
                removed_source: removed.emitter(),
                tracked: Mutex::new(HashMap::new()),
            });

            let tracker: Arc<dyn TrackerHandle> =
                Arc::from(registry.track_services(&filter, observer));
            let open = Arc::clone(&tracker);
            let start: StartAction = Arc::new(move || open.open());
            let close: CloseAction = Arc::new(move || tracker.close());
            Ok(Execution::new(added, removed, start, close))
        })
    };

    let cascade: CascadeFactory<Arc<dyn ServiceObjects>> = {
        let interface = interface_owned;
        let expression = expression_owned;
        Arc::new(
            move |registry: &HostContext, sink: Arc<dyn CascadeSink<Arc<dyn ServiceObjects>>>| {
                let filter = registry.create_filter(&interface, expression.as_deref())?;
                let observer = Arc::new(ObjectsCascadeObserver {
                    registry: Arc::clone(registry),
                    sink,
                    tracked: Mutex::new(HashMap::new()),
                });
                Ok(registry.track_services(&filter, observer))
            },
        )
    };

    MultiFlow { flow, cascade }
}

/// Track bundles whose state is within `mask`
///
/// A bundle entering the mask is an addition, leaving it a removal, a
/// state change within it a remove-then-add.
pub fn bundles(mask: BundleStateMask) -> MultiFlow<Bundle> {
    let flow = Flow::from_operation(move |registry| {
        let added = Channel::new();
        let removed = Channel::new();
        let observer = Arc::new(BundleTokenObserver {
            added_source: added.emitter(),
            removed_source: removed.emitter(),
            tracked: Mutex::new(HashMap::new()),
        });

        let tracker: Arc<dyn TrackerHandle> = Arc::from(registry.track_bundles(mask, observer));
        let open = Arc::clone(&tracker);
        let start: StartAction = Arc::new(move || open.open());
        let close: CloseAction = Arc::new(move || tracker.close());
        Ok(Execution::new(added, removed, start, close))
    });

    let cascade: CascadeFactory<Bundle> =
        Arc::new(move |registry: &HostContext, sink: Arc<dyn CascadeSink<Bundle>>| {
            let observer = Arc::new(BundleCascadeObserver {
                sink,
                tracked: Mutex::new(HashMap::new()),
            });
            Ok(registry.track_bundles(mask, observer))
        });

    MultiFlow { flow, cascade }
}

/// A flow whose source is a registry view that naturally emits many
/// concurrent tokens
///
/// Offers the same algebra as [`Flow`], plus [`once`](MultiFlow::once).
/// Its `flat_map` integrates the cascade into the source's own tracker,
/// so the registry is subscribed exactly once.
pub struct MultiFlow<T> {
    flow: Flow<T>,
    cascade: CascadeFactory<T>,
}

impl<T> Clone for MultiFlow<T> {
    fn clone(&self) -> Self {
        Self {
            flow: self.flow.clone(),
            cascade: Arc::clone(&self.cascade),
        }
    }
}

impl<T> MultiFlow<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// View this source as a plain flow
    pub fn into_flow(self) -> Flow<T> {
        self.flow
    }

    /// Spawn an inner flow per tracked item, driven by a single
    /// integrated tracker
    ///
    /// Per item, the cascade records the inner execution and the last
    /// inner token it forwarded; on departure it closes the inner
    /// execution and emits that token on `removed`. Closing the
    /// resulting execution closes the tracker, which reports a final
    /// departure per item — tearing every inner execution down exactly
    /// once.
    pub fn flat_map<S, K>(self, k: K) -> Flow<S>
    where
        S: Clone + Send + Sync + 'static,
        K: Fn(T) -> Flow<S> + Send + Sync + 'static,
    {
        let cascade = self.cascade;
        let spawn: Arc<dyn Fn(T) -> Flow<S> + Send + Sync> = Arc::new(k);
        Flow::from_operation(move |registry| {
            let added = Channel::new();
            let removed = Channel::new();

            let sink: Arc<dyn CascadeSink<T>> = Arc::new(CascadeSpawner {
                spawn: Arc::clone(&spawn),
                registry: Arc::clone(registry),
                added_source: added.emitter(),
                removed_source: removed.emitter(),
                live: Mutex::new(HashMap::new()),
            });

            let tracker: Arc<dyn TrackerHandle> = Arc::from(cascade(registry, sink)?);
            let open = Arc::clone(&tracker);
            let start: StartAction = Arc::new(move || open.open());
            let close: CloseAction = Arc::new(move || tracker.close());
            Ok(Execution::new(added, removed, start, close))
        })
    }

    /// Collapse this multi-valued source to its first-ever emission
    ///
    /// The first tracked item is kept; every later item maps to
    /// [`nothing`]. The chosen slot is never reset — `once` is
    /// deliberately non-reactive to the departure of its chosen value.
    pub fn once(self) -> Flow<T> {
        let chosen: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
        self.flat_map(move |value: T| {
            let mut slot = chosen.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                *slot = Some(value.clone());
                just(value)
            } else {
                nothing()
            }
        })
    }

    /// Transform every emitted value; see [`Flow::map`]
    pub fn map<S, F>(self, f: F) -> Flow<S>
    where
        S: Clone + Send + Sync + 'static,
        F: Fn(T) -> S + Send + Sync + 'static,
    {
        self.flow.map(f)
    }

    /// Sequence through the integrated cascade; see [`Flow::then`]
    pub fn then<S>(self, next: Flow<S>) -> Flow<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        self.flat_map(move |_| next.clone())
    }

    /// Cascade per item, discarding produced values; see
    /// [`Flow::for_each`]
    pub fn for_each<S, K>(self, k: K) -> Flow<()>
    where
        S: Clone + Send + Sync + 'static,
        K: Fn(T) -> Flow<S> + Send + Sync + 'static,
    {
        self.flat_map(k).map(|_| ())
    }
}

/// Builds the integrated tracker backing a [`MultiFlow::flat_map`]
type CascadeFactory<T> = Arc<
    dyn Fn(&HostContext, Arc<dyn CascadeSink<T>>) -> FlowResult<Box<dyn TrackerHandle>>
        + Send
        + Sync,
>;

/// Opaque key correlating a tracked item with its live inner execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct CascadeSlot(Uuid);

impl CascadeSlot {
    fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

/// Receives one call per tracked item from an integrated source
pub(crate) trait CascadeSink<T>: Send + Sync {
    /// An item appeared; spawn its inner execution and return the slot
    fn spawned(&self, value: T) -> CascadeSlot;

    /// The item at `slot` departed; tear its inner execution down
    fn discarded(&self, slot: CascadeSlot);
}

struct TrackedInner<S> {
    execution: Execution<S>,
    /// Last inner token forwarded upward; emitted on `removed` at teardown.
    last: Arc<Mutex<Option<Token<S>>>>,
}

struct CascadeSpawner<T, S> {
    spawn: Arc<dyn Fn(T) -> Flow<S> + Send + Sync>,
    registry: HostContext,
    added_source: Emitter<S>,
    removed_source: Emitter<S>,
    live: Mutex<HashMap<CascadeSlot, TrackedInner<S>>>,
}

impl<T, S> CascadeSink<T> for CascadeSpawner<T, S>
where
    T: Clone + Send + Sync + 'static,
    S: Clone + Send + Sync + 'static,
{
    fn spawned(&self, value: T) -> CascadeSlot {
        let slot = CascadeSlot::new();
        let flow = (self.spawn)(value);
        let execution = match flow.materialize(&self.registry) {
            Ok(execution) => execution,
            Err(err) => {
                error!(error = %err, "inner flow failed to materialize");
                return slot;
            }
        };

        let last = Arc::new(Mutex::new(None));
        let record = Arc::clone(&last);
        let forward = self.added_source.clone();
        execution.added().subscribe(move |token| {
            *record.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
            forward.emit(token.clone());
        });

        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                slot,
                TrackedInner {
                    execution: execution.clone(),
                    last,
                },
            );

        if let Err(err) = execution.start() {
            error!(error = %err, "inner flow failed to start");
        }
        slot
    }

    fn discarded(&self, slot: CascadeSlot) {
        let tracked = self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&slot);
        if let Some(tracked) = tracked {
            tracked.execution.close();
            let token = tracked
                .last
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(token) = token {
                self.removed_source.emit(token);
            }
        }
    }
}

struct ReferenceObserver {
    added_source: Emitter<ServiceRef>,
    removed_source: Emitter<ServiceRef>,
    tracked: Mutex<HashMap<ServiceId, Token<ServiceRef>>>,
}

impl ServiceObserver for ReferenceObserver {
    fn adding(&self, reference: ServiceRef) {
        let token = Token::new(reference.clone());
        self.tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(reference.id(), token.clone());
        self.added_source.emit(token);
    }

    fn modified(&self, reference: ServiceRef) {
        self.removed(reference.clone());
        self.adding(reference);
    }

    fn removed(&self, reference: ServiceRef) {
        let token = self
            .tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&reference.id());
        if let Some(token) = token {
            self.removed_source.emit(token);
        }
    }
}

struct CheckedOut {
    token: Token<ServiceInstance>,
    objects: Arc<dyn ServiceObjects>,
}

struct CheckoutObserver {
    registry: HostContext,
    added_source: Emitter<ServiceInstance>,
    removed_source: Emitter<ServiceInstance>,
    tracked: Mutex<HashMap<ServiceId, CheckedOut>>,
}

impl ServiceObserver for CheckoutObserver {
    fn adding(&self, reference: ServiceRef) {
        let Some(objects) = self.registry.service_objects(&reference) else {
            warn!(service = %reference.id(), "service departed before checkout");
            return;
        };
        let Some(instance) = objects.get_service() else {
            warn!(service = %reference.id(), "service checkout failed");
            return;
        };

        let token = Token::new(instance);
        self.tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                reference.id(),
                CheckedOut {
                    token: token.clone(),
                    objects,
                },
            );
        self.added_source.emit(token);
    }

    fn modified(&self, reference: ServiceRef) {
        self.removed(reference.clone());
        self.adding(reference);
    }

    fn removed(&self, reference: ServiceRef) {
        let entry = self
            .tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&reference.id());
        if let Some(entry) = entry {
            self.removed_source.emit(entry.token.clone());
            entry.objects.unget_service(entry.token.into_value());
        }
    }
}

struct CheckedOutSlot {
    slot: CascadeSlot,
    instance: ServiceInstance,
    objects: Arc<dyn ServiceObjects>,
}

struct CheckoutCascadeObserver {
    registry: HostContext,
    sink: Arc<dyn CascadeSink<ServiceInstance>>,
    tracked: Mutex<HashMap<ServiceId, CheckedOutSlot>>,
}

impl ServiceObserver for CheckoutCascadeObserver {
    fn adding(&self, reference: ServiceRef) {
        let Some(objects) = self.registry.service_objects(&reference) else {
            warn!(service = %reference.id(), "service departed before checkout");
            return;
        };
        let Some(instance) = objects.get_service() else {
            warn!(service = %reference.id(), "service checkout failed");
            return;
        };

        let slot = self.sink.spawned(Arc::clone(&instance));
        self.tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                reference.id(),
                CheckedOutSlot {
                    slot,
                    instance,
                    objects,
                },
            );
    }

    fn modified(&self, reference: ServiceRef) {
        self.removed(reference.clone());
        self.adding(reference);
    }

    fn removed(&self, reference: ServiceRef) {
        let entry = self
            .tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&reference.id());
        if let Some(entry) = entry {
            self.sink.discarded(entry.slot);
            entry.objects.unget_service(entry.instance);
        }
    }
}

struct ObjectsObserver {
    registry: HostContext,
    added_source: Emitter<Arc<dyn ServiceObjects>>,
    removed_source: Emitter<Arc<dyn ServiceObjects>>,
    tracked: Mutex<HashMap<ServiceId, Token<Arc<dyn ServiceObjects>>>>,
}

impl ServiceObserver for ObjectsObserver {
    fn adding(&self, reference: ServiceRef) {
        let Some(objects) = self.registry.service_objects(&reference) else {
            warn!(service = %reference.id(), "service departed before handle lookup");
            return;
        };

        let token = Token::new(objects);
        self.tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(reference.id(), token.clone());
        self.added_source.emit(token);
    }

    fn modified(&self, reference: ServiceRef) {
        self.removed(reference.clone());
        self.adding(reference);
    }

    fn removed(&self, reference: ServiceRef) {
        let token = self
            .tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&reference.id());
        if let Some(token) = token {
            self.removed_source.emit(token);
        }
    }
}

struct ObjectsCascadeObserver {
    registry: HostContext,
    sink: Arc<dyn CascadeSink<Arc<dyn ServiceObjects>>>,
    tracked: Mutex<HashMap<ServiceId, CascadeSlot>>,
}

impl ServiceObserver for ObjectsCascadeObserver {
    fn adding(&self, reference: ServiceRef) {
        let Some(objects) = self.registry.service_objects(&reference) else {
            warn!(service = %reference.id(), "service departed before handle lookup");
            return;
        };

        let slot = self.sink.spawned(objects);
        self.tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(reference.id(), slot);
    }

    fn modified(&self, reference: ServiceRef) {
        self.removed(reference.clone());
        self.adding(reference);
    }

    fn removed(&self, reference: ServiceRef) {
        let slot = self
            .tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&reference.id());
        if let Some(slot) = slot {
            self.sink.discarded(slot);
        }
    }
}

struct BundleTokenObserver {
    added_source: Emitter<Bundle>,
    removed_source: Emitter<Bundle>,
    tracked: Mutex<HashMap<BundleId, Token<Bundle>>>,
}

impl BundleObserver for BundleTokenObserver {
    fn adding(&self, bundle: Bundle) {
        let token = Token::new(bundle.clone());
        self.tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(bundle.id(), token.clone());
        self.added_source.emit(token);
    }

    fn modified(&self, bundle: Bundle) {
        self.removed(bundle.clone());
        self.adding(bundle);
    }

    fn removed(&self, bundle: Bundle) {
        let token = self
            .tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&bundle.id());
        if let Some(token) = token {
            self.removed_source.emit(token);
        }
    }
}

struct BundleCascadeObserver {
    sink: Arc<dyn CascadeSink<Bundle>>,
    tracked: Mutex<HashMap<BundleId, CascadeSlot>>,
}

impl BundleObserver for BundleCascadeObserver {
    fn adding(&self, bundle: Bundle) {
        let slot = self.sink.spawned(bundle.clone());
        self.tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(bundle.id(), slot);
    }

    fn modified(&self, bundle: Bundle) {
        self.removed(bundle.clone());
        self.adding(bundle);
    }

    fn removed(&self, bundle: Bundle) {
        let slot = self
            .tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&bundle.id());
        if let Some(slot) = slot {
            self.sink.discarded(slot);
        }
    }
}
