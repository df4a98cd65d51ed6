// Copyright (c) 2025 - Cowboy AI, Inc.
//! In-Memory Host Registry
//!
//! `MemoryRegistry` is a complete [`HostRegistry`] with no platform
//! underneath: services, bundles, and configurations live in process
//! memory, and every mutation dispatches synchronously to the trackers
//! and listeners it affects. It backs the crate's test suites and demos,
//! and serves embedders that want dependency-tracked wiring without an
//! external platform.
//!
//! # Dispatch Rules
//!
//! - Observers are never called while a registry lock is held, so an
//!   observer may re-enter the registry (a cascade registering further
//!   services, for instance).
//! - Tracker `open` reports current matches on the caller's thread;
//!   tracker `close` reports a removal per tracked item.
//! - Property updates dispatch by filter transition: still-matching
//!   services are `modified`, newly matching ones `adding`, no-longer
//!   matching ones `removed`.
//! - Configuration watches receive the current state synchronously at
//!   registration time.
//!
//! # Registry-Stamped Properties
//!
//! Registration augments the supplied properties with `objectClass`,
//! `service.id`, and `service.registered_at` (RFC 3339). The stamp is
//! preserved across property updates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde_json::json;
use tracing::{debug, trace};

use crate::errors::{FlowError, FlowResult};
use crate::filter::{ServiceFilter, OBJECT_CLASS};
use crate::host::{
    Bundle, BundleId, BundleObserver, BundleState, BundleStateMask, ConfigDictionary,
    ConfigurationListener, FactoryConfigurationListener, HostContext, HostRegistry,
    ListenerHandle, ServiceId, ServiceInstance, ServiceObjects, ServiceObserver,
    ServiceProperties, ServiceRef, ServiceRegistration, TrackerHandle,
};

/// Property stamped with the registration's unique id
pub const SERVICE_ID_PROPERTY: &str = "service.id";

/// Property stamped with the registration time (RFC 3339)
pub const REGISTERED_AT_PROPERTY: &str = "service.registered_at";

/// An in-memory service platform
///
/// Cloning yields another handle to the same registry.
#[derive(Clone)]
pub struct MemoryRegistry {
    inner: Arc<RegistryState>,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryState::default()),
        }
    }

    /// This registry as a [`HostContext`] for executing flows
    pub fn context(&self) -> HostContext {
        Arc::new(self.clone())
    }

    /// Replace the user-supplied properties of a registered service
    ///
    /// The registry stamps are preserved. Trackers observe the change as
    /// a modification, an appearance, or a departure depending on how
    /// their filters match before and after.
    ///
    /// # Errors
    ///
    /// [`FlowError::Host`] if no service with `id` is registered.
    pub fn update_service_properties(
        &self,
        id: ServiceId,
        properties: ServiceProperties,
    ) -> FlowResult<()> {
        let (old_ref, new_ref) = {
            let mut services = self.inner.services.lock().unwrap_or_else(PoisonError::into_inner);
            let record = services
                .get_mut(&id)
                .ok_or_else(|| FlowError::Host(format!("unknown service {id}")))?;

            let old_ref = record.reference.clone();
            let mut stamped = properties;
            stamped.insert(OBJECT_CLASS.to_string(), json!(old_ref.interface()));
            stamped.insert(SERVICE_ID_PROPERTY.to_string(), json!(id.to_string()));
            if let Some(at) = old_ref.property(REGISTERED_AT_PROPERTY) {
                stamped.insert(REGISTERED_AT_PROPERTY.to_string(), at.clone());
            }

            let new_ref = ServiceRef::new(id, old_ref.interface(), stamped);
            record.reference = new_ref.clone();
            (old_ref, new_ref)
        };

        trace!(service = %id, "service properties updated");
        self.inner.notify_service_updated(&old_ref, &new_ref);
        Ok(())
    }

    /// Number of registered services under `interface`
    pub fn service_count(&self, interface: &str) -> usize {
        self.inner
            .services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|record| record.reference.interface() == interface)
            .count()
    }

    /// Outstanding checkouts for the service with `id`
    pub fn active_checkouts(&self, id: ServiceId) -> usize {
        self.inner
            .services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|record| record.checkouts)
            .unwrap_or(0)
    }

    /// Install a bundle in the given state
    pub fn install_bundle(&self, symbolic_name: &str, state: BundleState) -> Bundle {
        let bundle = Bundle::new(BundleId::new(), symbolic_name, state);
        self.inner
            .bundles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(bundle.id(), bundle.clone());

        debug!(bundle = %bundle.id(), name = symbolic_name, "bundle installed");
        self.inner.notify_bundle_transition(None, Some(&bundle));
        bundle
    }

    /// Move a bundle to a new lifecycle state
    ///
    /// # Errors
    ///
    /// [`FlowError::Host`] if no bundle with `id` is installed.
    pub fn set_bundle_state(&self, id: BundleId, state: BundleState) -> FlowResult<()> {
        let (old, new) = {
            let mut bundles = self.inner.bundles.lock().unwrap_or_else(PoisonError::into_inner);
            let bundle = bundles
                .get_mut(&id)
                .ok_or_else(|| FlowError::Host(format!("unknown bundle {id}")))?;
            let old = bundle.clone();
            *bundle = Bundle::new(id, old.symbolic_name(), state);
            (old, bundle.clone())
        };

        trace!(bundle = %id, ?state, "bundle state changed");
        self.inner.notify_bundle_transition(Some(&old), Some(&new));
        Ok(())
    }

    /// Remove a bundle from the platform
    ///
    /// # Errors
    ///
    /// [`FlowError::Host`] if no bundle with `id` is installed.
    pub fn uninstall_bundle(&self, id: BundleId) -> FlowResult<()> {
        let old = self
            .inner
            .bundles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .ok_or_else(|| FlowError::Host(format!("unknown bundle {id}")))?;

        debug!(bundle = %id, "bundle uninstalled");
        self.inner.notify_bundle_transition(Some(&old), None);
        Ok(())
    }

    /// Publish (or replace) the configuration dictionary for `pid`
    pub fn update_configuration(&self, pid: &str, dictionary: ConfigDictionary) {
        self.inner
            .configurations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pid.to_string(), dictionary.clone());

        let watches = self.inner.config_watches_snapshot();
        for watch in watches {
            if watch.active.load(Ordering::SeqCst) && watch.pid == pid {
                watch.listener.updated(dictionary.clone());
            }
        }
    }

    /// Publish (or replace) a factory configuration instance
    pub fn update_factory_configuration(
        &self,
        factory_pid: &str,
        instance_pid: &str,
        dictionary: ConfigDictionary,
    ) {
        self.inner
            .factory_configurations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(factory_pid.to_string())
            .or_default()
            .insert(instance_pid.to_string(), dictionary.clone());

        let watches = self.inner.factory_watches_snapshot();
        for watch in watches {
            if watch.active.load(Ordering::SeqCst) && watch.factory_pid == factory_pid {
                watch.listener.updated(instance_pid, dictionary.clone());
            }
        }
    }

    /// Delete a factory configuration instance
    pub fn delete_factory_configuration(&self, factory_pid: &str, instance_pid: &str) {
        let existed = self
            .inner
            .factory_configurations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(factory_pid)
            .and_then(|instances| instances.remove(instance_pid))
            .is_some();
        if !existed {
            return;
        }

        let watches = self.inner.factory_watches_snapshot();
        for watch in watches {
            if watch.active.load(Ordering::SeqCst) && watch.factory_pid == factory_pid {
                watch.listener.deleted(instance_pid);
            }
        }
    }
}

impl HostRegistry for MemoryRegistry {
    fn register_service(
        &self,
        interface: &str,
        instance: ServiceInstance,
        properties: ServiceProperties,
    ) -> FlowResult<Arc<dyn ServiceRegistration>> {
        let id = ServiceId::new();
        let mut stamped = properties;
        stamped.insert(OBJECT_CLASS.to_string(), json!(interface));
        stamped.insert(SERVICE_ID_PROPERTY.to_string(), json!(id.to_string()));
        stamped.insert(
            REGISTERED_AT_PROPERTY.to_string(),
            json!(Utc::now().to_rfc3339()),
        );

        let reference = ServiceRef::new(id, interface, stamped);
        self.inner
            .services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                ServiceRecord {
                    reference: reference.clone(),
                    instance,
                    checkouts: 0,
                },
            );

        debug!(service = %id, interface, "service registered");
        self.inner.notify_service_added(&reference);

        Ok(Arc::new(MemoryRegistration {
            registry: Arc::clone(&self.inner),
            reference,
        }))
    }

    fn track_services(
        &self,
        filter: &ServiceFilter,
        observer: Arc<dyn ServiceObserver>,
    ) -> Box<dyn TrackerHandle> {
        let state = Arc::new(ServiceTrackerState {
            filter: filter.clone(),
            observer,
            open: AtomicBool::new(false),
            matched: Mutex::new(HashMap::new()),
        });
        self.inner
            .service_trackers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&state));

        Box::new(MemoryServiceTracker {
            registry: Arc::clone(&self.inner),
            state,
        })
    }

    fn track_bundles(
        &self,
        mask: BundleStateMask,
        observer: Arc<dyn BundleObserver>,
    ) -> Box<dyn TrackerHandle> {
        let state = Arc::new(BundleTrackerState {
            mask,
            observer,
            open: AtomicBool::new(false),
            matched: Mutex::new(HashMap::new()),
        });
        self.inner
            .bundle_trackers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&state));

        Box::new(MemoryBundleTracker {
            registry: Arc::clone(&self.inner),
            state,
        })
    }

    fn service_objects(&self, reference: &ServiceRef) -> Option<Arc<dyn ServiceObjects>> {
        let present = self
            .inner
            .services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&reference.id());
        present.then(|| {
            Arc::new(MemoryServiceObjects {
                registry: Arc::clone(&self.inner),
                reference: reference.clone(),
            }) as Arc<dyn ServiceObjects>
        })
    }

    fn watch_configuration(
        &self,
        pid: &str,
        listener: Arc<dyn ConfigurationListener>,
    ) -> FlowResult<Box<dyn ListenerHandle>> {
        let watch = Arc::new(ConfigWatch {
            pid: pid.to_string(),
            listener,
            active: AtomicBool::new(true),
        });
        self.inner
            .config_watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&watch));

        // Current state is delivered synchronously at registration.
        let current = self
            .inner
            .configurations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(pid)
            .cloned();
        if let Some(current) = current {
            watch.listener.updated(current);
        }

        Ok(Box::new(MemoryConfigHandle {
            registry: Arc::clone(&self.inner),
            watch,
        }))
    }

    fn watch_factory_configurations(
        &self,
        factory_pid: &str,
        listener: Arc<dyn FactoryConfigurationListener>,
    ) -> FlowResult<Box<dyn ListenerHandle>> {
        let watch = Arc::new(FactoryWatch {
            factory_pid: factory_pid.to_string(),
            listener,
            active: AtomicBool::new(true),
        });
        self.inner
            .factory_watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&watch));

        let current: Vec<(String, ConfigDictionary)> = self
            .inner
            .factory_configurations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(factory_pid)
            .map(|instances| {
                instances
                    .iter()
                    .map(|(pid, dict)| (pid.clone(), dict.clone()))
                    .collect()
            })
            .unwrap_or_default();
        for (instance_pid, dictionary) in current {
            watch.listener.updated(&instance_pid, dictionary);
        }

        Ok(Box::new(MemoryFactoryHandle {
            registry: Arc::clone(&self.inner),
            watch,
        }))
    }
}

struct ServiceRecord {
    reference: ServiceRef,
    instance: ServiceInstance,
    checkouts: usize,
}

#[derive(Default)]
struct RegistryState {
    services: Mutex<HashMap<ServiceId, ServiceRecord>>,
    service_trackers: Mutex<Vec<Arc<ServiceTrackerState>>>,
    bundles: Mutex<HashMap<BundleId, Bundle>>,
    bundle_trackers: Mutex<Vec<Arc<BundleTrackerState>>>,
    configurations: Mutex<HashMap<String, ConfigDictionary>>,
    config_watches: Mutex<Vec<Arc<ConfigWatch>>>,
    factory_configurations: Mutex<HashMap<String, HashMap<String, ConfigDictionary>>>,
    factory_watches: Mutex<Vec<Arc<FactoryWatch>>>,
}

impl RegistryState {
    fn service_trackers_snapshot(&self) -> Vec<Arc<ServiceTrackerState>> {
        self.service_trackers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn bundle_trackers_snapshot(&self) -> Vec<Arc<BundleTrackerState>> {
        self.bundle_trackers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn config_watches_snapshot(&self) -> Vec<Arc<ConfigWatch>> {
        self.config_watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn factory_watches_snapshot(&self) -> Vec<Arc<FactoryWatch>> {
        self.factory_watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn notify_service_added(&self, reference: &ServiceRef) {
        for tracker in self.service_trackers_snapshot() {
            if !tracker.open.load(Ordering::SeqCst) {
                continue;
            }
            if tracker.filter.matches(reference.properties()) {
                tracker
                    .matched
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(reference.id(), reference.clone());
                tracker.observer.adding(reference.clone());
            }
        }
    }

    fn notify_service_removed(&self, reference: &ServiceRef) {
        for tracker in self.service_trackers_snapshot() {
            if !tracker.open.load(Ordering::SeqCst) {
                continue;
            }
            let was_tracked = tracker
                .matched
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&reference.id())
                .is_some();
            if was_tracked {
                tracker.observer.removed(reference.clone());
            }
        }
    }

    fn notify_service_updated(&self, old_ref: &ServiceRef, new_ref: &ServiceRef) {
        for tracker in self.service_trackers_snapshot() {
            if !tracker.open.load(Ordering::SeqCst) {
                continue;
            }
            let was = tracker
                .matched
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains_key(&old_ref.id());
            let now = tracker.filter.matches(new_ref.properties());
            match (was, now) {
                (true, true) => {
                    tracker
                        .matched
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(new_ref.id(), new_ref.clone());
                    tracker.observer.modified(new_ref.clone());
                }
                (true, false) => {
                    tracker
                        .matched
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&old_ref.id());
                    tracker.observer.removed(old_ref.clone());
                }
                (false, true) => {
                    tracker
                        .matched
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(new_ref.id(), new_ref.clone());
                    tracker.observer.adding(new_ref.clone());
                }
                (false, false) => {}
            }
        }
    }

    /// Dispatch a bundle lifecycle step; `None` means absent on that side.
    fn notify_bundle_transition(&self, old: Option<&Bundle>, new: Option<&Bundle>) {
        for tracker in self.bundle_trackers_snapshot() {
            if !tracker.open.load(Ordering::SeqCst) {
                continue;
            }
            let was = old.map(|b| tracker.mask.contains(b.state())).unwrap_or(false);
            let now = new.map(|b| tracker.mask.contains(b.state())).unwrap_or(false);
            match (was, now, old, new) {
                (true, true, _, Some(new)) => {
                    tracker
                        .matched
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(new.id(), new.clone());
                    tracker.observer.modified(new.clone());
                }
                (true, false, Some(old), _) => {
                    tracker
                        .matched
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&old.id());
                    tracker.observer.removed(old.clone());
                }
                (false, true, _, Some(new)) => {
                    tracker
                        .matched
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(new.id(), new.clone());
                    tracker.observer.adding(new.clone());
                }
                _ => {}
            }
        }
    }

    fn remove_service_tracker(&self, state: &Arc<ServiceTrackerState>) {
        self.service_trackers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|candidate| !Arc::ptr_eq(candidate, state));
    }

    fn remove_bundle_tracker(&self, state: &Arc<BundleTrackerState>) {
        self.bundle_trackers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|candidate| !Arc::ptr_eq(candidate, state));
    }
}

struct ServiceTrackerState {
    filter: ServiceFilter,
    observer: Arc<dyn ServiceObserver>,
    open: AtomicBool,
    matched: Mutex<HashMap<ServiceId, ServiceRef>>,
}

struct MemoryServiceTracker {
    registry: Arc<RegistryState>,
    state: Arc<ServiceTrackerState>,
}

impl TrackerHandle for MemoryServiceTracker {
    fn open(&self) -> FlowResult<()> {
        if self.state.open.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let snapshot: Vec<ServiceRef> = self
            .registry
            .services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|record| self.state.filter.matches(record.reference.properties()))
            .map(|record| record.reference.clone())
            .collect();

        for reference in snapshot {
            self.state
                .matched
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(reference.id(), reference.clone());
            self.state.observer.adding(reference);
        }
        Ok(())
    }

    fn close(&self) {
        if !self.state.open.swap(false, Ordering::SeqCst) {
            return;
        }

        let drained: Vec<ServiceRef> = self
            .state
            .matched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, reference)| reference)
            .collect();
        for reference in drained {
            self.state.observer.removed(reference);
        }
        self.registry.remove_service_tracker(&self.state);
    }
}

struct BundleTrackerState {
    mask: BundleStateMask,
    observer: Arc<dyn BundleObserver>,
    open: AtomicBool,
    matched: Mutex<HashMap<BundleId, Bundle>>,
}

struct MemoryBundleTracker {
    registry: Arc<RegistryState>,
    state: Arc<BundleTrackerState>,
}

impl TrackerHandle for MemoryBundleTracker {
    fn open(&self) -> FlowResult<()> {
        if self.state.open.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let snapshot: Vec<Bundle> = self
            .registry
            .bundles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|bundle| self.state.mask.contains(bundle.state()))
            .cloned()
            .collect();

        for bundle in snapshot {
            self.state
                .matched
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(bundle.id(), bundle.clone());
            self.state.observer.adding(bundle);
        }
        Ok(())
    }

    fn close(&self) {
        if !self.state.open.swap(false, Ordering::SeqCst) {
            return;
        }

        let drained: Vec<Bundle> = self
            .state
            .matched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, bundle)| bundle)
            .collect();
        for bundle in drained {
            self.state.observer.removed(bundle);
        }
        self.registry.remove_bundle_tracker(&self.state);
    }
}

struct MemoryRegistration {
    registry: Arc<RegistryState>,
    reference: ServiceRef,
}

impl ServiceRegistration for MemoryRegistration {
    fn reference(&self) -> ServiceRef {
        self.reference.clone()
    }

    fn unregister(&self) -> FlowResult<()> {
        let removed = self
            .registry
            .services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.reference.id());

        match removed {
            Some(record) => {
                debug!(service = %self.reference.id(), "service unregistered");
                self.registry.notify_service_removed(&record.reference);
                Ok(())
            }
            None => Err(FlowError::Registration(format!(
                "service {} already unregistered",
                self.reference.id()
            ))),
        }
    }
}

struct MemoryServiceObjects {
    registry: Arc<RegistryState>,
    reference: ServiceRef,
}

impl ServiceObjects for MemoryServiceObjects {
    fn reference(&self) -> ServiceRef {
        self.reference.clone()
    }

    fn get_service(&self) -> Option<ServiceInstance> {
        let mut services = self
            .registry
            .services
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let record = services.get_mut(&self.reference.id())?;
        record.checkouts += 1;
        Some(Arc::clone(&record.instance))
    }

    fn unget_service(&self, instance: ServiceInstance) {
        let mut services = self
            .registry
            .services
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(record) = services.get_mut(&self.reference.id()) {
            record.checkouts = record.checkouts.saturating_sub(1);
        }
        drop(instance);
    }
}

struct ConfigWatch {
    pid: String,
    listener: Arc<dyn ConfigurationListener>,
    active: AtomicBool,
}

struct MemoryConfigHandle {
    registry: Arc<RegistryState>,
    watch: Arc<ConfigWatch>,
}

impl ListenerHandle for MemoryConfigHandle {
    fn unregister(&self) {
        self.watch.active.store(false, Ordering::SeqCst);
        self.registry
            .config_watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|candidate| !Arc::ptr_eq(candidate, &self.watch));
    }
}

struct FactoryWatch {
    factory_pid: String,
    listener: Arc<dyn FactoryConfigurationListener>,
    active: AtomicBool,
}

struct MemoryFactoryHandle {
    registry: Arc<RegistryState>,
    watch: Arc<FactoryWatch>,
}

impl ListenerHandle for MemoryFactoryHandle {
    fn unregister(&self) {
        self.watch.active.store(false, Ordering::SeqCst);
        self.registry
            .factory_watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|candidate| !Arc::ptr_eq(candidate, &self.watch));
    }
}
