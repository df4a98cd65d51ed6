// Copyright (c) 2025 - Cowboy AI, Inc.
//! Host Registry Contract
//!
//! This module defines the interface a service platform must satisfy for
//! flows to execute against it. The library owns no services, bundles,
//! or configurations of its own — it subscribes to a host registry and
//! reacts to what the host reports.
//!
//! # Architecture
//!
//! ```text
//! Host platform (services / bundles / configuration admin)
//!        │  dispatch threads
//!        ▼
//! HostRegistry (this contract)
//!        │  observer callbacks
//!        ▼
//! Flow primitives → Channels → Combinators → Application
//! ```
//!
//! # Dispatch Contract
//!
//! 1. **Trackers are inert until opened.** `TrackerHandle::open` delivers
//!    `adding` for every currently matching item synchronously on the
//!    caller's thread, then live events arrive on whatever thread the
//!    host dispatches from.
//! 2. **Closing a tracker delivers removals.** `TrackerHandle::close`
//!    invokes `removed` for every item the tracker still holds, then
//!    stops delivery. Cascades rely on this to tear down their inner
//!    executions.
//! 3. **Modifications are reported as `modified`.** Primitives translate
//!    them into remove-then-add pairs with fresh identities.
//! 4. **Configuration watches deliver current state.** Registering a
//!    listener for a pid (or factory pid) that already has configuration
//!    delivers it synchronously before the registration call returns.
//!
//! The host may call observers from multiple threads, but must not call
//! the same observer concurrently; the library adds no serialization of
//! its own beyond protecting its internal tables.

use std::any::Any;
use std::collections::HashMap;
use std::ops::BitOr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::FlowResult;
use crate::filter::ServiceFilter;

/// Properties attached to a service registration
pub type ServiceProperties = HashMap<String, serde_json::Value>;

/// A configuration dictionary delivered by the host's configuration admin
pub type ConfigDictionary = HashMap<String, serde_json::Value>;

/// A service object held by the registry
///
/// Services are dynamically typed at the registry boundary; consumers
/// downcast to the concrete type they registered.
pub type ServiceInstance = Arc<dyn Any + Send + Sync>;

/// Wrap a concrete value as a registerable [`ServiceInstance`]
pub fn service_instance<T: Any + Send + Sync>(value: T) -> ServiceInstance {
    Arc::new(value)
}

/// Unique identity of a service registration within the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceId(Uuid);

impl ServiceId {
    /// Allocate a fresh service id
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ServiceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A reference to a registered service: identity, interface, and a
/// snapshot of the properties at the time the reference was issued
///
/// Property modifications produce a *new* reference snapshot; the id is
/// stable across modifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRef {
    id: ServiceId,
    interface: String,
    properties: ServiceProperties,
}

impl ServiceRef {
    /// Build a reference snapshot
    pub fn new(id: ServiceId, interface: impl Into<String>, properties: ServiceProperties) -> Self {
        Self {
            id,
            interface: interface.into(),
            properties,
        }
    }

    /// The registration's stable identity
    pub fn id(&self) -> ServiceId {
        self.id
    }

    /// The interface the service was registered under
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// The property snapshot carried by this reference
    pub fn properties(&self) -> &ServiceProperties {
        &self.properties
    }

    /// Look up a single property
    pub fn property(&self, key: &str) -> Option<&serde_json::Value> {
        self.properties.get(key)
    }
}

/// Unique identity of a bundle within the host platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BundleId(Uuid);

impl BundleId {
    /// Allocate a fresh bundle id
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for BundleId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BundleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BundleState {
    Installed,
    Resolved,
    Starting,
    Active,
    Stopping,
}

impl BundleState {
    fn bit(self) -> u32 {
        match self {
            BundleState::Installed => 1 << 0,
            BundleState::Resolved => 1 << 1,
            BundleState::Starting => 1 << 2,
            BundleState::Active => 1 << 3,
            BundleState::Stopping => 1 << 4,
        }
    }
}

/// A set of [`BundleState`]s, used to scope bundle trackers
///
/// ```rust
/// use cim_service_flow::BundleState;
///
/// let mask = BundleState::Starting | BundleState::Active;
/// assert!(mask.contains(BundleState::Active));
/// assert!(!mask.contains(BundleState::Stopping));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleStateMask(u32);

impl BundleStateMask {
    /// The empty mask, matching no state
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Whether `state` is part of this mask
    pub fn contains(&self, state: BundleState) -> bool {
        self.0 & state.bit() != 0
    }
}

impl From<BundleState> for BundleStateMask {
    fn from(state: BundleState) -> Self {
        Self(state.bit())
    }
}

impl BitOr for BundleStateMask {
    type Output = BundleStateMask;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOr<BundleState> for BundleStateMask {
    type Output = BundleStateMask;

    fn bitor(self, rhs: BundleState) -> Self {
        Self(self.0 | rhs.bit())
    }
}

impl BitOr for BundleState {
    type Output = BundleStateMask;

    fn bitor(self, rhs: Self) -> BundleStateMask {
        BundleStateMask(self.bit() | rhs.bit())
    }
}

/// A deployment unit of the host platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    id: BundleId,
    symbolic_name: String,
    state: BundleState,
}

impl Bundle {
    /// Build a bundle snapshot
    pub fn new(id: BundleId, symbolic_name: impl Into<String>, state: BundleState) -> Self {
        Self {
            id,
            symbolic_name: symbolic_name.into(),
            state,
        }
    }

    /// The bundle's stable identity
    pub fn id(&self) -> BundleId {
        self.id
    }

    /// The bundle's symbolic name
    pub fn symbolic_name(&self) -> &str {
        &self.symbolic_name
    }

    /// The bundle's state at snapshot time
    pub fn state(&self) -> BundleState {
        self.state
    }
}

/// Handle to a live service registration
pub trait ServiceRegistration: Send + Sync {
    /// The reference issued for this registration
    fn reference(&self) -> ServiceRef;

    /// Withdraw the service from the registry
    ///
    /// # Errors
    ///
    /// Returns an error if the registration was already withdrawn.
    fn unregister(&self) -> FlowResult<()>;
}

/// Reference-counted checkout handle for one service registration
pub trait ServiceObjects: Send + Sync {
    /// The reference this handle was obtained for
    fn reference(&self) -> ServiceRef;

    /// Check out an instance, or `None` if the service has departed
    fn get_service(&self) -> Option<ServiceInstance>;

    /// Return a previously checked-out instance
    fn unget_service(&self, instance: ServiceInstance);
}

/// Callbacks for a service tracker
pub trait ServiceObserver: Send + Sync {
    /// A matching service appeared (or was already present at open)
    fn adding(&self, reference: ServiceRef);

    /// A tracked service's properties changed; `reference` is the new snapshot
    fn modified(&self, reference: ServiceRef);

    /// A tracked service departed (or the tracker is closing)
    fn removed(&self, reference: ServiceRef);
}

/// Callbacks for a bundle tracker
pub trait BundleObserver: Send + Sync {
    /// A bundle entered the tracked state mask
    fn adding(&self, bundle: Bundle);

    /// A tracked bundle changed state within the mask
    fn modified(&self, bundle: Bundle);

    /// A tracked bundle left the mask (or the tracker is closing)
    fn removed(&self, bundle: Bundle);
}

/// Control handle for a service or bundle tracker
pub trait TrackerHandle: Send + Sync {
    /// Begin delivery; reports every current match before returning
    fn open(&self) -> FlowResult<()>;

    /// Stop delivery; reports a removal for every tracked item first
    fn close(&self);
}

/// Control handle for a configuration listener registration
pub trait ListenerHandle: Send + Sync {
    /// Stop delivery to the listener
    fn unregister(&self);
}

/// Listener for a single configuration pid
pub trait ConfigurationListener: Send + Sync {
    /// A configuration dictionary was delivered for the watched pid
    fn updated(&self, properties: ConfigDictionary);
}

/// Listener for a factory configuration pid
pub trait FactoryConfigurationListener: Send + Sync {
    /// A factory instance was created or updated
    fn updated(&self, instance_pid: &str, properties: ConfigDictionary);

    /// A factory instance was deleted
    fn deleted(&self, instance_pid: &str);
}

/// The host platform's registry surface
///
/// Implementations adapt a concrete platform; the crate ships
/// [`MemoryRegistry`](crate::MemoryRegistry) for embedders and tests.
pub trait HostRegistry: Send + Sync {
    /// Register a service under `interface` with the given properties
    ///
    /// The registry augments the properties with `objectClass` and a
    /// unique `service.id` before issuing the reference.
    fn register_service(
        &self,
        interface: &str,
        instance: ServiceInstance,
        properties: ServiceProperties,
    ) -> FlowResult<Arc<dyn ServiceRegistration>>;

    /// Create an inert service tracker scoped by `filter`
    fn track_services(
        &self,
        filter: &ServiceFilter,
        observer: Arc<dyn ServiceObserver>,
    ) -> Box<dyn TrackerHandle>;

    /// Create an inert bundle tracker scoped by `mask`
    fn track_bundles(
        &self,
        mask: BundleStateMask,
        observer: Arc<dyn BundleObserver>,
    ) -> Box<dyn TrackerHandle>;

    /// Obtain the checkout handle for a service reference
    ///
    /// Returns `None` if the service has already departed.
    fn service_objects(&self, reference: &ServiceRef) -> Option<Arc<dyn ServiceObjects>>;

    /// Register a listener for a single configuration pid
    fn watch_configuration(
        &self,
        pid: &str,
        listener: Arc<dyn ConfigurationListener>,
    ) -> FlowResult<Box<dyn ListenerHandle>>;

    /// Register a listener for a factory configuration pid
    fn watch_factory_configurations(
        &self,
        factory_pid: &str,
        listener: Arc<dyn FactoryConfigurationListener>,
    ) -> FlowResult<Box<dyn ListenerHandle>>;

    /// Build the tracker filter for `interface`, optionally narrowed by a
    /// user expression
    ///
    /// Produces `(objectClass=interface)` or
    /// `(&(objectClass=interface)expression)`.
    ///
    /// # Errors
    ///
    /// [`FlowError::FilterSyntax`](crate::FlowError::FilterSyntax) if the
    /// expression cannot be parsed.
    fn create_filter(
        &self,
        interface: &str,
        expression: Option<&str>,
    ) -> FlowResult<ServiceFilter> {
        ServiceFilter::for_interface(interface, expression)
    }
}

/// Shared handle to the host registry a flow executes against
pub type HostContext = Arc<dyn HostRegistry>;
