// Copyright (c) 2025 - Cowboy AI, Inc.
//! Declarative dependency-tracking flows over a dynamic service registry
//!
//! In a dynamic service platform, named components appear and disappear
//! at arbitrary times. Derived computations must come up when all of
//! their dependencies are simultaneously present and tear down precisely
//! when any dependency departs. This crate lets an application describe
//! such a reactive dependency graph as an algebraic expression — a
//! [`Flow`] — and executes it against a live host registry.
//!
//! # Architecture
//!
//! ```text
//! Host registry (services / bundles / configuration)
//!        ↓ observer callbacks
//! Source primitives (services, bundles, configuration, …)
//!        ↓ provenance tokens on added/removed channels
//! Combinators (map / flat_map / then / for_each / once)
//!        ↓ cascading lifecycle
//! Application wiring (register, on_close, …)
//! ```
//!
//! # Core Concepts
//!
//! - **Flow**: an immutable description of a reactive computation,
//!   evaluated only when executed against a registry.
//! - **Execution**: the materialized handle of a running flow — two
//!   token channels, a starter, a closer.
//! - **Token**: a value tagged with a provenance identity that pairs a
//!   later removal with its earlier addition.
//! - **Cascade**: the machinery by which `flat_map` materializes an
//!   inner flow per outer token and tears it down when the token
//!   departs.
//!
//! # Example
//!
//! ```rust
//! use cim_service_flow::{
//!     register, run, service_instance, services, MemoryRegistry,
//!     ServiceProperties,
//! };
//!
//! let memory = MemoryRegistry::new();
//! let registry = memory.context();
//!
//! // Whenever a "db" service is present, publish a "repository"
//! // service; withdraw it when the database departs.
//! let wiring = services("db", None).flat_map(|_db| {
//!     register(
//!         "repository",
//!         service_instance("repo"),
//!         ServiceProperties::new(),
//!     )
//! });
//!
//! let execution = run(&registry, &wiring).expect("wiring starts");
//!
//! registry
//!     .register_service("db", service_instance("postgres"), Default::default())
//!     .expect("db registers");
//! assert_eq!(memory.service_count("repository"), 1);
//!
//! execution.close();
//! assert_eq!(memory.service_count("repository"), 0);
//! ```
//!
//! # Event Model
//!
//! Events are delivered synchronously on the thread that triggered them;
//! the library spawns no threads and never buffers. Ordering is
//! guaranteed per source only. Modifications surface as a removal
//! followed by an addition with a fresh identity.

pub mod channel;
pub mod config;
pub mod errors;
pub mod filter;
pub mod flow;
pub mod host;
pub mod memory;
pub mod token;
pub mod tracking;

// Re-export commonly used types
pub use channel::{Channel, Emitter};
pub use config::{configuration, configurations};
pub use errors::{FlowError, FlowResult};
pub use filter::ServiceFilter;
pub use flow::{close, just, nothing, on_close, run, with_registry, Execution, Flow};
pub use host::{
    service_instance, Bundle, BundleId, BundleObserver, BundleState, BundleStateMask,
    ConfigDictionary, ConfigurationListener, FactoryConfigurationListener, HostContext,
    HostRegistry, ListenerHandle, ServiceId, ServiceInstance, ServiceObjects, ServiceObserver,
    ServiceProperties, ServiceRef, ServiceRegistration, TrackerHandle,
};
pub use memory::MemoryRegistry;
pub use token::{Token, TokenId};
pub use tracking::{bundles, prototypes, register, service_references, services, MultiFlow};
