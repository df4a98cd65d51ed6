// Copyright (c) 2025 - Cowboy AI, Inc.
//! Dependency Wiring Example
//!
//! This example demonstrates dependency-tracked wiring against an
//! in-memory registry: a repository service exists exactly while its
//! database dependency is present, and a singleton monitor binds to the
//! first active bundle only.
//!
//! # Example Flow
//!
//! ```text
//! db service appears  ──► repository registered
//! db service departs  ──► repository withdrawn
//! db service returns  ──► repository registered again
//! ```

use cim_service_flow::{
    bundles, just, on_close, register, run, service_instance, services, BundleState,
    MemoryRegistry, ServiceProperties,
};

fn main() -> cim_service_flow::FlowResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    println!("=== Dependency Wiring Example ===\n");

    let memory = MemoryRegistry::new();
    let registry = memory.context();

    // === Example 1: A repository that follows its database ===
    println!("=== Example 1: Repository follows database ===");

    let wiring = services("db", None).flat_map(|_db| {
        register(
            "repository",
            service_instance("user-repository"),
            ServiceProperties::new(),
        )
        .then(on_close(|| println!("  repository torn down")))
    });

    let execution = run(&registry, &wiring)?;
    println!("repositories before db: {}", memory.service_count("repository"));

    let db = registry.register_service(
        "db",
        service_instance("postgres"),
        ServiceProperties::new(),
    )?;
    println!("repositories with db:   {}", memory.service_count("repository"));

    db.unregister()?;
    println!("repositories after db:  {}\n", memory.service_count("repository"));

    // === Example 2: Singleton binding with once ===
    println!("=== Example 2: Singleton bundle monitor ===");

    memory.install_bundle("core", BundleState::Active);
    memory.install_bundle("extras", BundleState::Active);

    let monitor = bundles(BundleState::Active.into())
        .once()
        .flat_map(|bundle| just(format!("monitoring {}", bundle.symbolic_name())));

    let monitor_execution = monitor.materialize(&registry)?;
    monitor_execution
        .added()
        .subscribe(|token| println!("  {}", token.value()));
    monitor_execution.start()?;

    // Later arrivals are ignored by the once restriction.
    memory.install_bundle("late-arrival", BundleState::Active);

    monitor_execution.close();
    execution.close();

    println!("\ndone");
    Ok(())
}
