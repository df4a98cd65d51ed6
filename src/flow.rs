// Copyright (c) 2025 - Cowboy AI, Inc.
//! Flows - Declarative Dependency Programs
//!
//! A `Flow<T>` is a *description* of a reactive computation over a
//! dynamic service registry. Nothing happens when a flow is built;
//! executing it against a [`HostContext`] materializes an
//! [`Execution<T>`]: a pair of token channels (`added`/`removed`), a
//! start action, and a close action.
//!
//! # Algebra
//!
//! ```text
//! just(v)                 emit one value, forever present
//! nothing()               emit nothing
//! on_close(action)        emit unit, run `action` at teardown
//! flow.map(f)             transform emitted values
//! flow.flat_map(k)        spawn an inner flow per emitted value,
//!                         torn down when that value departs
//! flow.then(next)         sequence: run `next` once `flow` produces
//! flow.for_each(k)        flat_map discarding the produced values
//! ```
//!
//! # The Cascade
//!
//! `flat_map` is where dependency tracking lives. Each token emitted by
//! the outer flow materializes and starts one inner execution, recorded
//! in an identity-keyed table. When the outer token departs, the inner
//! execution for that identity is closed; when the outer execution is
//! closed, every live inner execution is closed exactly once.
//!
//! ```text
//! outer added ──► k(value) ──► inner execution ──► inner added ──► added
//! outer removed ─────────────► close inner execution
//! close ─────────────────────► close every live inner, then upstream
//! ```
//!
//! Residual `removed` emissions produced while an inner execution tears
//! down are not forwarded upward; the departure of the outer token is
//! itself the teardown signal. The generic `flat_map`'s own `removed`
//! channel is consequently silent — only registry-backed sources (see
//! [`crate::tracking`]) report departures.
//!
//! # Example
//!
//! ```rust
//! use cim_service_flow::{just, run, MemoryRegistry};
//!
//! let registry = MemoryRegistry::new().context();
//! let flow = just(2).map(|x| x * 21);
//!
//! let execution = run(&registry, &flow).expect("flow materializes");
//! execution.close();
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, error};

use crate::channel::Channel;
use crate::errors::FlowResult;
use crate::host::HostContext;
use crate::token::{Token, TokenId};

pub(crate) type StartAction = Arc<dyn Fn() -> FlowResult<()> + Send + Sync>;
pub(crate) type CloseAction = Arc<dyn Fn() + Send + Sync>;

pub(crate) fn noop_start() -> StartAction {
    Arc::new(|| Ok(()))
}

pub(crate) fn noop_close() -> CloseAction {
    Arc::new(|| {})
}

/// The materialized handle of an executing flow
///
/// Holds the `added`/`removed` token channels and the start/close
/// actions wired to the host. An execution is owned by whoever
/// materialized the flow; its close is single-shot by convention and is
/// enforced at the top level by [`run`].
pub struct Execution<T> {
    added: Channel<T>,
    removed: Channel<T>,
    start: StartAction,
    close: CloseAction,
}

impl<T> Clone for Execution<T> {
    fn clone(&self) -> Self {
        Self {
            added: self.added.clone(),
            removed: self.removed.clone(),
            start: Arc::clone(&self.start),
            close: Arc::clone(&self.close),
        }
    }
}

impl<T> Execution<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        added: Channel<T>,
        removed: Channel<T>,
        start: StartAction,
        close: CloseAction,
    ) -> Self {
        Self {
            added,
            removed,
            start,
            close,
        }
    }

    /// Channel of appearing tokens
    pub fn added(&self) -> &Channel<T> {
        &self.added
    }

    /// Channel of departing tokens
    pub fn removed(&self) -> &Channel<T> {
        &self.removed
    }

    /// Wire the execution to the host and begin emission
    ///
    /// Idempotent by convention, not by enforcement; [`run`] invokes it
    /// once. Materialize-then-start by hand when listeners must be in
    /// place before the first emission.
    pub fn start(&self) -> FlowResult<()> {
        (self.start)()
    }

    /// Release every resource acquired since start
    ///
    /// Best-effort: failures during teardown are logged, never returned.
    pub fn close(&self) {
        (self.close)();
    }

    pub(crate) fn close_action(&self) -> CloseAction {
        Arc::clone(&self.close)
    }
}

/// A declarative description of a reactive dependency computation
///
/// Flows are immutable and cheap to clone; executing one builds an
/// [`Execution`]. The description is a thunk from host context to
/// execution, held behind an `Arc` so composed flows share structure.
pub struct Flow<T> {
    operation: Arc<dyn Fn(&HostContext) -> FlowResult<Execution<T>> + Send + Sync>,
}

impl<T> Clone for Flow<T> {
    fn clone(&self) -> Self {
        Self {
            operation: Arc::clone(&self.operation),
        }
    }
}

impl<T> Flow<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn from_operation<F>(operation: F) -> Self
    where
        F: Fn(&HostContext) -> FlowResult<Execution<T>> + Send + Sync + 'static,
    {
        Self {
            operation: Arc::new(operation),
        }
    }

    /// Run the flow's operation against `registry`, producing an
    /// execution that has not been started yet
    ///
    /// Most callers want [`run`], which also starts the execution and
    /// guards its close. Materializing by hand leaves room to subscribe
    /// listeners before the first emission.
    pub fn materialize(&self, registry: &HostContext) -> FlowResult<Execution<T>> {
        (self.operation)(registry)
    }

    /// Transform every emitted value
    ///
    /// Both channels are transformed; token identity is preserved, so
    /// removals still pair with their additions downstream.
    pub fn map<S, F>(self, f: F) -> Flow<S>
    where
        S: Clone + Send + Sync + 'static,
        F: Fn(T) -> S + Send + Sync + 'static,
    {
        let operation = self.operation;
        let f = Arc::new(f);
        Flow::from_operation(move |registry| {
            let execution = operation(registry)?;
            let on_added = Arc::clone(&f);
            let on_removed = Arc::clone(&f);
            Ok(Execution::new(
                execution.added().map(move |value| on_added(value)),
                execution.removed().map(move |value| on_removed(value)),
                Arc::clone(&execution.start),
                execution.close_action(),
            ))
        })
    }

    /// Spawn an inner flow per emitted value, torn down when the value
    /// departs
    ///
    /// Inner `added` tokens are forwarded to the resulting flow's
    /// `added` channel unchanged. Failures while materializing or
    /// starting an inner flow are logged and the outer token is skipped;
    /// the cascade runs on the host's dispatch stack and has no caller
    /// to report to.
    pub fn flat_map<S, K>(self, k: K) -> Flow<S>
    where
        S: Clone + Send + Sync + 'static,
        K: Fn(T) -> Flow<S> + Send + Sync + 'static,
    {
        let operation = self.operation;
        let k = Arc::new(k);
        Flow::from_operation(move |registry| {
            let live: Arc<Mutex<HashMap<TokenId, Execution<S>>>> =
                Arc::new(Mutex::new(HashMap::new()));
            // Set exactly once, by start; taken at most once, by close.
            let upstream_close: Arc<Mutex<Option<CloseAction>>> = Arc::new(Mutex::new(None));

            let added = Channel::new();
            // Never sourced: the outer removal is the teardown signal.
            let removed = Channel::new();

            let close: CloseAction = {
                let live = Arc::clone(&live);
                let upstream_close = Arc::clone(&upstream_close);
                Arc::new(move || {
                    let mut table = live.lock().unwrap_or_else(PoisonError::into_inner);
                    debug!(inner = table.len(), "closing cascade");
                    for (_, inner) in table.drain() {
                        inner.close();
                    }
                    drop(table);

                    let upstream = upstream_close
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .take();
                    if let Some(upstream) = upstream {
                        upstream();
                    }
                })
            };

            let start: StartAction = {
                let operation = Arc::clone(&operation);
                let k = Arc::clone(&k);
                let live = Arc::clone(&live);
                let upstream_close = Arc::clone(&upstream_close);
                let registry = Arc::clone(registry);
                let added_out = added.emitter();
                Arc::new(move || {
                    let upstream = operation(&registry)?;
                    *upstream_close
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = Some(upstream.close_action());

                    let spawn_k = Arc::clone(&k);
                    let spawn_registry = Arc::clone(&registry);
                    let spawn_live = Arc::clone(&live);
                    let spawn_added = added_out.clone();
                    upstream.added().subscribe(move |outer: &Token<T>| {
                        let inner_flow = spawn_k(outer.value().clone());
                        let inner = match inner_flow.materialize(&spawn_registry) {
                            Ok(inner) => inner,
                            Err(err) => {
                                error!(error = %err, "inner flow failed to materialize");
                                return;
                            }
                        };

                        spawn_live
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .insert(outer.id(), inner.clone());

                        let forward = spawn_added.clone();
                        inner.added().subscribe(move |token| forward.emit(token.clone()));

                        if let Err(err) = inner.start() {
                            error!(error = %err, "inner flow failed to start");
                        }
                    });

                    let drop_live = Arc::clone(&live);
                    upstream.removed().subscribe(move |outer: &Token<T>| {
                        let mut table = drop_live.lock().unwrap_or_else(PoisonError::into_inner);
                        if let Some(inner) = table.remove(&outer.id()) {
                            inner.close();
                        }
                    });

                    upstream.start()
                })
            };

            Ok(Execution::new(added, removed, start, close))
        })
    }

    /// Sequence: once this flow produces a value, run `next`
    ///
    /// The produced value is discarded; `next` is torn down when the
    /// value departs.
    pub fn then<S>(self, next: Flow<S>) -> Flow<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        self.flat_map(move |_| next.clone())
    }

    /// Spawn an inner flow per value, discarding everything it produces
    pub fn for_each<S, K>(self, k: K) -> Flow<()>
    where
        S: Clone + Send + Sync + 'static,
        K: Fn(T) -> Flow<S> + Send + Sync + 'static,
    {
        self.flat_map(k).map(|_| ())
    }
}

/// A flow that emits `value` once on start and never removes it
pub fn just<T>(value: T) -> Flow<T>
where
    T: Clone + Send + Sync + 'static,
{
    Flow::from_operation(move |_| {
        let added = Channel::new();
        let emitter = added.emitter();
        let value = value.clone();
        let start: StartAction = Arc::new(move || {
            emitter.emit(Token::new(value.clone()));
            Ok(())
        });
        Ok(Execution::new(added, Channel::new(), start, noop_close()))
    })
}

/// A flow that never emits
pub fn nothing<T>() -> Flow<T>
where
    T: Clone + Send + Sync + 'static,
{
    Flow::from_operation(|_| {
        Ok(Execution::new(
            Channel::new(),
            Channel::new(),
            noop_start(),
            noop_close(),
        ))
    })
}

/// A flow that emits unit on start and runs `action` at teardown
///
/// Attaches an arbitrary cleanup step at a chosen point in a
/// composition:
///
/// ```rust,ignore
/// services("db", None)
///     .flat_map(move |db| connect(db).then(on_close(|| disconnect())))
/// ```
pub fn on_close<F>(action: F) -> Flow<()>
where
    F: Fn() + Send + Sync + 'static,
{
    let action: CloseAction = Arc::new(action);
    Flow::from_operation(move |_| {
        let added = Channel::new();
        let emitter = added.emitter();
        let start: StartAction = Arc::new(move || {
            emitter.emit(Token::new(()));
            Ok(())
        });
        Ok(Execution::new(
            added,
            Channel::new(),
            start,
            Arc::clone(&action),
        ))
    })
}

/// Re-target `flow` at a captured registry, ignoring the one it is
/// eventually executed against
///
/// Used to embed a sub-flow that must talk to a foreign registry.
pub fn with_registry<T>(registry: HostContext, flow: Flow<T>) -> Flow<T>
where
    T: Clone + Send + Sync + 'static,
{
    Flow::from_operation(move |_| flow.materialize(&registry))
}

/// Execute `flow` against `registry`
///
/// Materializes the flow, wraps its close action in a single-shot
/// guard, starts it, and returns the running execution. Invoking
/// [`Execution::close`] on the returned handle more than once is safe;
/// only the first invocation performs work.
///
/// # Errors
///
/// Any error surfaced while materializing or starting the flow.
pub fn run<T>(registry: &HostContext, flow: &Flow<T>) -> FlowResult<Execution<T>>
where
    T: Clone + Send + Sync + 'static,
{
    let execution = flow.materialize(registry)?;

    let executed = AtomicBool::new(false);
    let inner_close = execution.close_action();
    let close: CloseAction = Arc::new(move || {
        if !executed.swap(true, Ordering::SeqCst) {
            inner_close();
        }
    });

    execution.start()?;
    debug!("flow started");

    Ok(Execution::new(
        execution.added,
        execution.removed,
        execution.start,
        close,
    ))
}

/// Close a running execution
///
/// Equivalent to [`Execution::close`]; provided for symmetry with
/// [`run`].
pub fn close<T>(execution: &Execution<T>)
where
    T: Clone + Send + Sync + 'static,
{
    execution.close();
}
