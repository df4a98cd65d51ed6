// Copyright (c) 2025 - Cowboy AI, Inc.
//! Synchronous Broadcast Channels
//!
//! A `Channel<T>` fans a stream of [`Token<T>`]s out to an append-only
//! set of listeners. There is no buffer and no thread: emitting a token
//! synchronously invokes every currently installed listener, in
//! installation order, on the emitting thread's own stack.
//!
//! ```text
//! Emitter ──emit(token)──► [listener 1] [listener 2] … [listener n]
//!                           (installation order, same stack)
//! ```
//!
//! # Ordering
//!
//! - Listeners run in installation order for each emission.
//! - A listener installed while an emission is in progress is not
//!   invoked for that emission; it sees only later events.
//!
//! # Thread Safety
//!
//! The listener table is serialized internally, but the channel assumes
//! a single producer (or externally serialized producers). Two
//! concurrent emissions from different threads interleave without any
//! ordering guarantee.

use std::sync::{Arc, Mutex, PoisonError};

use crate::token::Token;

type Listener<T> = Arc<dyn Fn(&Token<T>) + Send + Sync>;

/// Multi-subscriber broadcast of provenance tokens
pub struct Channel<T> {
    listeners: Arc<Mutex<Vec<Listener<T>>>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            listeners: Arc::clone(&self.listeners),
        }
    }
}

impl<T> Default for Channel<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Channel<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a channel with an empty listener set
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The write endpoint of this channel
    ///
    /// Every emitter obtained from the same channel feeds the same
    /// listener set; by convention a channel has a single producer.
    pub fn emitter(&self) -> Emitter<T> {
        Emitter {
            listeners: Arc::clone(&self.listeners),
        }
    }

    /// Install a listener invoked for every subsequent emission
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&Token<T>) + Send + Sync + 'static,
    {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
    }

    /// Derive a downstream channel whose emissions are this channel's
    /// tokens with `f` applied to the payload
    ///
    /// Token identity is preserved: the downstream token carries the
    /// same [`TokenId`](crate::TokenId) as the upstream one.
    pub fn map<S, F>(&self, f: F) -> Channel<S>
    where
        S: Clone + Send + Sync + 'static,
        F: Fn(T) -> S + Send + Sync + 'static,
    {
        let downstream = Channel::new();
        let forward = downstream.emitter();
        self.subscribe(move |token| forward.emit(token.map(&f)));
        downstream
    }
}

/// Write endpoint of a [`Channel`]
pub struct Emitter<T> {
    listeners: Arc<Mutex<Vec<Listener<T>>>>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            listeners: Arc::clone(&self.listeners),
        }
    }
}

impl<T> Emitter<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Deliver `token` to every listener installed at this moment
    ///
    /// The listener table is snapshotted before delivery, so listeners
    /// installed by a listener do not observe the in-flight event.
    pub fn emit(&self, token: Token<T>) {
        let snapshot: Vec<Listener<T>> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for listener in snapshot {
            listener(&token);
        }
    }
}
