// Copyright (c) 2025 - Cowboy AI, Inc.
//! Test Fixtures for cim-service-flow
//!
//! Deterministic helpers shared by the integration suites: fixed
//! interface names and pids, property builders, and a recording sink
//! that captures every token an execution emits.
//!
//! # Design Principles
//! - Fixed names and dictionaries, no clocks or randomness
//! - Tests observe executions only through `RecordingSink`
//! - Fixtures never start or close executions themselves

use std::sync::{Arc, Mutex};

use serde_json::Value;

use cim_service_flow::{ConfigDictionary, Execution, ServiceProperties, Token, TokenId};

// Fixed interface names
pub const DB_INTERFACE: &str = "com.example.db";
pub const CACHE_INTERFACE: &str = "com.example.cache";

// Fixed configuration pids
pub const DB_PID: &str = "com.example.db.settings";
pub const POOL_FACTORY_PID: &str = "com.example.pool.factory";

/// A database service payload used across the suites
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbService {
    pub id: u32,
}

/// Build service properties from literal pairs
pub fn properties(pairs: &[(&str, Value)]) -> ServiceProperties {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Build a configuration dictionary from literal pairs
pub fn dictionary(pairs: &[(&str, Value)]) -> ConfigDictionary {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Captures every token an execution emits on both channels
pub struct RecordingSink<T> {
    added: Arc<Mutex<Vec<Token<T>>>>,
    removed: Arc<Mutex<Vec<Token<T>>>>,
}

impl<T: Clone + Send + Sync + 'static> RecordingSink<T> {
    /// Subscribe to both channels of `execution`
    ///
    /// Attach before starting the execution; channels do not replay.
    pub fn attach(execution: &Execution<T>) -> Self {
        let added = Arc::new(Mutex::new(Vec::new()));
        let removed = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&added);
        execution
            .added()
            .subscribe(move |token| sink.lock().unwrap().push(token.clone()));
        let sink = Arc::clone(&removed);
        execution
            .removed()
            .subscribe(move |token| sink.lock().unwrap().push(token.clone()));

        Self { added, removed }
    }

    pub fn added_tokens(&self) -> Vec<Token<T>> {
        self.added.lock().unwrap().clone()
    }

    pub fn removed_tokens(&self) -> Vec<Token<T>> {
        self.removed.lock().unwrap().clone()
    }

    pub fn added_values(&self) -> Vec<T> {
        self.added
            .lock()
            .unwrap()
            .iter()
            .map(|token| token.value().clone())
            .collect()
    }

    pub fn added_ids(&self) -> Vec<TokenId> {
        self.added.lock().unwrap().iter().map(Token::id).collect()
    }

    pub fn removed_ids(&self) -> Vec<TokenId> {
        self.removed.lock().unwrap().iter().map(Token::id).collect()
    }

    pub fn added_count(&self) -> usize {
        self.added.lock().unwrap().len()
    }

    pub fn removed_count(&self) -> usize {
        self.removed.lock().unwrap().len()
    }
}
