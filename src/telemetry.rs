//! Named counters for compiler-internals observability.
//!
//! Counters are registered by name ("isel.fail.wrong_class",
//! "deopt_group.groups_formed", ...) and incremented from anywhere in the
//! compiler. The registry is shared read-mostly across concurrent
//! compilations; increments are lock-free atomics, and registration of a new
//! name is the only write path. An out-of-scope reporting facility reads the
//! snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

// =============================================================================
// Counter
// =============================================================================

/// A single named counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Increment by one.
    #[inline]
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by an amount.
    #[inline]
    pub fn add(&self, amount: u64) {
        self.value.fetch_add(amount, Ordering::Relaxed);
    }

    /// Current value.
    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Registry
// =============================================================================

/// A registry of named counters.
///
/// Cloning is cheap (shared handle). Lookup caches should hold the returned
/// `Arc<Counter>` rather than re-resolving the name on every increment.
#[derive(Debug, Clone, Default)]
pub struct CounterRegistry {
    counters: Arc<DashMap<String, Arc<Counter>>>,
}

impl CounterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or register a counter by name.
    pub fn counter(&self, name: &str) -> Arc<Counter> {
        if let Some(existing) = self.counters.get(name) {
            return existing.clone();
        }
        self.counters
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Increment a counter by name (registering it if new).
    pub fn inc(&self, name: &str) {
        self.counter(name).inc();
    }

    /// Current value of a counter, zero if unregistered.
    pub fn get(&self, name: &str) -> u64 {
        self.counters.get(name).map(|c| c.get()).unwrap_or(0)
    }

    /// Snapshot all counters, sorted by name.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let mut entries: Vec<(String, u64)> = self
            .counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().get()))
            .collect();
        entries.sort();
        entries
    }

    /// Number of registered counters.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Check if no counters are registered.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
