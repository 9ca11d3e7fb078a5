//! In-memory load accounting for connections.
//!
//! A [`LoadCounter`] counts in-flight `PerformWork` calls attributed to one
//! link. Counting is done through a [`LoadGuard`] so the decrement happens
//! on every exit path, including errors and cancelled futures.

use std::sync::atomic::{AtomicU64, Ordering};

/// Non-negative count of in-flight work on one connection.
#[derive(Debug, Default)]
pub struct LoadCounter {
    in_flight: AtomicU64,
}

impl LoadCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current number of in-flight calls.
    pub fn current(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Count one call until the returned guard is dropped.
    pub fn track(&self) -> LoadGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        LoadGuard { counter: self }
    }
}

/// Decrements its [`LoadCounter`] when dropped.
#[derive(Debug)]
pub struct LoadGuard<'a> {
    counter: &'a LoadCounter,
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        // Saturating: a counter can never go below zero.
        let _ = self
            .counter
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            });
    }
}
