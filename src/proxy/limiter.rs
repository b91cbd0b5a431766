use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Per-model concurrency slots. Acquisition is non-blocking: a refused
/// slot is the caller's cue to fail fast with 429 rather than queue, so
/// tail latency stays bounded and waiting is left to the account pool.
pub struct ModelRateLimiter {
    default_limit: usize,
    overrides: HashMap<String, usize>,
    in_flight: DashMap<String, Arc<AtomicUsize>>,
}

impl ModelRateLimiter {
    pub fn new(default_limit: usize, overrides: HashMap<String, usize>) -> Self {
        Self {
            default_limit: default_limit.max(1),
            overrides,
            in_flight: DashMap::new(),
        }
    }

    fn limit_for(&self, model: &str) -> usize {
        self.overrides
            .get(model)
            .copied()
            .unwrap_or(self.default_limit)
    }

    fn counter(&self, model: &str) -> Arc<AtomicUsize> {
        self.in_flight
            .entry(model.to_string())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone()
    }

    /// Take a slot if one is free. Never suspends.
    pub fn try_acquire(&self, model: &str) -> bool {
        let limit = self.limit_for(model);
        let counter = self.counter(model);
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                if current < limit {
                    Some(current + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// Give a slot back. Must run on every exit path of a request that
    /// acquired one; releasing below zero is clamped.
    pub fn release(&self, model: &str) {
        let counter = self.counter(model);
        let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
            Some(current.saturating_sub(1))
        });
    }

    pub fn in_flight(&self, model: &str) -> usize {
        self.in_flight
            .get(model)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}
