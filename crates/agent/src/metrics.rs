use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Counts the places where the pipeline chose to keep going on a degraded
/// answer instead of failing the run.
#[derive(Debug, Default)]
pub struct FallbackMetrics {
    routing_defaults: AtomicU64,
    parse_failures: AtomicU64,
    memory_store_failures: AtomicU64,
    ai_retries: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackSnapshot {
    pub routing_defaults: u64,
    pub parse_failures: u64,
    pub memory_store_failures: u64,
    pub ai_retries: u64,
}

impl FallbackMetrics {
    pub fn record_routing_default(&self) {
        self.routing_defaults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parse_failure(&self) {
        self.parse_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_memory_store_failure(&self) {
        self.memory_store_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ai_retry(&self) {
        self.ai_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FallbackSnapshot {
        FallbackSnapshot {
            routing_defaults: self.routing_defaults.load(Ordering::Relaxed),
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
            memory_store_failures: self.memory_store_failures.load(Ordering::Relaxed),
            ai_retries: self.ai_retries.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.routing_defaults,
            &self.parse_failures,
            &self.memory_store_failures,
            &self.ai_retries,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
