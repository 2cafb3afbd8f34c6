//! Cache operation counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-lifetime counters, shared between the request handlers, the
/// cache, and the eviction manager
#[derive(Debug, Default)]
pub struct CacheStats {
    pub gets: AtomicU64,
    pub cold_gets: AtomicU64,
    pub puts: AtomicU64,
    pub lists: AtomicU64,
    pub errors: AtomicU64,
    pub bytes_fetched: AtomicU64,
    pub evicted_objects: AtomicU64,
    pub bytes_evicted: AtomicU64,
}

/// Point-in-time copy of the counters, serialized for `GET /v1/daemon`
#[derive(Clone, Copy, Debug, Serialize)]
pub struct StatsSnapshot {
    pub gets: u64,
    pub cold_gets: u64,
    pub puts: u64,
    pub lists: u64,
    pub errors: u64,
    pub bytes_fetched: u64,
    pub evicted_objects: u64,
    pub bytes_evicted: u64,
}

impl CacheStats {
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            gets: self.gets.load(Ordering::Relaxed),
            cold_gets: self.cold_gets.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            lists: self.lists.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            bytes_fetched: self.bytes_fetched.load(Ordering::Relaxed),
            evicted_objects: self.evicted_objects.load(Ordering::Relaxed),
            bytes_evicted: self.bytes_evicted.load(Ordering::Relaxed),
        }
    }
}
