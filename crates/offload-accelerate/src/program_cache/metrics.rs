use std::sync::atomic::{AtomicU64, Ordering};

pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    last_compile_millis: AtomicU64,
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            last_compile_millis: AtomicU64::new(0),
        }
    }

    pub fn inc_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// `(hits, misses)`
    pub fn counters(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    pub fn set_last_compile_millis(&self, ms: u64) {
        self.last_compile_millis.store(ms, Ordering::Relaxed);
    }

    pub fn last_compile_millis(&self) -> u64 {
        self.last_compile_millis.load(Ordering::Relaxed)
    }
}
