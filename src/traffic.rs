use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide relay counters (bytes and chunks)
#[derive(Debug, Default)]
pub struct TrafficCounters {
    forwarded_bytes: AtomicU64,
    dropped_bytes: AtomicU64,
    dropped_chunks: AtomicU64,
}

/// Point-in-time copy of [`TrafficCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    pub forwarded_bytes: u64,
    pub dropped_bytes: u64,
    pub dropped_chunks: u64,
}

impl TrafficCounters {
    pub fn add_forwarded(&self, n: u64) {
        self.forwarded_bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Record one discarded chunk of `n` bytes
    pub fn add_dropped(&self, n: u64) {
        self.dropped_bytes.fetch_add(n, Ordering::Relaxed);
        self.dropped_chunks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            forwarded_bytes: self.forwarded_bytes.load(Ordering::Relaxed),
            dropped_bytes: self.dropped_bytes.load(Ordering::Relaxed),
            dropped_chunks: self.dropped_chunks.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.forwarded_bytes.store(0, Ordering::Relaxed);
        self.dropped_bytes.store(0, Ordering::Relaxed);
        self.dropped_chunks.store(0, Ordering::Relaxed);
    }
}
