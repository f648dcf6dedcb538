use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Tracks proxied connections for status reporting
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    active: AtomicUsize,
    total: AtomicU64,
}

impl ConnectionTracker {
    /// Register a new connection and return a guard that releases it on drop.
    ///
    /// Connection ids start at 1 and are unique for the tracker's lifetime.
    pub fn open(&self) -> ConnectionGuard<'_> {
        self.active.fetch_add(1, Ordering::AcqRel);
        let id = self.total.fetch_add(1, Ordering::Relaxed) + 1;
        ConnectionGuard {
            tracker: self,
            id,
            released: false,
        }
    }

    /// Number of connections currently being handled
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Number of connections accepted since startup
    pub fn total_count(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// RAII guard to ensure the active count is properly decremented
#[derive(Debug)]
pub struct ConnectionGuard<'a> {
    tracker: &'a ConnectionTracker,
    id: u64,
    released: bool,
}

impl ConnectionGuard<'_> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Manually release the connection slot
    pub fn release(&mut self) {
        if !self.released {
            self.tracker.active.fetch_sub(1, Ordering::AcqRel);
            self.released = true;
        }
    }
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
