use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;

/// Size of one relay chunk; a single read never returns more than this
pub const CHUNK_SIZE: usize = 32 * 1024;

const MAX_POOL_SIZE: usize = 64;

/// Pool of relay chunk buffers
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(MAX_POOL_SIZE)),
        }
    }

    /// Get a zeroed `CHUNK_SIZE` buffer from the pool or allocate a new one
    pub fn get_buffer(&self) -> Vec<u8> {
        self.buffers
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; CHUNK_SIZE])
    }

    /// Return a buffer to the pool for reuse
    pub fn return_buffer(&self, mut buffer: Vec<u8>) {
        // Reject buffers with wrong capacity to avoid memory bloat
        if buffer.capacity() < CHUNK_SIZE || buffer.capacity() > CHUNK_SIZE * 2 {
            return;
        }

        // Zero the buffer on return to avoid leaking data between connections
        buffer.clear();
        buffer.resize(CHUNK_SIZE, 0);

        let mut pool = self.buffers.lock();
        if pool.len() < MAX_POOL_SIZE {
            pool.push(buffer);
        }
    }

    /// Number of buffers currently parked in the pool
    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.buffers.lock().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

static BUFFER_POOL: std::sync::OnceLock<BufferPool> = std::sync::OnceLock::new();

fn buffer_pool() -> &'static BufferPool {
    BUFFER_POOL.get_or_init(BufferPool::new)
}

/// RAII lease that returns the buffer to the global pool on drop
#[derive(Debug)]
pub struct BufferLease {
    buffer: Vec<u8>,
}

impl Deref for BufferLease {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buffer
    }
}

impl DerefMut for BufferLease {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        buffer_pool().return_buffer(std::mem::take(&mut self.buffer));
    }
}

/// Lease a chunk buffer from the global pool
pub fn lease_buffer() -> BufferLease {
    BufferLease {
        buffer: buffer_pool().get_buffer(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_pool_basic_operations() {
        let pool = BufferPool::new();

        let buf = pool.get_buffer();
        assert_eq!(buf.len(), CHUNK_SIZE);

        pool.return_buffer(buf);
        assert_eq!(pool.available(), 1);

        let reused = pool.get_buffer();
        assert_eq!(reused.len(), CHUNK_SIZE);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_buffer_pool_size_limit() {
        let pool = BufferPool::new();
        let buffers: Vec<_> = (0..MAX_POOL_SIZE + 10).map(|_| pool.get_buffer()).collect();
        for buf in buffers {
            pool.return_buffer(buf);
        }
        assert_eq!(pool.available(), MAX_POOL_SIZE);
    }

    #[test]
    fn test_buffer_pool_wrong_size_rejection() {
        let pool = BufferPool::new();
        pool.return_buffer(vec![0u8; 4_096]);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_reused_buffer_length_and_zeroing() {
        let pool = BufferPool::new();

        let mut buf = pool.get_buffer();
        buf.fill(0xAA);
        buf.truncate(128);
        pool.return_buffer(buf);

        let reused = pool.get_buffer();
        assert_eq!(reused.len(), CHUNK_SIZE);
        assert!(reused.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_lease_derefs_to_full_chunk() {
        let mut lease = lease_buffer();
        assert_eq!(lease.len(), CHUNK_SIZE);
        lease[0] = 7;
        assert_eq!(lease[0], 7);
    }
}
