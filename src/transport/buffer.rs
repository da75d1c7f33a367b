//! Reusable datagram buffers for the endpoint loop.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Shared pool of datagram-sized scratch buffers.
///
/// The loop is the only steady-state user; pooling keeps receive and
/// send staging free of per-datagram allocation.
#[derive(Clone, Debug)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    buffers: Mutex<VecDeque<Vec<u8>>>,
    buffer_size: usize,
    max_buffers: usize,
}

impl BufferPool {
    /// Pool of `max_buffers` buffers of `buffer_size` bytes each.
    #[must_use]
    pub fn new(buffer_size: usize, max_buffers: usize) -> Self {
        assert!(buffer_size > 0, "buffer_size must be positive");
        assert!(max_buffers > 0, "max_buffers must be positive");
        Self {
            inner: Arc::new(PoolInner {
                buffers: Mutex::new(VecDeque::with_capacity(max_buffers)),
                buffer_size,
                max_buffers,
            }),
        }
    }

    /// Lease a buffer, allocating when the pool is dry.
    #[must_use]
    pub fn acquire(&self) -> Buffer {
        let mut guard = self.inner.buffers.lock().expect("buffer pool mutex poisoned");
        let data = guard
            .pop_front()
            .unwrap_or_else(|| vec![0u8; self.inner.buffer_size]);
        Buffer {
            data: Some(data),
            pool: Arc::clone(&self.inner),
            len: 0,
        }
    }

    /// Capacity of each leased buffer.
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }
}

/// Buffer leased from the pool; returns on drop.
pub struct Buffer {
    data: Option<Vec<u8>>,
    pool: Arc<PoolInner>,
    len: usize,
}

impl Buffer {
    /// Whole backing region for writes.
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.data.as_mut().expect("buffer still leased")
    }

    /// Filled portion.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data.as_ref().expect("buffer still leased")[..self.len]
    }

    /// Record how many bytes are meaningful.
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.data.as_ref().map_or(0, Vec::len));
        self.len = len;
    }

    /// Meaningful length.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether no bytes are meaningful.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(mut data) = self.data.take() {
            data.fill(0);
            let mut guard = self.pool.buffers.lock().expect("buffer pool mutex poisoned");
            if guard.len() < self.pool.max_buffers {
                guard.push_back(data);
            }
        }
    }
}
