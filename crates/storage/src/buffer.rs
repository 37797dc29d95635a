//! Update-stream I/O buffers
//!
//! Update generation and replay each hold one byte buffer for the duration
//! of the call. Buffers come from a shared pool as RAII guards, so a buffer
//! is returned on every exit path, including early returns on error.

use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

#[derive(Debug)]
struct PoolState {
    free: Vec<Vec<u8>>,
    outstanding: usize,
    max_outstanding: usize,
    buffer_size: usize,
}

/// Pool of update-stream buffers
///
/// Cloning the pool yields another handle to the same buffers.
#[derive(Debug, Clone)]
pub struct BufferPool {
    state: Arc<Mutex<PoolState>>,
}

impl BufferPool {
    /// Create a pool of buffers of `buffer_size` bytes, at most
    /// `max_outstanding` of which may be held at once
    pub fn new(buffer_size: usize, max_outstanding: usize) -> Self {
        BufferPool {
            state: Arc::new(Mutex::new(PoolState {
                free: Vec::new(),
                outstanding: 0,
                max_outstanding,
                buffer_size,
            })),
        }
    }

    /// Acquire a buffer, or `None` if the pool is exhausted
    pub fn acquire(&self) -> Option<IoBuffer> {
        let mut state = self.state.lock();
        if state.outstanding >= state.max_outstanding {
            return None;
        }
        state.outstanding += 1;
        let buffer_size = state.buffer_size;
        let mut bytes = state
            .free
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(buffer_size));
        bytes.clear();
        Some(IoBuffer {
            bytes,
            limit: buffer_size,
            state: Arc::clone(&self.state),
        })
    }

    /// Number of buffers currently held
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }

    /// Configured buffer size
    pub fn buffer_size(&self) -> usize {
        self.state.lock().buffer_size
    }
}

/// A buffer borrowed from a [`BufferPool`], returned on drop
#[derive(Debug)]
pub struct IoBuffer {
    bytes: Vec<u8>,
    limit: usize,
    state: Arc<Mutex<PoolState>>,
}

impl IoBuffer {
    /// Whether the buffered bytes reached the flush threshold
    pub fn is_full(&self) -> bool {
        self.bytes.len() >= self.limit
    }

    /// Flush threshold in bytes
    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl Deref for IoBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.bytes
    }
}

impl DerefMut for IoBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.bytes
    }
}

impl Drop for IoBuffer {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
        let bytes = std::mem::take(&mut self.bytes);
        state.free.push(bytes);
    }
}
