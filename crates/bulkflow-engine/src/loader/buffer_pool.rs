//! Shared pool of fixed-capacity encode buffers
//!
//! Loaders borrow a buffer per chunk. The [`PooledBuffer`] guard hands it back when dropped,
//! on every path including errors and cancellation.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    buffer_capacity: usize,
    max_idle: usize,
    outstanding: AtomicUsize,
}

impl BufferPool {
    pub fn new(buffer_capacity: usize, max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::with_capacity(max_idle)),
            buffer_capacity,
            max_idle,
            outstanding: AtomicUsize::new(0),
        })
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    /// Borrow an empty buffer with at least the pool's capacity
    pub fn checkout(self: &Arc<Self>) -> PooledBuffer {
        let reused = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let buf = reused.unwrap_or_else(|| Vec::with_capacity(self.buffer_capacity));
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        PooledBuffer {
            buf,
            pool: Arc::clone(self),
        }
    }

    /// Buffers currently borrowed
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Buffers waiting in the free list
    pub fn idle(&self) -> usize {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn give_back(&self, mut buf: Vec<u8>) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        buf.clear();
        if buf.capacity() > self.buffer_capacity * 2 {
            buf.shrink_to(self.buffer_capacity);
        }
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.max_idle {
            free.push(buf);
        }
    }
}

/// A borrowed buffer; returns to its pool on drop
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    /// Bytes that still fit before the buffer reaches the pool capacity
    pub fn remaining(&self) -> usize {
        self.pool.buffer_capacity.saturating_sub(self.buf.len())
    }
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.give_back(std::mem::take(&mut self.buf));
    }
}
