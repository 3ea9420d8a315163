//! # Writer Pool
//!
//! Reusable encode buffers for outbound protocol messages.
//!
//! Every reply the engine produces (hail, approval snapshot, RPC response,
//! spawn broadcast) is encoded into a [`PooledWriter`]. Finishing the writer
//! copies the encoded bytes into an owned [`Bytes`] for the sender collaborator
//! and hands the allocation back to the pool when the writer is dropped.
//!
//! ## Usage
//! ```rust
//! use replica_protocol::utils::buffer_pool::WriterPool;
//!
//! let pool = WriterPool::new(4);
//! let mut writer = pool.writer();
//! writer.write_u64_packed(42);
//! let payload = writer.finish();
//! assert_eq!(&payload[..], &[42]);
//! assert_eq!(pool.available(), 4);
//! ```

use bytes::Bytes;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use crate::core::BitWriter;

/// Buffers that grew beyond this are released instead of pooled.
const MAX_POOLED_CAPACITY: usize = 16 * 1024;

/// Capacity of freshly allocated buffers.
const DEFAULT_CAPACITY: usize = 512;

/// A [`BitWriter`] whose allocation returns to its pool on drop.
pub struct PooledWriter {
    writer: BitWriter,
    pool: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl PooledWriter {
    /// Copy the encoded message out. The buffer goes back to the pool.
    pub fn finish(self) -> Bytes {
        Bytes::copy_from_slice(self.writer.as_slice())
    }
}

impl Deref for PooledWriter {
    type Target = BitWriter;

    fn deref(&self) -> &Self::Target {
        &self.writer
    }
}

impl DerefMut for PooledWriter {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.writer
    }
}

impl Drop for PooledWriter {
    fn drop(&mut self) {
        let buffer = std::mem::take(&mut self.writer).into_inner();
        if buffer.capacity() <= MAX_POOLED_CAPACITY {
            if let Ok(mut pool) = self.pool.lock() {
                pool.push(buffer);
            }
        }
    }
}

/// Thread-safe pool of encode buffers; clones share the same storage.
#[derive(Clone)]
pub struct WriterPool {
    pool: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl WriterPool {
    pub fn new(pool_size: usize) -> Self {
        let buffers = (0..pool_size)
            .map(|_| Vec::with_capacity(DEFAULT_CAPACITY))
            .collect();
        Self {
            pool: Arc::new(Mutex::new(buffers)),
        }
    }

    /// Take a cleared writer, allocating when the pool is empty.
    pub fn writer(&self) -> PooledWriter {
        let buffer = self
            .pool
            .lock()
            .ok()
            .and_then(|mut pool| pool.pop())
            .unwrap_or_else(|| Vec::with_capacity(DEFAULT_CAPACITY));

        PooledWriter {
            writer: BitWriter::from_vec(buffer),
            pool: Arc::clone(&self.pool),
        }
    }

    pub fn available(&self) -> usize {
        self.pool.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl Default for WriterPool {
    fn default() -> Self {
        Self::new(16)
    }
}
