//! The buffer pool.
//!
//! Hands out [`ContentBuffer`]s and takes them back on release. Memory is bounded by a semaphore
//! with one permit per chunk: a fetched chunk stays cached only if it got a permit, otherwise it
//! is handed to its readers and dropped. Reads never wait on the pool.

use std::sync::{Arc, Weak};

use bytesize::ByteSize;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use super::content::ContentBuffer;

/// Sizing for a [`BufferPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Upper bound on bytes held in cached chunks across all buffers.
    pub max_memory: ByteSize,
    /// Fetch and cache granularity.
    pub chunk_size: ByteSize,
    /// How many released buffers to keep for reuse.
    pub max_idle: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_memory: ByteSize::mib(512),
            chunk_size: ByteSize::mib(1),
            max_idle: 16,
        }
    }
}

/// Issues and reclaims content buffers under a global memory bound.
pub struct BufferPool {
    this: Weak<Self>,
    config: PoolConfig,
    total_permits: usize,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<ContentBuffer>>,
}

impl BufferPool {
    /// Create a pool.
    #[must_use]
    pub fn new(config: PoolConfig) -> Arc<Self> {
        let chunk = config.chunk_size.as_u64().max(1);
        let total_permits = usize::try_from(config.max_memory.as_u64() / chunk)
            .unwrap_or(usize::MAX)
            .min(Semaphore::MAX_PERMITS);
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            config,
            total_permits,
            permits: Arc::new(Semaphore::new(total_permits)),
            idle: Mutex::new(Vec::new()),
        })
    }

    /// A buffer for the file at `link` of `size` bytes, recycled if one is idle.
    pub fn acquire(&self, link: Option<String>, size: u64) -> Arc<ContentBuffer> {
        let recycled = self.idle.lock().pop();
        let buffer = match recycled {
            Some(buffer) => buffer.rebind(link, size),
            None => ContentBuffer::new(
                self.this.clone(),
                self.config.chunk_size.as_u64(),
                link,
                size,
            ),
        };
        Arc::new(buffer)
    }

    /// Take back a buffer whose handle was released.
    ///
    /// A buffer still referenced by an in-flight read is dropped instead of recycled.
    pub fn reclaim(&self, buffer: Arc<ContentBuffer>) {
        let Ok(buffer) = Arc::try_unwrap(buffer) else {
            debug!("buffer still in use, not recycling");
            return;
        };
        let buffer = buffer.rebind(None, 0);
        let mut idle = self.idle.lock();
        if idle.len() < self.config.max_idle {
            idle.push(buffer);
        }
    }

    /// Drop all idle buffers. Returns how many were dropped.
    pub fn trim(&self) -> usize {
        let mut idle = self.idle.lock();
        let n = idle.len();
        idle.clear();
        n
    }

    /// Claim room for one chunk, if any is left.
    pub(super) fn try_reserve(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.permits).try_acquire_owned().ok()
    }

    /// Bytes currently held by cached chunks.
    #[must_use]
    pub fn retained_bytes(&self) -> u64 {
        let used = self.total_permits - self.permits.available_permits();
        used as u64 * self.config.chunk_size.as_u64()
    }

    /// Number of buffers waiting for reuse.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// The configuration this pool was built with.
    #[must_use]
    pub fn config(&self) -> PoolConfig {
        self.config
    }
}
