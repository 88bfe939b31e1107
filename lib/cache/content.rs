//! Per-file content buffers.
//!
//! A [`ContentBuffer`] caches the bytes of one remote file in fixed-size chunks. Each chunk is
//! fetched at most once at a time: readers that need a chunk already being fetched join that
//! fetch through the [`FutureBackedCache`] rather than issuing their own.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures::future::try_join_all;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, trace};

use super::async_backed::FutureBackedCache;
use super::pool::BufferPool;
use crate::remote::{FetchError, RangeFetcher};

/// A fetched chunk. Holds a pool permit while it is retained.
#[derive(Debug)]
struct Chunk {
    data: Bytes,
    permit: Option<OwnedSemaphorePermit>,
}

/// Chunked read cache over one remote file.
pub struct ContentBuffer {
    pool: Weak<BufferPool>,
    chunk_size: u64,
    link: Option<Arc<str>>,
    size: u64,
    chunks: FutureBackedCache<u64, Arc<Chunk>, FetchError>,
    dirty: AtomicBool,
}

impl std::fmt::Debug for ContentBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentBuffer")
            .field("link", &self.link)
            .field("size", &self.size)
            .field("chunks", &self.chunks.len())
            .field("dirty", &self.is_dirty())
            .finish_non_exhaustive()
    }
}

impl ContentBuffer {
    pub(super) fn new(
        pool: Weak<BufferPool>,
        chunk_size: u64,
        link: Option<String>,
        size: u64,
    ) -> Self {
        Self {
            pool,
            chunk_size: chunk_size.max(1),
            link: link.map(Arc::from),
            size,
            chunks: FutureBackedCache::default(),
            dirty: AtomicBool::new(true),
        }
    }

    /// Point a recycled buffer at a new file, dropping everything it held.
    pub(super) fn rebind(mut self, link: Option<String>, size: u64) -> Self {
        self.chunks.clear();
        self.link = link.map(Arc::from);
        self.size = size;
        self.dirty.store(true, Ordering::Release);
        self
    }

    /// Size of the file this buffer serves.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether nothing has been fetched into this buffer yet.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Start offsets of the chunks currently held.
    #[must_use]
    pub fn populated(&self) -> BTreeSet<u64> {
        (0..self.size.div_ceil(self.chunk_size))
            .filter(|idx| self.chunks.contains_ready(idx))
            .map(|idx| idx * self.chunk_size)
            .collect()
    }

    /// Copy bytes starting at `offset` into `dst`, fetching whatever is missing.
    ///
    /// Returns the number of bytes copied, which is short only at end of file. Fetch errors are
    /// returned as-is; nothing is retried here.
    #[expect(
        clippy::cast_possible_truncation,
        reason = "chunk offsets are bounded by chunk_size, which is bounded by memory"
    )]
    pub async fn read<F: RangeFetcher>(
        &self,
        fetcher: &F,
        offset: u64,
        dst: &mut [u8],
    ) -> Result<usize, FetchError> {
        if offset >= self.size || dst.is_empty() {
            return Ok(0);
        }
        let link = self.link.clone().ok_or(FetchError::MissingLink)?;
        let end = offset.saturating_add(dst.len() as u64).min(self.size);

        let first = offset / self.chunk_size;
        let last = (end - 1) / self.chunk_size;
        let chunks = try_join_all((first..=last).map(|idx| self.chunk(fetcher, &link, idx))).await?;
        self.dirty.store(false, Ordering::Release);

        let mut copied = 0;
        for (idx, chunk) in (first..=last).zip(&chunks) {
            let chunk_start = idx * self.chunk_size;
            let from = (offset.max(chunk_start) - chunk_start) as usize;
            let to = (end - chunk_start).min(chunk.data.len() as u64) as usize;
            let src = &chunk.data[from..to];
            dst[copied..copied + src.len()].copy_from_slice(src);
            copied += src.len();
        }

        for (idx, chunk) in (first..=last).zip(&chunks) {
            if chunk.permit.is_none() {
                self.chunks.remove_ready_if(&idx, |held| Arc::ptr_eq(held, chunk));
            }
        }

        trace!(offset, copied, "served read");
        Ok(copied)
    }

    async fn chunk<F: RangeFetcher>(
        &self,
        fetcher: &F,
        link: &Arc<str>,
        idx: u64,
    ) -> Result<Arc<Chunk>, FetchError> {
        let start = idx * self.chunk_size;
        let end = start.saturating_add(self.chunk_size).min(self.size);
        let fetcher = fetcher.clone();
        let link = Arc::clone(link);
        let pool = self.pool.clone();

        self.chunks
            .get_or_try_init(idx, move || async move {
                debug!(%link, start, end, "fetching chunk");
                let data = fetcher.fetch(&link, start..end).await?;
                let expected = end - start;
                let actual = data.len() as u64;
                if actual != expected {
                    return Err(FetchError::ShortRead { expected, actual });
                }
                let permit = pool.upgrade().and_then(|pool| pool.try_reserve());
                if permit.is_none() {
                    trace!(start, "pool exhausted, chunk will not be retained");
                }
                Ok(Arc::new(Chunk { data, permit }))
            })
            .await
    }
}
