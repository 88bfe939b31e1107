//! Open-file handles.

use std::sync::Arc;

use super::inode::Inode;
use crate::cache::ContentBuffer;
use crate::remote::{FetchError, RangeFetcher};

/// Binds an open file to the content buffer that serves its reads.
///
/// Handles are shared through `Arc`; a read in flight keeps its handle, and so its buffer, alive
/// after the kernel releases it.
#[derive(Debug)]
pub struct FileHandle {
    inode: Arc<Inode>,
    buffer: Arc<ContentBuffer>,
}

impl FileHandle {
    /// Bind `inode` to `buffer`.
    #[must_use]
    pub fn new(inode: Arc<Inode>, buffer: Arc<ContentBuffer>) -> Self {
        Self { inode, buffer }
    }

    /// The file this handle reads.
    #[must_use]
    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// The buffer bound to this handle.
    #[must_use]
    pub fn buffer(&self) -> &Arc<ContentBuffer> {
        &self.buffer
    }

    /// Read into `dst` starting at `offset`.
    pub async fn read<F: RangeFetcher>(
        &self,
        fetcher: &F,
        offset: u64,
        dst: &mut [u8],
    ) -> Result<usize, FetchError> {
        self.buffer.read(fetcher, offset, dst).await
    }

    /// Give up the handle, returning its buffer.
    #[must_use]
    pub fn into_buffer(self) -> Arc<ContentBuffer> {
        self.buffer
    }
}
