//! The filesystem controller.
//!
//! [`AccessionFs`] owns the inode table, both handle maps and the buffer pool, and exposes the
//! operations the kernel adapter drives. Every operation takes addresses and handle IDs that the
//! kernel got from us; an unknown handle is a protocol violation and panics.

use std::ffi::{OsStr, OsString};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use accession_locator::models::Accession;
use tracing::{debug, info, instrument, trace, warn};

use super::dir_handle::DirHandle;
use super::error::{BuildError, FsError};
use super::file_handle::FileHandle;
use super::inode::Inode;
use super::table::InodeTable;
use super::{
    AttrReply, DirEntry, EntryReply, FsStats, HandleId, InodeAddr, InodeKind, ROOT_INODE,
};
use crate::cache::{BufferPool, PoolConfig};
use crate::remote::listing::declared_size;
use crate::remote::{DirectoryLister, ListedEntry, RangeFetcher};

const BLOCK_SIZE: u32 = 4096;
const TOTAL_SPACE: u64 = 1 << 50;
const TOTAL_INODES: u64 = 1_000_000_000;
const IO_SIZE: u32 = 1 << 20;
const MAX_NAME_LEN: u32 = 255;

/// Tunables for [`AccessionFs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsOptions {
    /// How long the kernel may cache attributes.
    pub stat_ttl: Duration,
    /// How long the kernel may cache name bindings, and how long a listed directory stays fresh.
    pub type_ttl: Duration,
    /// Owner reported for every inode.
    pub uid: u32,
    /// Group reported for every inode.
    pub gid: u32,
}

impl Default for FsOptions {
    fn default() -> Self {
        Self {
            stat_ttl: Duration::from_secs(60),
            type_ttl: Duration::from_secs(60),
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }
}

/// A read-only filesystem over resolved accessions.
pub struct AccessionFs<L: DirectoryLister, F: RangeFetcher> {
    table: InodeTable,
    lister: L,
    fetcher: F,
    pool: Arc<BufferPool>,
    options: FsOptions,
}

impl<L: DirectoryLister, F: RangeFetcher> AccessionFs<L, F> {
    /// Build the tree for `payload`: one directory per accession and one file per record, each
    /// file with a handle bound to an unpopulated buffer.
    ///
    /// Fails if any declared file size is not a decimal integer.
    pub fn new(
        payload: &[Accession],
        lister: L,
        fetcher: F,
        options: FsOptions,
        pool: PoolConfig,
    ) -> Result<Self, BuildError> {
        let now = SystemTime::now();
        let root = Inode::root(now);
        root.inc_ref();

        let fs = Self {
            table: InodeTable::new(root),
            lister,
            fetcher,
            pool: BufferPool::new(pool),
            options,
        };

        let root = fs.table.inode_or_die(ROOT_INODE);
        for accession in payload {
            let dir = fs.materialize_eager(
                &root,
                &ListedEntry {
                    name: OsString::from(&accession.id),
                    kind: InodeKind::Directory,
                    size: 0,
                    mtime: now,
                    etag: None,
                    storage_class: None,
                    link: None,
                },
            );

            for file in &accession.files {
                let entry = ListedEntry {
                    name: OsString::from(&file.name),
                    kind: InodeKind::File,
                    size: declared_size(accession, file)?,
                    mtime: now,
                    etag: file.md5.clone(),
                    storage_class: file.service.clone(),
                    link: Some(file.link.clone()),
                };
                let inode = fs.materialize_eager(&dir, &entry);
                let buffer = fs.pool.acquire(entry.link, entry.size);
                let handle = fs
                    .table
                    .insert_file_handle(FileHandle::new(Arc::clone(&inode), buffer));
                inode.lock().preopened = Some(handle);
            }
        }

        info!(inodes = fs.table.len(), accessions = payload.len(), "filesystem built");
        Ok(fs)
    }

    /// Create (or refresh) an inode that the filesystem itself keeps a reference on.
    fn materialize_eager(&self, parent: &Arc<Inode>, entry: &ListedEntry) -> Arc<Inode> {
        let inode = self.materialize_from_listing(parent, entry);
        if inode.refcount() == 0 {
            inode.inc_ref();
        }
        inode
    }

    /// Fixed capacity figures. Nothing is accounted.
    #[must_use]
    pub fn stat_summary(&self) -> FsStats {
        let blocks = TOTAL_SPACE / u64::from(BLOCK_SIZE);
        FsStats {
            block_size: BLOCK_SIZE,
            total_blocks: blocks,
            free_blocks: blocks,
            available_blocks: blocks,
            total_inodes: TOTAL_INODES,
            free_inodes: TOTAL_INODES,
            io_size: IO_SIZE,
            max_filename_length: MAX_NAME_LEN,
        }
    }

    /// Attributes of `addr`, valid until the returned expiry.
    pub fn get_attributes(&self, addr: InodeAddr) -> Result<AttrReply, FsError> {
        let inode = self.table.get(addr).ok_or(FsError::NotFound)?;
        Ok(AttrReply {
            stat: inode.stat(self.options.uid, self.options.gid),
            expires: SystemTime::now() + self.options.stat_ttl,
        })
    }

    /// Copy the value of xattr `name` into `dst`. Returns the bytes copied.
    pub fn get_xattr(&self, addr: InodeAddr, name: &OsStr, dst: &mut [u8]) -> Result<usize, FsError> {
        let inode = self.table.get(addr).ok_or(FsError::NotFound)?;
        let value = inode.xattr(name).ok_or(FsError::NoSuchAttribute)?;
        copy_whole(&value, dst)
    }

    /// Copy the NUL-terminated xattr names of `addr` into `dst`. Returns the bytes copied.
    pub fn list_xattr(&self, addr: InodeAddr, dst: &mut [u8]) -> Result<usize, FsError> {
        let inode = self.table.get(addr).ok_or(FsError::NotFound)?;
        let mut names = Vec::new();
        for name in inode.xattr_names() {
            names.extend_from_slice(name.as_bytes());
            names.push(0);
        }
        copy_whole(&names, dst)
    }

    /// Resolve `name` under `parent` and take a lookup reference on it.
    ///
    /// A miss changes nothing.
    #[instrument(name = "AccessionFs::lookup", skip(self))]
    pub fn lookup(&self, parent: InodeAddr, name: &OsStr) -> Result<EntryReply, FsError> {
        let parent = self.table.inode_or_die(parent);
        let child = {
            let guard = parent.lock();
            self.table.find_and_ref(&guard, name)
        }
        .ok_or(FsError::NotFound)?;

        let now = SystemTime::now();
        trace!(addr = child.addr(), refcount = child.refcount(), "lookup hit");
        Ok(EntryReply {
            stat: child.stat(self.options.uid, self.options.gid),
            attr_expires: now + self.options.stat_ttl,
            entry_expires: now + self.options.type_ttl,
        })
    }

    /// Drop `nlookup` kernel references to `addr`.
    pub fn forget(&self, addr: InodeAddr, nlookup: u64) {
        let Some(inode) = self.table.get(addr) else {
            warn!(addr, "forget for an inode that is not in the table");
            return;
        };
        self.table.forget(&inode, nlookup);
    }

    /// Open directory `addr` for listing.
    pub fn open_directory(&self, addr: InodeAddr) -> Result<HandleId, FsError> {
        let inode = self.table.inode_or_die(addr);
        if inode.kind() != InodeKind::Directory {
            return Err(FsError::NotADirectory);
        }
        Ok(self.table.insert_dir_handle(DirHandle::new(inode)))
    }

    /// Hand entries from `offset` on to `filler` until it reports full or the listing ends.
    ///
    /// `filler` returns `true` when it could not take the entry; that entry is offered again on
    /// the next call with the same offset. Entries not yet in the tree are materialized before
    /// they are handed out. A directory is marked freshly listed only when the lister reports
    /// its end.
    #[instrument(name = "AccessionFs::read_directory", skip(self, filler))]
    pub async fn read_directory(
        &self,
        handle: HandleId,
        offset: u64,
        mut filler: impl FnMut(DirEntry<'_>) -> bool,
    ) -> Result<(), FsError> {
        let dir = self.table.dir_handle_or_die(handle);
        let mut idx = usize::try_from(offset).unwrap_or(usize::MAX);

        loop {
            let Some(mut entry) = dir
                .entry_at(&self.lister, &self.table, idx, self.options.type_ttl)
                .await
                .map_err(FsError::Listing)?
            else {
                if dir.take_completed_pass() {
                    self.mark_listed(dir.inode());
                }
                return Ok(());
            };

            if let Some(listed) = &entry.listing
                && (!entry.is_realized() || self.table.get(entry.addr).is_none())
            {
                let child = self.materialize_from_listing(dir.inode(), listed);
                entry.addr = child.addr();
                entry.kind = child.kind();
                dir.realize(idx, entry.addr);
            }

            let next = idx as u64 + 1;
            let full = filler(DirEntry {
                name: &entry.name,
                addr: entry.addr,
                kind: entry.kind,
                offset: next,
            });
            if full {
                trace!(idx, "destination full");
                return Ok(());
            }
            idx += 1;
        }
    }

    /// Find-or-create the child `entry` names under `parent`.
    ///
    /// An existing child of the same kind takes the entry's metadata. Otherwise a new inode with
    /// no references is linked in, replacing any child of another kind under that name. A
    /// replaced child the kernel holds no reference to is removed from the table.
    fn materialize_from_listing(&self, parent: &Arc<Inode>, entry: &ListedEntry) -> Arc<Inode> {
        let mut guard = parent.lock();
        if let Some(addr) = guard.child(&entry.name)
            && let Some(existing) = self.table.get(addr)
        {
            if existing.kind() == entry.kind {
                existing.merge_listing(entry);
                return existing;
            }
            if existing.refcount() == 0 {
                let removed = self.table.evict(&mut guard, &existing);
                debug!(addr, removed, name = ?entry.name, "evicted child of another kind");
            }
        }

        let child = self.table.insert_child(&mut guard, &entry.name, |addr| {
            Inode::child_of(parent, addr, &entry.name, entry.kind, entry.size, entry.mtime)
        });
        child.merge_listing(entry);
        debug!(parent = parent.addr(), addr = child.addr(), name = ?entry.name, "materialized");
        child
    }

    /// Stamp `dir` as freshly listed and set its mtime to its newest child's.
    fn mark_listed(&self, dir: &Inode) {
        let children: Vec<InodeAddr> = dir.lock().children.iter().flatten().map(|(_, a)| *a).collect();
        let newest = children
            .into_iter()
            .filter_map(|addr| self.table.get(addr))
            .map(|child| child.lock().attrs.mtime)
            .max();

        let mut state = dir.lock();
        state.listed_at = Some(Instant::now());
        if let Some(mtime) = newest {
            state.attrs.mtime = mtime;
        }
        debug!(dir = dir.path(), "directory listed");
    }

    /// Close a directory handle.
    pub fn release_directory_handle(&self, handle: HandleId) {
        self.table.remove_dir_handle(handle).close();
    }

    /// Open file `addr` for reading.
    pub fn open_file(&self, addr: InodeAddr) -> Result<HandleId, FsError> {
        let inode = self.table.inode_or_die(addr);
        if inode.kind() == InodeKind::Directory {
            return Err(FsError::IsADirectory);
        }
        let (link, size) = {
            let state = inode.lock();
            (state.link.clone(), state.attrs.size)
        };
        let buffer = self.pool.acquire(link, size);
        Ok(self.table.insert_file_handle(FileHandle::new(inode, buffer)))
    }

    /// Read into `dst` from `offset` of the file open as `handle`. Returns the bytes copied.
    #[instrument(name = "AccessionFs::read_file", skip(self, dst), fields(len = dst.len()))]
    pub async fn read_file(
        &self,
        handle: HandleId,
        offset: u64,
        dst: &mut [u8],
    ) -> Result<usize, FsError> {
        let file = self.table.file_handle_or_die(handle);
        file.read(&self.fetcher, offset, dst)
            .await
            .map_err(FsError::Transport)
    }

    /// Nothing is ever written, so there is nothing to sync.
    pub fn sync_file(&self, _handle: HandleId) -> Result<(), FsError> {
        Ok(())
    }

    /// Close a file handle and return its buffer to the pool.
    pub fn release_file_handle(&self, handle: HandleId) {
        let file = self.table.remove_file_handle(handle);
        match Arc::try_unwrap(file) {
            Ok(file) => self.pool.reclaim(file.into_buffer()),
            Err(_) => debug!(handle, "file handle still in use at release"),
        }
    }

    /// Log table occupancy and drop idle buffers. Referenced inodes and buffers are untouched.
    pub fn release_memory_hint(&self) {
        let trimmed = self.pool.trim();
        info!(
            inodes = self.table.len(),
            forgotten = self.table.forgotten(),
            open_files = self.table.file_handle_count(),
            retained_bytes = self.pool.retained_bytes(),
            trimmed,
            "memory hint",
        );
    }

    /// The inode at `addr`, if it is in the table.
    #[must_use]
    pub fn inode(&self, addr: InodeAddr) -> Option<Arc<Inode>> {
        self.table.get(addr)
    }

    /// The open file handle `handle`, if any.
    #[must_use]
    pub fn file_handle(&self, handle: HandleId) -> Option<Arc<FileHandle>> {
        self.table.file_handle(handle)
    }

    /// The inode table.
    #[must_use]
    pub fn table(&self) -> &InodeTable {
        &self.table
    }

    /// The buffer pool.
    #[must_use]
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// The options this filesystem was built with.
    #[must_use]
    pub fn options(&self) -> &FsOptions {
        &self.options
    }
}

/// Copy all of `src` into `dst`, or nothing if it does not fit.
fn copy_whole(src: &[u8], dst: &mut [u8]) -> Result<usize, FsError> {
    let Some(dst) = dst.get_mut(..src.len()) else {
        return Err(FsError::RangeTooSmall {
            required: src.len(),
        });
    };
    dst.copy_from_slice(src);
    Ok(src.len())
}
