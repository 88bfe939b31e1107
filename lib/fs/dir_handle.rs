//! Open-directory handles and their lazy listing cursor.
//!
//! A handle's entry sequence is built on demand: when a reader asks for an offset past what has
//! been cached, the next page is pulled from the [`DirectoryLister`]. Listing runs with no lock
//! held. One reader fetches at a time per handle; others wait on a [`Notify`] and re-check.
//!
//! Once the lister signals the end, children that already exist in the tree but were not in the
//! listing are appended, in name order, so nothing the kernel may have looked up disappears from
//! the listing. A directory listed within the type TTL is served straight from its children.

use std::collections::HashSet;
use std::ffi::OsString;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

use super::inode::Inode;
use super::table::InodeTable;
use super::{InodeAddr, InodeKind};
use crate::remote::{DirectoryLister, FetchError, ListedEntry};

/// Marker address for an entry that has not been materialized as an inode yet.
pub const UNREALIZED: InodeAddr = 0;

/// One entry of a directory handle's listing.
#[derive(Debug, Clone)]
pub struct DirHandleEntry {
    /// Entry name.
    pub name: OsString,
    /// File or directory.
    pub kind: InodeKind,
    /// Inode address, or [`UNREALIZED`].
    pub addr: InodeAddr,
    /// The listing record this entry came from, if it came from the remote.
    pub listing: Option<ListedEntry>,
}

impl DirHandleEntry {
    /// Whether this entry has an inode.
    #[must_use]
    pub fn is_realized(&self) -> bool {
        self.addr != UNREALIZED
    }
}

#[derive(Debug, Default)]
enum Mode {
    #[default]
    Unstarted,
    Streaming {
        continuation: Option<String>,
        seen: HashSet<OsString>,
    },
    Exhausted,
}

#[derive(Debug, Default)]
struct Cursor {
    entries: Vec<DirHandleEntry>,
    mode: Mode,
    fetching: bool,
    listed_remotely: bool,
}

enum Step {
    Wait,
    Start,
    Page(Option<String>),
}

/// An open directory.
#[derive(Debug)]
pub struct DirHandle {
    inode: Arc<Inode>,
    cursor: Mutex<Cursor>,
    filled: Notify,
}

impl DirHandle {
    /// Open `inode`, which must be a directory.
    #[must_use]
    pub fn new(inode: Arc<Inode>) -> Self {
        debug_assert_eq!(inode.kind(), InodeKind::Directory);
        Self {
            inode,
            cursor: Mutex::new(Cursor::default()),
            filled: Notify::new(),
        }
    }

    /// The directory this handle lists.
    #[must_use]
    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// The entry at `offset`, or `None` once the listing is exhausted.
    pub async fn entry_at<L: DirectoryLister>(
        &self,
        lister: &L,
        table: &InodeTable,
        offset: usize,
        type_ttl: Duration,
    ) -> Result<Option<DirHandleEntry>, FetchError> {
        loop {
            let mut notified = pin!(self.filled.notified());
            notified.as_mut().enable();

            let step = {
                let mut guard = self.cursor.lock();
                let cursor = &mut *guard;
                if let Some(entry) = cursor.entries.get(offset) {
                    return Ok(Some(entry.clone()));
                }
                match &cursor.mode {
                    Mode::Exhausted => return Ok(None),
                    Mode::Unstarted | Mode::Streaming { .. } if cursor.fetching => Step::Wait,
                    Mode::Unstarted => Step::Start,
                    Mode::Streaming { continuation, .. } => {
                        cursor.fetching = true;
                        Step::Page(continuation.clone())
                    }
                }
            };

            match step {
                Step::Wait => notified.await,
                Step::Start => self.start(table, type_ttl),
                Step::Page(continuation) => {
                    let _guard = FetchGuard { handle: self };
                    self.fetch_page(lister, table, continuation).await?;
                }
            }
        }
    }

    /// Decide whether this pass is served from the tree or from the lister.
    fn start(&self, table: &InodeTable, type_ttl: Duration) {
        let fresh = self
            .inode
            .lock()
            .listed_at
            .is_some_and(|at| at.elapsed() < type_ttl);
        let snapshot = fresh.then(|| self.materialized_children(table, &HashSet::new()));

        let mut cursor = self.cursor.lock();
        if !matches!(cursor.mode, Mode::Unstarted) {
            return;
        }
        match snapshot {
            Some(entries) => {
                trace!(dir = self.inode.path(), n = entries.len(), "listing is fresh");
                cursor.entries = entries;
                cursor.mode = Mode::Exhausted;
            }
            None => {
                cursor.mode = Mode::Streaming {
                    continuation: None,
                    seen: HashSet::new(),
                };
            }
        }
    }

    async fn fetch_page<L: DirectoryLister>(
        &self,
        lister: &L,
        table: &InodeTable,
        continuation: Option<String>,
    ) -> Result<(), FetchError> {
        let page = lister
            .list(self.inode.path(), continuation.as_deref())
            .await?;
        let at_end = page.is_end() || page.continuation.is_none();
        trace!(dir = self.inode.path(), n = page.entries.len(), at_end, "listed page");

        let tail = {
            let mut cursor = self.cursor.lock();
            let Cursor { entries, mode, .. } = &mut *cursor;
            let Mode::Streaming {
                continuation: next,
                seen,
            } = mode
            else {
                return Ok(());
            };
            for listed in page.entries {
                if seen.insert(listed.name.clone()) {
                    entries.push(DirHandleEntry {
                        name: listed.name.clone(),
                        kind: listed.kind,
                        addr: UNREALIZED,
                        listing: Some(listed),
                    });
                }
            }
            next.clone_from(&page.continuation);
            at_end.then(|| seen.clone())
        };

        if let Some(seen) = tail {
            let extra = self.materialized_children(table, &seen);
            let mut cursor = self.cursor.lock();
            debug!(dir = self.inode.path(), extra = extra.len(), "listing complete");
            cursor.entries.extend(extra);
            cursor.mode = Mode::Exhausted;
            cursor.listed_remotely = true;
        }
        Ok(())
    }

    /// Existing children not named in `skip`, in name order.
    fn materialized_children(
        &self,
        table: &InodeTable,
        skip: &HashSet<OsString>,
    ) -> Vec<DirHandleEntry> {
        let children: Vec<(OsString, InodeAddr)> = self
            .inode
            .lock()
            .children
            .iter()
            .flatten()
            .filter(|(name, _)| !skip.contains(*name))
            .map(|(name, addr)| (name.clone(), *addr))
            .collect();

        children
            .into_iter()
            .filter_map(|(name, addr)| {
                // Not re-checked when served: a child forgotten later is still reported under
                // this address, which the kernel treats as advisory in readdir.
                let child = table.get(addr)?;
                Some(DirHandleEntry {
                    name,
                    kind: child.kind(),
                    addr,
                    listing: None,
                })
            })
            .collect()
    }

    /// Record that the entry at `offset` now has inode `addr`.
    pub fn realize(&self, offset: usize, addr: InodeAddr) {
        if let Some(entry) = self.cursor.lock().entries.get_mut(offset) {
            entry.addr = addr;
        }
    }

    /// Whether a full remote listing pass completed since the last call.
    pub fn take_completed_pass(&self) -> bool {
        std::mem::take(&mut self.cursor.lock().listed_remotely)
    }

    /// Drop the cached listing.
    pub fn close(&self) {
        *self.cursor.lock() = Cursor::default();
    }
}

/// Clears the fetching flag and wakes waiters when a page fetch ends, including by cancellation.
struct FetchGuard<'a> {
    handle: &'a DirHandle,
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        self.handle.cursor.lock().fetching = false;
        self.handle.filled.notify_waiters();
    }
}
