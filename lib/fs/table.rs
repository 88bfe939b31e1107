//! The inode and handle tables.
//!
//! One lock guards the address map, both handle maps and their allocators. The only routines that
//! hold an inode lock and the table lock together live here, and they accept the inode lock as a
//! [`LockedInode`] so the inode-then-table order cannot be inverted by a caller.

use std::ffi::OsStr;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use super::dir_handle::DirHandle;
use super::file_handle::FileHandle;
use super::inode::{Inode, LockedInode};
use super::{HandleId, InodeAddr, ROOT_INODE};

struct TableState {
    next_inode: InodeAddr,
    inodes: FxHashMap<InodeAddr, Arc<Inode>>,
    next_dir_handle: HandleId,
    dir_handles: FxHashMap<HandleId, Arc<DirHandle>>,
    next_file_handle: HandleId,
    file_handles: FxHashMap<HandleId, Arc<FileHandle>>,
    forgotten: u64,
}

/// Address-to-inode map plus the open directory and file handles.
pub struct InodeTable {
    state: Mutex<TableState>,
}

impl InodeTable {
    /// Create a table holding only `root`.
    #[must_use]
    pub fn new(root: Inode) -> Self {
        debug_assert_eq!(root.addr(), ROOT_INODE);
        let mut inodes = FxHashMap::default();
        inodes.insert(ROOT_INODE, Arc::new(root));
        Self {
            state: Mutex::new(TableState {
                next_inode: ROOT_INODE + 1,
                inodes,
                next_dir_handle: 1,
                dir_handles: FxHashMap::default(),
                next_file_handle: 1,
                file_handles: FxHashMap::default(),
                forgotten: 0,
            }),
        }
    }

    /// Look up an inode by address.
    #[must_use]
    pub fn get(&self, addr: InodeAddr) -> Option<Arc<Inode>> {
        self.state.lock().inodes.get(&addr).cloned()
    }

    /// Look up an inode the kernel says exists.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not in the table; the kernel only hands out addresses we gave it.
    #[must_use]
    pub fn inode_or_die(&self, addr: InodeAddr) -> Arc<Inode> {
        match self.get(addr) {
            Some(inode) => inode,
            None => panic!("inode {addr} is not in the table"),
        }
    }

    /// Allocate an address, build the child with it and link it under `parent`.
    ///
    /// Any existing mapping for `name` in `parent` is replaced.
    pub fn insert_child(
        &self,
        parent: &mut LockedInode<'_>,
        name: &OsStr,
        build: impl FnOnce(InodeAddr) -> Inode,
    ) -> Arc<Inode> {
        let mut table = self.state.lock();
        let addr = table.next_inode;
        table.next_inode += 1;

        let child = Arc::new(build(addr));
        table.inodes.insert(addr, Arc::clone(&child));
        if let Some(children) = parent.children.as_mut() {
            children.insert(name.to_os_string(), addr);
        }
        trace!(parent = parent.inode().addr(), addr, ?name, "inserted inode");
        child
    }

    /// Resolve `name` under `parent` and take a lookup reference on it.
    pub fn find_and_ref(&self, parent: &LockedInode<'_>, name: &OsStr) -> Option<Arc<Inode>> {
        let addr = parent.child(name)?;
        let table = self.state.lock();
        let child = table.inodes.get(&addr)?;
        child.inc_ref();
        Some(Arc::clone(child))
    }

    /// Drop `nlookup` references from `inode`, removing it once none remain.
    ///
    /// Removing a directory also removes every descendant the kernel holds no reference to,
    /// since nothing can reach those by name any more. The parent's lock is taken before the
    /// table lock. The root is never removed. Returns whether the inode was removed.
    pub fn forget(&self, inode: &Inode, nlookup: u64) -> bool {
        let Some(parent_addr) = inode.parent() else {
            inode.dec_ref(nlookup);
            return false;
        };

        let Some(parent) = self.get(parent_addr) else {
            // The parent went first; nobody can look this inode up by name any more.
            if inode.dec_ref(nlookup) > 0 {
                return false;
            }
            let mut doomed = vec![inode.addr()];
            self.collect_unreferenced(inode, &mut doomed);
            return self.remove_all(&doomed) > 0;
        };

        let mut parent = parent.lock();
        if inode.dec_ref(nlookup) > 0 {
            return false;
        }
        self.evict(&mut parent, inode) > 0
    }

    /// Unlink the unreferenced `child` from `parent` and remove it from the table together with
    /// its unreferenced descendants. Returns how many inodes were removed.
    ///
    /// `child` must have no references. Its descendants that still have some stay in the table
    /// until they are forgotten themselves.
    pub fn evict(&self, parent: &mut LockedInode<'_>, child: &Inode) -> usize {
        debug_assert_eq!(child.refcount(), 0);
        let mut doomed = vec![child.addr()];
        self.collect_unreferenced(child, &mut doomed);

        if let Some(children) = parent.children.as_mut()
            && children.get(child.name()) == Some(&child.addr())
        {
            children.remove(child.name());
            // The child set no longer matches the last listing.
            parent.listed_at = None;
        }
        self.remove_all(&doomed)
    }

    /// Detach the unreferenced children of `dir`, recursively, appending their addresses to
    /// `out`.
    ///
    /// Takes each directory's lock before the table lock, descending from parent to child.
    fn collect_unreferenced(&self, dir: &Inode, out: &mut Vec<InodeAddr>) {
        let mut detached = Vec::new();
        {
            let mut guard = dir.lock();
            let Some(children) = guard.children.as_mut() else {
                return;
            };
            children.retain(|_, addr| match self.get(*addr) {
                Some(child) if child.refcount() == 0 => {
                    detached.push(child);
                    false
                }
                Some(_) => true,
                None => false,
            });
        }

        for child in detached {
            out.push(child.addr());
            self.collect_unreferenced(&child, out);
        }
    }

    fn remove_all(&self, addrs: &[InodeAddr]) -> usize {
        let mut table = self.state.lock();
        let mut removed = 0;
        for addr in addrs {
            if table.inodes.remove(addr).is_some() {
                table.forgotten += 1;
                removed += 1;
            }
        }
        debug!(root = addrs.first(), removed, "forgot inodes");
        removed
    }

    /// Register a directory handle.
    pub fn insert_dir_handle(&self, handle: DirHandle) -> HandleId {
        let mut table = self.state.lock();
        let id = table.next_dir_handle;
        table.next_dir_handle += 1;
        table.dir_handles.insert(id, Arc::new(handle));
        id
    }

    /// Look up a directory handle the kernel says is open.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not open.
    #[must_use]
    pub fn dir_handle_or_die(&self, id: HandleId) -> Arc<DirHandle> {
        match self.state.lock().dir_handles.get(&id) {
            Some(handle) => Arc::clone(handle),
            None => panic!("directory handle {id} is not open"),
        }
    }

    /// Unregister a directory handle.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not open.
    pub fn remove_dir_handle(&self, id: HandleId) -> Arc<DirHandle> {
        match self.state.lock().dir_handles.remove(&id) {
            Some(handle) => handle,
            None => panic!("directory handle {id} is not open"),
        }
    }

    /// Register a file handle.
    pub fn insert_file_handle(&self, handle: FileHandle) -> HandleId {
        let mut table = self.state.lock();
        let id = table.next_file_handle;
        table.next_file_handle += 1;
        table.file_handles.insert(id, Arc::new(handle));
        id
    }

    /// Look up a file handle.
    #[must_use]
    pub fn file_handle(&self, id: HandleId) -> Option<Arc<FileHandle>> {
        self.state.lock().file_handles.get(&id).cloned()
    }

    /// Look up a file handle the kernel says is open.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not open.
    #[must_use]
    pub fn file_handle_or_die(&self, id: HandleId) -> Arc<FileHandle> {
        match self.file_handle(id) {
            Some(handle) => handle,
            None => panic!("file handle {id} is not open"),
        }
    }

    /// Unregister a file handle.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not open.
    pub fn remove_file_handle(&self, id: HandleId) -> Arc<FileHandle> {
        match self.state.lock().file_handles.remove(&id) {
            Some(handle) => handle,
            None => panic!("file handle {id} is not open"),
        }
    }

    /// Number of live inodes, root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().inodes.len()
    }

    /// Whether the table is empty. It never is while the root lives.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().inodes.is_empty()
    }

    /// Number of open file handles.
    #[must_use]
    pub fn file_handle_count(&self) -> usize {
        self.state.lock().file_handles.len()
    }

    /// Number of inodes removed through [`forget`](Self::forget) or [`evict`](Self::evict) so
    /// far.
    #[must_use]
    pub fn forgotten(&self) -> u64 {
        self.state.lock().forgotten
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::fs::InodeKind;

    fn table_with_file() -> (InodeTable, Arc<Inode>) {
        let table = InodeTable::new(Inode::root(SystemTime::UNIX_EPOCH));
        let root = table.inode_or_die(ROOT_INODE);
        let child = table.insert_child(&mut root.lock(), OsStr::new("f"), |addr| {
            Inode::child_of(&root, addr, OsStr::new("f"), InodeKind::File, 3, SystemTime::UNIX_EPOCH)
        });
        (table, child)
    }

    #[test]
    fn addresses_start_after_root() {
        let (table, child) = table_with_file();
        assert_eq!(child.addr(), ROOT_INODE + 1);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn forget_removes_at_zero() {
        let (table, child) = table_with_file();
        let root = table.inode_or_die(ROOT_INODE);
        table.find_and_ref(&root.lock(), OsStr::new("f"));
        table.find_and_ref(&root.lock(), OsStr::new("f"));
        root.lock().listed_at = Some(std::time::Instant::now());

        assert!(!table.forget(&child, 1));
        assert!(table.get(child.addr()).is_some());
        assert!(table.forget(&child, 1));
        assert!(table.get(child.addr()).is_none());
        assert_eq!(root.lock().child(OsStr::new("f")), None);
        assert!(root.lock().listed_at.is_none());
        assert_eq!(table.forgotten(), 1);
    }

    #[test]
    fn forgotten_directory_takes_unreferenced_descendants_along() {
        let table = InodeTable::new(Inode::root(SystemTime::UNIX_EPOCH));
        let root = table.inode_or_die(ROOT_INODE);
        let dir = table.insert_child(&mut root.lock(), OsStr::new("d"), |addr| {
            Inode::child_of(&root, addr, OsStr::new("d"), InodeKind::Directory, 0, SystemTime::UNIX_EPOCH)
        });
        let mut children = Vec::new();
        for name in ["kept", "dropped"] {
            children.push(table.insert_child(&mut dir.lock(), OsStr::new(name), |addr| {
                Inode::child_of(&dir, addr, OsStr::new(name), InodeKind::File, 1, SystemTime::UNIX_EPOCH)
            }));
        }
        table.find_and_ref(&root.lock(), OsStr::new("d"));
        let kept = table.find_and_ref(&dir.lock(), OsStr::new("kept")).unwrap();
        assert_eq!(table.len(), 4);

        assert!(table.forget(&dir, 1));
        assert_eq!(table.len(), 2);
        assert!(table.get(dir.addr()).is_none());
        assert!(table.get(children[1].addr()).is_none());
        assert!(table.get(kept.addr()).is_some());
        assert_eq!(table.forgotten(), 2);

        // With its parent gone the surviving child goes as soon as it is forgotten.
        assert!(table.forget(&kept, 1));
        assert_eq!(table.len(), 1);
        assert_eq!(table.forgotten(), 3);
    }

    #[test]
    fn evict_leaves_a_remapped_name_alone() {
        let (table, old) = table_with_file();
        let root = table.inode_or_die(ROOT_INODE);
        let new = table.insert_child(&mut root.lock(), OsStr::new("f"), |addr| {
            Inode::child_of(&root, addr, OsStr::new("f"), InodeKind::Directory, 0, SystemTime::UNIX_EPOCH)
        });

        assert_eq!(table.evict(&mut root.lock(), &old), 1);
        assert_eq!(root.lock().child(OsStr::new("f")), Some(new.addr()));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn root_is_never_removed() {
        let (table, _) = table_with_file();
        let root = table.inode_or_die(ROOT_INODE);
        assert!(!table.forget(&root, 10));
        assert!(table.get(ROOT_INODE).is_some());
    }

    #[test]
    fn handle_counters_are_independent() {
        let (table, child) = table_with_file();
        let buffer = crate::cache::BufferPool::new(crate::cache::PoolConfig::default()).acquire(None, 3);
        assert_eq!(table.insert_file_handle(FileHandle::new(Arc::clone(&child), buffer)), 1);
        let root = table.inode_or_die(ROOT_INODE);
        assert_eq!(table.insert_dir_handle(DirHandle::new(root)), 1);
    }

    #[test]
    #[should_panic(expected = "is not open")]
    fn unknown_handle_is_fatal() {
        let (table, _) = table_with_file();
        let _ = table.dir_handle_or_die(7);
    }
}
