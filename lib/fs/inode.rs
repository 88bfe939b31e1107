//! Inodes and their per-node lock.
//!
//! Each [`Inode`] guards its attributes and child map with its own lock. Identity fields (address,
//! parent, name, path, kind) are fixed at creation and readable without locking; the reference
//! count is atomic but is only ever changed while the parent's lock is held, which is what
//! serializes a lookup against a concurrent forget of the same name.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime};

use parking_lot::{Mutex, MutexGuard};

use super::{HandleId, InodeAddr, InodeAttrs, InodeKind, InodeStat, ROOT_INODE};
use crate::remote::ListedEntry;

const XATTR_PREFIX: &str = "user.";
const XATTR_ETAG: &str = "etag";
const XATTR_STORAGE_CLASS: &str = "storage-class";
const XATTR_LINK: &str = "link";

/// State guarded by the inode's lock.
#[derive(Debug)]
pub struct InodeState {
    /// Size, mtime and mode.
    pub attrs: InodeAttrs,
    /// Children by name. Present only for directories.
    pub children: Option<BTreeMap<OsString, InodeAddr>>,
    /// Content tag reported by the remote.
    pub etag: Option<String>,
    /// Storage class reported by the remote.
    pub storage_class: Option<String>,
    /// Where the file's bytes live.
    pub link: Option<String>,
    /// Whether `attrs.size` came from the remote rather than a default.
    pub known_size: bool,
    /// When the attributes were last refreshed.
    pub attr_time: Instant,
    /// When a full listing pass last completed. Directories only.
    pub listed_at: Option<Instant>,
    /// Handle created for this file at construction, if any.
    pub preopened: Option<HandleId>,
}

/// A file or directory in the tree.
#[derive(Debug)]
pub struct Inode {
    addr: InodeAddr,
    parent: Option<InodeAddr>,
    name: OsString,
    path: String,
    kind: InodeKind,
    refcount: AtomicU64,
    state: Mutex<InodeState>,
}

impl Inode {
    /// Create the root directory.
    #[must_use]
    pub fn root(mtime: SystemTime) -> Self {
        Self::new(
            ROOT_INODE,
            None,
            OsString::new(),
            InodeKind::Directory,
            0,
            mtime,
        )
    }

    /// Create a child of `parent` at `addr`.
    ///
    /// The child is not linked into `parent`; that is [`InodeTable::insert_child`]'s job.
    ///
    /// [`InodeTable::insert_child`]: super::table::InodeTable::insert_child
    #[must_use]
    pub fn child_of(
        parent: &Self,
        addr: InodeAddr,
        name: &OsStr,
        kind: InodeKind,
        size: u64,
        mtime: SystemTime,
    ) -> Self {
        Self::new(
            addr,
            Some(parent),
            name.to_os_string(),
            kind,
            size,
            mtime,
        )
    }

    fn new(
        addr: InodeAddr,
        parent: Option<&Self>,
        name: OsString,
        kind: InodeKind,
        size: u64,
        mtime: SystemTime,
    ) -> Self {
        let path = match parent {
            Some(p) if !p.path.is_empty() => format!("{}/{}", p.path, name.to_string_lossy()),
            Some(_) => name.to_string_lossy().into_owned(),
            None => String::new(),
        };
        let is_dir = kind == InodeKind::Directory;
        Self {
            addr,
            parent: parent.map(|p| p.addr),
            name,
            path,
            kind,
            refcount: AtomicU64::new(0),
            state: Mutex::new(InodeState {
                attrs: InodeAttrs {
                    size: if is_dir { 0 } else { size },
                    mtime,
                    perms: kind.perms(),
                },
                children: is_dir.then(BTreeMap::new),
                etag: None,
                storage_class: None,
                link: None,
                known_size: false,
                attr_time: Instant::now(),
                listed_at: None,
                preopened: None,
            }),
        }
    }

    /// This inode's address.
    #[must_use]
    pub fn addr(&self) -> InodeAddr {
        self.addr
    }

    /// The parent's address. `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<InodeAddr> {
        self.parent
    }

    /// Name within the parent directory. Empty for the root.
    #[must_use]
    pub fn name(&self) -> &OsStr {
        &self.name
    }

    /// Slash-separated path from the root. Empty for the root.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// File or directory.
    #[must_use]
    pub fn kind(&self) -> InodeKind {
        self.kind
    }

    /// Current lookup count.
    #[must_use]
    pub fn refcount(&self) -> u64 {
        self.refcount.load(Ordering::Acquire)
    }

    pub(super) fn inc_ref(&self) -> u64 {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop `n` references, saturating at zero. Returns the remaining count.
    pub(super) fn dec_ref(&self, n: u64) -> u64 {
        let prev = self
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                Some(c.saturating_sub(n))
            })
            .unwrap_or_else(|c| c);
        prev.saturating_sub(n)
    }

    /// Take this inode's lock.
    pub fn lock(&self) -> LockedInode<'_> {
        LockedInode {
            inode: self,
            guard: self.state.lock(),
        }
    }

    /// Snapshot the attributes under the inode's lock.
    #[must_use]
    pub fn stat(&self, uid: u32, gid: u32) -> InodeStat {
        let attrs = self.state.lock().attrs;
        InodeStat {
            addr: self.addr,
            kind: self.kind,
            attrs,
            uid,
            gid,
        }
    }

    /// Overwrite metadata from a listing entry.
    ///
    /// The listing is authoritative: content tag and storage class are replaced even when the
    /// entry carries none, and size and mtime are taken as-is.
    pub fn merge_listing(&self, entry: &ListedEntry) {
        let mut state = self.state.lock();
        state.etag.clone_from(&entry.etag);
        state.storage_class.clone_from(&entry.storage_class);
        if entry.link.is_some() {
            state.link.clone_from(&entry.link);
        }
        if self.kind == InodeKind::File {
            state.attrs.size = entry.size;
            state.known_size = true;
        }
        state.attrs.mtime = entry.mtime;
        state.attr_time = Instant::now();
    }

    /// Value of the extended attribute `name`, if present.
    #[must_use]
    pub fn xattr(&self, name: &OsStr) -> Option<Vec<u8>> {
        let key = name.to_str()?.strip_prefix(XATTR_PREFIX)?;
        let state = self.state.lock();
        let value = match key {
            XATTR_ETAG => state.etag.as_deref(),
            XATTR_STORAGE_CLASS => state.storage_class.as_deref(),
            XATTR_LINK => state.link.as_deref(),
            _ => None,
        }?;
        Some(value.as_bytes().to_vec())
    }

    /// Names of the extended attributes present, sorted.
    #[must_use]
    pub fn xattr_names(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut names: Vec<String> = [
            (XATTR_ETAG, state.etag.is_some()),
            (XATTR_LINK, state.link.is_some()),
            (XATTR_STORAGE_CLASS, state.storage_class.is_some()),
        ]
        .into_iter()
        .filter(|(_, present)| *present)
        .map(|(key, _)| format!("{XATTR_PREFIX}{key}"))
        .collect();
        names.sort_unstable();
        names
    }
}

/// An inode together with its held lock.
///
/// Holding one of these is the proof that the inode's lock is taken, which is what
/// [`InodeTable`](super::table::InodeTable) demands before it takes its own lock.
pub struct LockedInode<'a> {
    inode: &'a Inode,
    guard: MutexGuard<'a, InodeState>,
}

impl<'a> LockedInode<'a> {
    /// The locked inode.
    #[must_use]
    pub fn inode(&self) -> &'a Inode {
        self.inode
    }

    /// Address of the child called `name`.
    #[must_use]
    pub fn child(&self, name: &OsStr) -> Option<InodeAddr> {
        self.guard.children.as_ref()?.get(name).copied()
    }
}

impl Deref for LockedInode<'_> {
    type Target = InodeState;

    fn deref(&self) -> &InodeState {
        &self.guard
    }
}

impl DerefMut for LockedInode<'_> {
    fn deref_mut(&mut self) -> &mut InodeState {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(etag: Option<&str>, size: u64) -> ListedEntry {
        ListedEntry {
            name: "f".into(),
            kind: InodeKind::File,
            size,
            mtime: SystemTime::UNIX_EPOCH,
            etag: etag.map(str::to_owned),
            storage_class: Some("STANDARD".to_owned()),
            link: None,
        }
    }

    #[test]
    fn paths_join_from_root() {
        let root = Inode::root(SystemTime::UNIX_EPOCH);
        let dir = Inode::child_of(&root, 2, OsStr::new("SRR1"), InodeKind::Directory, 0, SystemTime::UNIX_EPOCH);
        let file = Inode::child_of(&dir, 3, OsStr::new("a.bam"), InodeKind::File, 9, SystemTime::UNIX_EPOCH);
        assert_eq!(root.path(), "");
        assert_eq!(dir.path(), "SRR1");
        assert_eq!(file.path(), "SRR1/a.bam");
        assert_eq!(file.parent(), Some(2));
        assert!(dir.lock().children.is_some());
        assert!(file.lock().children.is_none());
    }

    #[test]
    fn dec_ref_saturates() {
        let root = Inode::root(SystemTime::UNIX_EPOCH);
        root.inc_ref();
        assert_eq!(root.dec_ref(5), 0);
        assert_eq!(root.refcount(), 0);
    }

    #[test]
    fn merge_overwrites_remote_metadata() {
        let root = Inode::root(SystemTime::UNIX_EPOCH);
        let file = Inode::child_of(&root, 2, OsStr::new("f"), InodeKind::File, 1, SystemTime::UNIX_EPOCH);

        file.merge_listing(&entry(Some("abc"), 42));
        file.merge_listing(&entry(None, 43));

        let state = file.lock();
        assert_eq!(state.etag, None);
        assert_eq!(state.storage_class.as_deref(), Some("STANDARD"));
        assert_eq!(state.attrs.size, 43);
        assert!(state.known_size);
    }

    #[test]
    fn xattrs_are_namespaced() {
        let root = Inode::root(SystemTime::UNIX_EPOCH);
        let file = Inode::child_of(&root, 2, OsStr::new("f"), InodeKind::File, 1, SystemTime::UNIX_EPOCH);
        file.merge_listing(&entry(Some("abc"), 1));

        assert_eq!(file.xattr(OsStr::new("user.etag")), Some(b"abc".to_vec()));
        assert_eq!(file.xattr(OsStr::new("etag")), None);
        assert_eq!(file.xattr(OsStr::new("user.nope")), None);
        assert_eq!(file.xattr_names(), ["user.etag", "user.storage-class"]);
    }
}
