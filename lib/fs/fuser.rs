//! FUSE adapter: maps [`fuser::Filesystem`] callbacks to [`AccessionFs`].

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, instrument};

use super::controller::AccessionFs;
use super::{FsError, InodeKind, InodeStat};
use crate::remote::{DirectoryLister, RangeFetcher};

/// Trait abstracting the `.error(errno)` method common to all fuser reply types.
trait FuseReply {
    fn error(self, errno: i32);
}

macro_rules! impl_fuse_reply {
    ($($ty:ty),* $(,)?) => {
        $(impl FuseReply for $ty {
            fn error(self, errno: i32) {
                // Calls the inherent fuser method (not this trait method).
                self.error(errno);
            }
        })*
    };
}

impl_fuse_reply!(
    fuser::ReplyEntry,
    fuser::ReplyAttr,
    fuser::ReplyOpen,
    fuser::ReplyData,
    fuser::ReplyXattr,
    fuser::ReplyEmpty,
);

/// Extension trait on `Result<T, FsError>` for FUSE reply handling.
///
/// Centralizes the error-logging + errno-reply path so each FUSE callback
/// only has to express its success path.
trait FuseResultExt<T> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R));
}

impl<T> FuseResultExt<T> for Result<T, FsError> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R)) {
        match self {
            Ok(val) => on_ok(val, reply),
            Err(e) => {
                debug!(error = %e, "replying error");
                reply.error(e.errno());
            }
        }
    }
}

const BLOCK_SIZE: u32 = 4096;

fn to_fuser_attr(stat: &InodeStat) -> fuser::FileAttr {
    let attrs = &stat.attrs;
    fuser::FileAttr {
        ino: stat.addr,
        size: attrs.size,
        blocks: attrs.size.div_ceil(512),
        atime: attrs.mtime,
        mtime: attrs.mtime,
        ctime: attrs.mtime,
        crtime: attrs.mtime,
        kind: to_fuser_type(stat.kind),
        perm: attrs.perms.bits(),
        nlink: match stat.kind {
            InodeKind::File => 1,
            InodeKind::Directory => 2,
        },
        uid: stat.uid,
        gid: stat.gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

fn to_fuser_type(kind: InodeKind) -> fuser::FileType {
    match kind {
        InodeKind::Directory => fuser::FileType::Directory,
        InodeKind::File => fuser::FileType::RegularFile,
    }
}

/// Time left until `expires`, saturating at zero.
fn ttl(expires: SystemTime) -> Duration {
    expires
        .duration_since(SystemTime::now())
        .unwrap_or(Duration::ZERO)
}

/// Bridges an [`AccessionFs`] to the [`fuser::Filesystem`] trait.
///
/// Async controller calls are driven to completion on the given tokio runtime.
pub struct FuserAdapter<L: DirectoryLister, F: RangeFetcher> {
    fs: Arc<AccessionFs<L, F>>,
    runtime: tokio::runtime::Handle,
}

impl<L: DirectoryLister, F: RangeFetcher> FuserAdapter<L, F> {
    /// Create a new adapter over `fs`.
    pub fn new(fs: Arc<AccessionFs<L, F>>, runtime: tokio::runtime::Handle) -> Self {
        Self { fs, runtime }
    }

    /// Reply to an xattr request: a zero `size` asks only for the required size.
    fn reply_xattr(
        size: u32,
        reply: fuser::ReplyXattr,
        fill: impl FnOnce(&mut [u8]) -> Result<usize, FsError>,
    ) {
        if size == 0 {
            match fill(&mut []) {
                Ok(n) | Err(FsError::RangeTooSmall { required: n }) => {
                    reply.size(u32::try_from(n).unwrap_or(u32::MAX));
                }
                Err(e) => {
                    debug!(error = %e, "replying error");
                    reply.error(e.errno());
                }
            }
            return;
        }

        let mut buf = vec![0u8; size as usize];
        fill(&mut buf).fuse_reply(reply, |n, reply| reply.data(&buf[..n]));
    }
}

impl<L: DirectoryLister, F: RangeFetcher> fuser::Filesystem for FuserAdapter<L, F> {
    #[instrument(name = "FuserAdapter::lookup", skip(self, _req, reply))]
    fn lookup(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        self.fs.lookup(parent, name).fuse_reply(reply, |entry, reply| {
            let attr = to_fuser_attr(&entry.stat);
            let ttl = ttl(entry.attr_expires.min(entry.entry_expires));
            debug!(?attr, "replying...");
            reply.entry(&ttl, &attr, 0);
        });
    }

    #[instrument(name = "FuserAdapter::forget", skip(self, _req))]
    fn forget(&mut self, _req: &fuser::Request<'_>, ino: u64, nlookup: u64) {
        self.fs.forget(ino, nlookup);
    }

    #[instrument(name = "FuserAdapter::getattr", skip(self, _req, _fh, reply))]
    fn getattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        self.fs.get_attributes(ino).fuse_reply(reply, |attr, reply| {
            reply.attr(&ttl(attr.expires), &to_fuser_attr(&attr.stat));
        });
    }

    #[instrument(name = "FuserAdapter::getxattr", skip(self, _req, reply))]
    fn getxattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: fuser::ReplyXattr,
    ) {
        Self::reply_xattr(size, reply, |dst| self.fs.get_xattr(ino, name, dst));
    }

    #[instrument(name = "FuserAdapter::listxattr", skip(self, _req, reply))]
    fn listxattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        size: u32,
        reply: fuser::ReplyXattr,
    ) {
        Self::reply_xattr(size, reply, |dst| self.fs.list_xattr(ino, dst));
    }

    #[instrument(name = "FuserAdapter::opendir", skip(self, _req, _flags, reply))]
    fn opendir(&mut self, _req: &fuser::Request<'_>, ino: u64, _flags: i32, reply: fuser::ReplyOpen) {
        self.fs.open_directory(ino).fuse_reply(reply, |fh, reply| {
            debug!(handle = fh, "replying...");
            reply.opened(fh, 0);
        });
    }

    #[instrument(name = "FuserAdapter::readdir", skip(self, _req, _ino, reply))]
    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        let result = self.runtime.block_on(self.fs.read_directory(
            fh,
            offset.cast_unsigned(),
            |entry| {
                let full = reply.add(
                    entry.addr,
                    entry.offset.cast_signed(),
                    to_fuser_type(entry.kind),
                    entry.name,
                );
                if full {
                    debug!("buffer full for now, stopping readdir");
                }
                full
            },
        ));

        match result {
            Ok(()) => reply.ok(),
            Err(e) => {
                debug!(error = %e, "replying error");
                reply.error(e.errno());
            }
        }
    }

    #[instrument(name = "FuserAdapter::releasedir", skip(self, _req, _ino, _flags, reply))]
    fn releasedir(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: fuser::ReplyEmpty,
    ) {
        self.fs.release_directory_handle(fh);
        reply.ok();
    }

    #[instrument(name = "FuserAdapter::open", skip(self, _req, _flags, reply))]
    fn open(&mut self, _req: &fuser::Request<'_>, ino: u64, _flags: i32, reply: fuser::ReplyOpen) {
        self.fs.open_file(ino).fuse_reply(reply, |fh, reply| {
            debug!(handle = fh, "replying...");
            reply.opened(fh, fuser::consts::FOPEN_KEEP_CACHE);
        });
    }

    #[instrument(
        name = "FuserAdapter::read",
        skip(self, _req, _ino, _flags, _lock_owner, reply)
    )]
    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        let mut buf = vec![0u8; size as usize];
        self.runtime
            .block_on(self.fs.read_file(fh, offset.cast_unsigned(), &mut buf))
            .fuse_reply(reply, |n, reply| {
                debug!(read_bytes = n, "replying...");
                reply.data(&buf[..n]);
            });
    }

    #[instrument(name = "FuserAdapter::fsync", skip(self, _req, _ino, _datasync, reply))]
    fn fsync(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _datasync: bool,
        reply: fuser::ReplyEmpty,
    ) {
        self.fs.sync_file(fh).fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(
        name = "FuserAdapter::release",
        skip(self, _req, _ino, _flags, _lock_owner, _flush, reply)
    )]
    fn release(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        self.fs.release_file_handle(fh);
        reply.ok();
    }

    #[instrument(name = "FuserAdapter::statfs", skip(self, _req, _ino, reply))]
    fn statfs(&mut self, _req: &fuser::Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        let stats = self.fs.stat_summary();
        debug!(?stats, "replying...");
        reply.statfs(
            stats.total_blocks,
            stats.free_blocks,
            stats.available_blocks,
            stats.total_inodes,
            stats.free_inodes,
            stats.io_size,
            stats.max_filename_length,
            stats.block_size,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{InodeAttrs, InodePerms};

    #[test]
    fn directories_report_two_links() {
        let stat = InodeStat {
            addr: 7,
            kind: InodeKind::Directory,
            attrs: InodeAttrs {
                size: 0,
                mtime: SystemTime::UNIX_EPOCH,
                perms: InodePerms::DIRECTORY,
            },
            uid: 1,
            gid: 2,
        };
        let attr = to_fuser_attr(&stat);
        assert_eq!(attr.nlink, 2);
        assert_eq!(attr.perm, 0o555);
        assert_eq!(attr.kind, fuser::FileType::Directory);
    }

    #[test]
    fn past_expiry_is_zero_ttl() {
        assert_eq!(ttl(SystemTime::UNIX_EPOCH), Duration::ZERO);
    }
}
