//! The inode tree, its handles and the kernel-facing controller.

pub mod controller;
pub mod dir_handle;
pub mod error;
pub mod file_handle;
/// FUSE adapter: maps [`fuser::Filesystem`] callbacks to [`AccessionFs`].
pub mod fuser;
pub mod inode;
pub mod table;

pub use controller::{AccessionFs, FsOptions};
pub use error::{BuildError, FsError};

use std::ffi::OsStr;
use std::time::SystemTime;

use bitflags::bitflags;

/// Type representing an inode identifier.
pub type InodeAddr = u64;

/// The address reserved for the root directory.
pub const ROOT_INODE: InodeAddr = 1;

/// Type representing a directory or file handle.
pub type HandleId = u64;

bitflags! {
    /// Permission bits for an inode, similar to Unix file permissions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InodePerms: u16 {
        /// Other: execute permission.
        const OTHER_EXECUTE = 1 << 0;
        /// Other: write permission.
        const OTHER_WRITE   = 1 << 1;
        /// Other: read permission.
        const OTHER_READ    = 1 << 2;

        /// Group: execute permission.
        const GROUP_EXECUTE = 1 << 3;
        /// Group: write permission.
        const GROUP_WRITE   = 1 << 4;
        /// Group: read permission.
        const GROUP_READ    = 1 << 5;

        /// Owner: execute permission.
        const OWNER_EXECUTE = 1 << 6;
        /// Owner: write permission.
        const OWNER_WRITE   = 1 << 7;
        /// Owner: read permission.
        const OWNER_READ    = 1 << 8;

        /// Read for everyone.
        const ALL_READ = Self::OWNER_READ.bits()
            | Self::GROUP_READ.bits()
            | Self::OTHER_READ.bits();
        /// Execute (search, for directories) for everyone.
        const ALL_EXECUTE = Self::OWNER_EXECUTE.bits()
            | Self::GROUP_EXECUTE.bits()
            | Self::OTHER_EXECUTE.bits();
    }
}

impl InodePerms {
    /// Fixed mode for directories: `0o555`.
    pub const DIRECTORY: Self = Self::ALL_READ.union(Self::ALL_EXECUTE);
    /// Fixed mode for files: `0o444`.
    pub const FILE: Self = Self::ALL_READ;
}

/// The type of an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InodeKind {
    /// A regular file.
    File,
    /// A directory.
    Directory,
}

impl InodeKind {
    /// The fixed permissions for this kind.
    #[must_use]
    pub fn perms(self) -> InodePerms {
        match self {
            Self::File => InodePerms::FILE,
            Self::Directory => InodePerms::DIRECTORY,
        }
    }
}

/// Mutable attributes of an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeAttrs {
    /// Size in bytes. Zero for directories.
    pub size: u64,
    /// Last modification time.
    pub mtime: SystemTime,
    /// Permission bits.
    pub perms: InodePerms,
}

/// Point-in-time snapshot of an inode, as handed to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeStat {
    /// Inode address.
    pub addr: InodeAddr,
    /// File or directory.
    pub kind: InodeKind,
    /// Attributes at snapshot time.
    pub attrs: InodeAttrs,
    /// Owning user.
    pub uid: u32,
    /// Owning group.
    pub gid: u32,
}

/// Reply to [`AccessionFs::get_attributes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrReply {
    /// The attributes.
    pub stat: InodeStat,
    /// When the kernel must consider the attributes stale.
    pub expires: SystemTime,
}

/// Reply to [`AccessionFs::lookup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryReply {
    /// The child's attributes.
    pub stat: InodeStat,
    /// When the kernel must consider the attributes stale.
    pub attr_expires: SystemTime,
    /// When the kernel must consider the name-to-inode binding stale.
    pub entry_expires: SystemTime,
}

/// A directory entry yielded by [`AccessionFs::read_directory`].
///
/// Borrows the entry name from the directory handle's cached listing.
#[derive(Debug, Clone, Copy)]
pub struct DirEntry<'a> {
    /// The name of this entry within its parent directory.
    pub name: &'a OsStr,
    /// The inode this entry resolves to.
    pub addr: InodeAddr,
    /// File or directory.
    pub kind: InodeKind,
    /// Offset to resume listing from after this entry.
    pub offset: u64,
}

/// Filesystem statistics returned by [`AccessionFs::stat_summary`].
///
/// Block-related sizes are in units of `block_size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FsStats {
    /// Filesystem block size (bytes).
    pub block_size: u32,
    /// Total number of data blocks.
    pub total_blocks: u64,
    /// Number of free blocks.
    pub free_blocks: u64,
    /// Number of blocks available to unprivileged users.
    pub available_blocks: u64,
    /// Total number of file nodes (inodes).
    pub total_inodes: u64,
    /// Number of free file nodes.
    pub free_inodes: u64,
    /// Preferred I/O size (bytes).
    pub io_size: u32,
    /// Maximum filename length (bytes).
    pub max_filename_length: u32,
}
