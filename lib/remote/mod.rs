//! Contracts for the remote collaborators the filesystem consumes.
//!
//! The filesystem never talks to the network directly. It asks a [`DirectoryLister`] for
//! directory contents and a [`RangeFetcher`] for file bytes; both run without any filesystem lock
//! held, and only their results are applied to the inode tree.

pub mod http;
pub mod listing;

use std::ffi::OsString;
use std::future::Future;
use std::ops::Range;
use std::time::SystemTime;

use bytes::Bytes;
use thiserror::Error;

use crate::fs::InodeKind;

/// A failure reported by a remote collaborator.
///
/// Cloneable so that a single in-flight fetch can hand the same outcome to every reader that
/// joined it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The remote did not answer in time.
    #[error("remote request timed out")]
    Timeout,

    /// The connection could not be established or was dropped.
    #[error("connection to remote failed: {0}")]
    Connection(String),

    /// The remote answered with a non-success status.
    #[error("remote returned status {0}")]
    Status(u16),

    /// The file has no remote link to fetch from.
    #[error("file has no remote link")]
    MissingLink,

    /// Fewer bytes came back than were asked for.
    #[error("short read from remote: expected {expected} bytes, got {actual}")]
    ShortRead {
        /// Bytes requested.
        expected: u64,
        /// Bytes received.
        actual: u64,
    },

    /// Anything else the transport could not classify.
    #[error("remote failure: {0}")]
    Other(String),
}

/// Fetches byte ranges of remote files.
pub trait RangeFetcher: Clone + Send + Sync + 'static {
    /// Fetch the bytes of `link` in `range` (end-exclusive).
    ///
    /// Implementations must return exactly `range.end - range.start` bytes or an error.
    fn fetch(
        &self,
        link: &str,
        range: Range<u64>,
    ) -> impl Future<Output = Result<Bytes, FetchError>> + Send;
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedEntry {
    /// Entry name within its directory.
    pub name: OsString,
    /// Whether this is a file or a directory.
    pub kind: InodeKind,
    /// Size in bytes. Ignored for directories.
    pub size: u64,
    /// Last modification time as reported by the remote.
    pub mtime: SystemTime,
    /// Content tag, if the remote reports one.
    pub etag: Option<String>,
    /// Storage class or service tier, if the remote reports one.
    pub storage_class: Option<String>,
    /// Link to fetch file bytes from.
    pub link: Option<String>,
}

/// A page of a directory listing.
///
/// A page with no entries is the end-of-listing sentinel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    /// Entries in listing order.
    pub entries: Vec<ListedEntry>,
    /// Token to pass back to get the next page.
    pub continuation: Option<String>,
}

impl ListPage {
    /// Whether this page marks the end of the listing.
    #[must_use]
    pub fn is_end(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Produces directory listings, one page at a time.
pub trait DirectoryLister: Send + Sync + 'static {
    /// List the directory at `path` (slash-separated, empty for the root), resuming from
    /// `continuation` when given.
    fn list(
        &self,
        path: &str,
        continuation: Option<&str>,
    ) -> impl Future<Output = Result<ListPage, FetchError>> + Send;
}
