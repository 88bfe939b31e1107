//! Errors surfaced by the filesystem.

use std::num::ParseIntError;

use thiserror::Error;

use crate::remote::FetchError;

/// Errors returned by kernel-facing operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FsError {
    /// The name or inode does not exist.
    #[error("no such file or directory")]
    NotFound,

    /// The caller's buffer cannot hold the value. Nothing was copied.
    #[error("destination buffer too small, {required} bytes required")]
    RangeTooSmall {
        /// Size the destination must have to hold the whole value.
        required: usize,
    },

    /// The inode carries no extended attribute with this name.
    #[error("no such extended attribute")]
    NoSuchAttribute,

    /// A directory operation was attempted on a file.
    #[error("not a directory")]
    NotADirectory,

    /// A file operation was attempted on a directory.
    #[error("is a directory")]
    IsADirectory,

    /// Fetching file bytes from the remote failed.
    #[error("remote read failed: {0}")]
    Transport(#[source] FetchError),

    /// Listing a directory from the remote failed.
    #[error("directory listing failed: {0}")]
    Listing(#[source] FetchError),
}

impl FsError {
    /// The errno reported to the kernel for this error.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::RangeTooSmall { .. } => libc::ERANGE,
            Self::NoSuchAttribute => libc::ENODATA,
            Self::NotADirectory => libc::ENOTDIR,
            Self::IsADirectory => libc::EISDIR,
            Self::Transport(_) | Self::Listing(_) => libc::EIO,
        }
    }
}

/// Errors raised while building the filesystem from the resolved payload.
#[derive(Debug, Error)]
pub enum BuildError {
    /// A file's declared size is not a decimal integer.
    #[error("accession {accession}: file {file:?} has invalid size {size:?}")]
    InvalidMetadata {
        /// Accession the file belongs to.
        accession: String,
        /// File name.
        file: String,
        /// The size string as received.
        size: String,
        /// Parse failure.
        #[source]
        source: ParseIntError,
    },
}
