//! accession-fs shared library.
//!
//! Presents resolved accessions as a read-only directory tree and serves file reads by fetching
//! byte ranges from their remote links on demand.

/// Caching primitives: single-flight cache, content buffers and their pool.
pub mod cache;
/// Inode tree, handles and the kernel-facing controller.
pub mod fs;
/// Contracts and implementations for remote listing and range fetching.
pub mod remote;
