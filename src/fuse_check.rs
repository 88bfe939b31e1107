//! FUSE availability checks.

#[cfg(any(target_os = "linux", target_os = "macos"))]
use std::path::Path;

#[cfg(target_os = "linux")]
const FUSE_DEVICE: &str = "/dev/fuse";

#[cfg(target_os = "macos")]
const MACFUSE_FS_BUNDLE: &str = "/Library/Filesystems/macfuse.fs";

/// Errors that can occur when verifying FUSE availability.
#[derive(Debug, thiserror::Error)]
pub enum FuseCheckError {
    #[cfg(target_os = "linux")]
    /// The FUSE device node is absent; the kernel module is not loaded or not exposed.
    #[error(
        "{path} does not exist. Load the fuse kernel module (`modprobe fuse`) or, in a \
         container, pass the device through (`--device /dev/fuse`)."
    )]
    DeviceMissing {
        /// Where the device was expected.
        path: &'static str,
    },

    #[cfg(target_os = "linux")]
    /// The FUSE device exists but is not a character device.
    #[error("{path} exists but is not a character device.")]
    NotACharDevice {
        /// The offending path.
        path: &'static str,
    },

    #[cfg(target_os = "macos")]
    /// macFUSE is not installed.
    #[error(
        "macFUSE is not installed. accession-fs requires macFUSE to mount filesystems.\n\
         Install it from: https://macfuse.github.io/"
    )]
    NotInstalled,
}

/// Verify that FUSE is usable on the current platform.
#[cfg(target_os = "linux")]
pub fn ensure_fuse() -> Result<(), FuseCheckError> {
    use std::os::unix::fs::FileTypeExt as _;

    let metadata = std::fs::metadata(Path::new(FUSE_DEVICE))
        .map_err(|_| FuseCheckError::DeviceMissing { path: FUSE_DEVICE })?;
    if !metadata.file_type().is_char_device() {
        return Err(FuseCheckError::NotACharDevice { path: FUSE_DEVICE });
    }
    Ok(())
}

/// Verify that FUSE is usable on the current platform.
#[cfg(target_os = "macos")]
pub fn ensure_fuse() -> Result<(), FuseCheckError> {
    if Path::new(MACFUSE_FS_BUNDLE).is_dir() {
        Ok(())
    } else {
        Err(FuseCheckError::NotInstalled)
    }
}

/// Verify that FUSE is usable on the current platform.
///
/// Nothing to check here; the mount itself reports failure.
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn ensure_fuse() -> Result<(), FuseCheckError> {
    Ok(())
}
