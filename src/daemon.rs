use std::sync::Arc;
use std::time::{Duration, SystemTime};

use accession_fs::fs::{AccessionFs, BuildError};
use accession_fs::remote::http::HttpRangeFetcher;
use accession_fs::remote::listing::PayloadLister;
use accession_fs::remote::{DirectoryLister, RangeFetcher};
use accession_locator::{Locator, LocatorError};
use thiserror::Error;
use tokio::select;
use tracing::{debug, error, info, warn};

use crate::app_config;

mod managed_fuse {
    //! fuser will not attempt to fuse unmount the filesystem when the `BackgroundSession` is
    //! dropped, and will only do a regular unmount, but we want to be aggressive and force an
    //! unmount if possible.
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use accession_fs::fs::AccessionFs;
    use accession_fs::fs::fuser::FuserAdapter;
    use accession_fs::remote::{DirectoryLister, RangeFetcher};
    use fuser::BackgroundSession;
    use nix::errno::Errno;

    use super::{debug, error};

    pub struct FuseCoreScope {
        _session: BackgroundSession,
    }

    pub struct ManagedFuse {
        mount_point: PathBuf,
    }

    impl ManagedFuse {
        pub fn new(mount_point: PathBuf) -> Self {
            Self { mount_point }
        }

        pub fn spawn<L: DirectoryLister, F: RangeFetcher>(
            &self,
            fs: Arc<AccessionFs<L, F>>,
            handle: tokio::runtime::Handle,
        ) -> Result<FuseCoreScope, std::io::Error> {
            let adapter = FuserAdapter::new(fs, handle);
            let mount_opts = [
                fuser::MountOption::FSName("accession-fs".to_owned()),
                fuser::MountOption::RO,
                fuser::MountOption::NoDev,
                fuser::MountOption::NoSuid,
                fuser::MountOption::AutoUnmount,
                fuser::MountOption::DefaultPermissions,
            ];
            Ok(FuseCoreScope {
                _session: fuser::spawn_mount2(adapter, &self.mount_point, &mount_opts)?,
            })
        }
    }

    impl Drop for ManagedFuse {
        fn drop(&mut self) {
            const UMOUNT_ATTEMPT_COUNT: usize = 10;
            const UMOUNT_ATTEMPT_DELAY: Duration = Duration::from_millis(10);

            debug!(mount_point = ?self.mount_point, "Confirming unmount of FUSE filesystem...");

            for i in 0..UMOUNT_ATTEMPT_COUNT {
                let result = {
                    #[cfg(target_os = "macos")]
                    {
                        nix::mount::unmount(&self.mount_point, nix::mount::MntFlags::MNT_FORCE)
                    }

                    #[cfg(target_os = "linux")]
                    {
                        nix::mount::umount2(&self.mount_point, nix::mount::MntFlags::MNT_DETACH)
                    }
                };

                match result {
                    Ok(()) => {
                        debug!(attempt = i + 1, "Unmounted FUSE filesystem.");
                        break;
                    }
                    Err(Errno::EBUSY) => {
                        debug!(attempt = i + 1, "FUSE filesystem still busy. Retrying...");
                        std::thread::sleep(UMOUNT_ATTEMPT_DELAY);
                    }
                    Err(Errno::EINVAL | Errno::ENOENT) => {
                        debug!(attempt = i + 1, "FUSE filesystem already unmounted.");
                        break;
                    }
                    Err(e) => {
                        error!(attempt = i + 1, error = %e, "Failed to unmount FUSE filesystem.");
                        break;
                    }
                }
            }
        }
    }
}

/// Errors that stop the daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to resolve accessions: {0}")]
    Resolve(#[from] LocatorError),

    #[error("Resolver returned unusable metadata: {0}")]
    Build(#[from] BuildError),

    #[error("None of the requested accessions could be resolved.")]
    NothingResolved,
}

/// Prepares the mount point directory.
///
/// - If the directory exists and is non-empty, returns an error.
/// - If the directory does not exist, creates it (including parents) and logs an info message.
/// - If the directory exists and is empty, does nothing.
async fn prepare_mount_point(mount_point: &std::path::Path) -> Result<(), std::io::Error> {
    match tokio::fs::read_dir(mount_point).await {
        Ok(mut entries) => {
            if entries.next_entry().await?.is_some() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!(
                        "Mount point '{}' already exists and is not empty.",
                        mount_point.display()
                    ),
                ));
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(mount_point).await?;
            info!(path = %mount_point.display(), "Created mount point directory.");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Block until asked to stop. `SIGUSR1` asks the filesystem to shed memory and keeps running.
async fn wait_for_exit<L: DirectoryLister, F: RangeFetcher>(
    fs: &AccessionFs<L, F>,
) -> Result<(), std::io::Error> {
    use tokio::signal;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut sighup = signal::unix::signal(signal::unix::SignalKind::hangup())?;
    let mut sigusr1 = signal::unix::signal(signal::unix::SignalKind::user_defined1())?;
    loop {
        select! {
            _ = signal::ctrl_c() => {
                debug!("Received Ctrl+C signal, shutting down...");
                return Ok(());
            },
            _ = sigterm.recv() => {
                debug!("Received termination signal, shutting down...");
                return Ok(());
            },
            _ = sighup.recv() => {
                debug!("Received hangup signal, shutting down...");
                return Ok(());
            },
            _ = sigusr1.recv() => {
                fs.release_memory_hint();
            },
        }
    }
}

/// Main entry point for the daemon.
pub async fn run(
    config: app_config::Config,
    handle: tokio::runtime::Handle,
) -> Result<(), DaemonError> {
    let locator = Locator::with_endpoint(
        config.resolver.endpoint.clone(),
        Duration::from_secs(config.resolver.request_timeout_secs),
    );

    info!(
        count = config.resolver.accessions.len(),
        location = %config.resolver.location,
        "Resolving accessions...",
    );
    let payload: Vec<_> = locator
        .names()
        .resolve(
            &config.resolver.location,
            config.resolver.exposed_token(),
            &config.resolver.accessions,
        )
        .await?
        .into_iter()
        .filter(|accession| {
            if !accession.is_resolved() {
                warn!(
                    accession = %accession.id,
                    status = ?accession.status,
                    message = accession.message.as_deref().unwrap_or(""),
                    "Skipping accession the resolver could not resolve.",
                );
            }
            accession.is_resolved()
        })
        .collect();
    if payload.is_empty() {
        return Err(DaemonError::NothingResolved);
    }

    let lister = PayloadLister::new(&payload, config.resolver.page_size, SystemTime::now())?;
    let fetcher = HttpRangeFetcher::new(locator);
    let fs = Arc::new(AccessionFs::new(
        &payload,
        lister,
        fetcher,
        config.fs_options(),
        config.buffers.into(),
    )?);

    prepare_mount_point(&config.mount_point).await?;

    info!("Mounting filesystem at {}.", config.mount_point.display());

    let fuse = managed_fuse::ManagedFuse::new(config.mount_point.clone());
    {
        let _session = fuse.spawn(Arc::clone(&fs), handle)?;
        info!("accession-fs is running. Press Ctrl+C to stop.");

        wait_for_exit(&fs).await?;
    }
    Ok(())
}

pub fn spawn(config: app_config::Config) -> Result<(), DaemonError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(run(config, runtime.handle().clone()));
    if let Err(e) = &result {
        error!("Daemon failed: {e}");
    }
    result
}
