//! Mount remotely resolved accessions as a read-only filesystem.
use std::path::PathBuf;

use clap::Parser;
use tracing::{debug, error};

mod app_config;
mod daemon;
mod fuse_check;
mod trc;

use crate::app_config::Config;
use crate::trc::Trc;

#[derive(Parser)]
#[command(
    version,
    about = "Mount resolved accessions as a read-only filesystem, fetching bytes on demand."
)]
struct Args {
    #[arg(
        short,
        long,
        value_parser,
        help = "Optional path to a configuration TOML."
    )]
    config_path: Option<PathBuf>,

    #[arg(short, long, help = "Where to mount. Overrides the configuration file.")]
    mount_point: Option<PathBuf>,

    #[arg(short, long, help = "Verbose, plain logging.")]
    debug: bool,

    #[arg(short, long, help = "Cloud location links should be valid for, e.g. s3.us-east-1.")]
    location: Option<String>,

    #[arg(
        short,
        long = "accession",
        value_name = "ACCESSION",
        help = "Accession to mount. Repeatable; replaces the configured list."
    )]
    accessions: Vec<String>,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(mount_point) = self.mount_point {
            config.mount_point = mount_point;
        }
        if self.debug {
            config.debug = true;
        }
        if let Some(location) = self.location {
            config.resolver.location = location;
        }
        if !self.accessions.is_empty() {
            config.resolver.accessions = self.accessions;
        }
    }
}

/// Main entry point for the application.
fn main() {
    let args = Args::parse();

    // Errors use eprintln since tracing isn't initialized yet.
    let mut config = Config::load_or_default(args.config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });
    args.apply(&mut config);
    if let Err(error_messages) = config.validate() {
        eprintln!("Configuration is invalid.");
        for msg in &error_messages {
            eprintln!(" - {msg}");
        }
        std::process::exit(1);
    }

    Trc::default()
        .with_debug(config.debug)
        .init()
        .unwrap_or_else(|e| {
            eprintln!(
                "Failed to initialize logging. Without logging, we can't provide any useful error \
                 messages, so we have to exit: {e}"
            );
            std::process::exit(1);
        });

    if let Err(e) = fuse_check::ensure_fuse() {
        error!("{e}");
        std::process::exit(1);
    }

    debug!(config = ?config, "Starting daemon with configuration...");
    if daemon::spawn(config).is_err() {
        std::process::exit(1);
    }
}
