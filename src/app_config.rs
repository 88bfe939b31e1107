//! Module for application configuration settings.
//!
//! User configurations may be specified in a configuration file and overridden on the command
//! line.

use std::path::{Path, PathBuf};
use std::time::Duration;

use accession_fs::cache::PoolConfig;
use accession_fs::fs::FsOptions;
use bytesize::ByteSize;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const DEFAULT_ENDPOINT: &str = "https://locate.ncbi.nlm.nih.gov/sdl/2/retrieve";
const DEFAULT_LOCATION: &str = "s3.us-east-1";

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_owned()
}

fn default_location() -> String {
    DEFAULT_LOCATION.to_owned()
}

fn default_mount_point() -> PathBuf {
    dirs::runtime_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("share")))
        .map_or_else(
            || PathBuf::from("/tmp/accession-fs/mnt"),
            |dir| dir.join("accession-fs").join("mnt"),
        )
}

fn default_ttl_secs() -> u64 {
    60
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_page_size() -> usize {
    1000
}

fn current_uid() -> u32 {
    nix::unistd::Uid::current().as_raw()
}

fn current_gid() -> u32 {
    nix::unistd::Gid::current().as_raw()
}

fn serialize_token<S>(token: &Option<SecretString>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match token {
        Some(_) => serializer.serialize_some("****"),
        None => serializer.serialize_none(),
    }
}

/// Where and how accessions are resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ResolverConfig {
    /// Name-resolution endpoint.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Cloud location the links should be valid for.
    #[serde(default = "default_location")]
    pub location: String,

    /// Access token for controlled-access data.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_token"
    )]
    pub token: Option<SecretString>,

    /// Accessions to mount.
    #[serde(default)]
    pub accessions: Vec<String>,

    /// Timeout for every remote request, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Entries per directory listing page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            location: default_location(),
            token: None,
            accessions: Vec::new(),
            request_timeout_secs: default_request_timeout_secs(),
            page_size: default_page_size(),
        }
    }
}

impl ResolverConfig {
    /// The token, if any, in the clear.
    pub fn exposed_token(&self) -> Option<&str> {
        self.token.as_ref().map(ExposeSecret::expose_secret)
    }
}

/// Read buffer sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BuffersConfig {
    /// Upper bound on cached file bytes.
    #[serde(default = "BuffersConfig::default_max_memory")]
    pub max_memory: ByteSize,

    /// Fetch granularity.
    #[serde(default = "BuffersConfig::default_chunk_size")]
    pub chunk_size: ByteSize,

    /// Released buffers kept for reuse.
    #[serde(default = "BuffersConfig::default_max_idle")]
    pub max_idle: usize,
}

impl BuffersConfig {
    fn default_max_memory() -> ByteSize {
        PoolConfig::default().max_memory
    }

    fn default_chunk_size() -> ByteSize {
        PoolConfig::default().chunk_size
    }

    fn default_max_idle() -> usize {
        PoolConfig::default().max_idle
    }
}

impl Default for BuffersConfig {
    fn default() -> Self {
        Self {
            max_memory: Self::default_max_memory(),
            chunk_size: Self::default_chunk_size(),
            max_idle: Self::default_max_idle(),
        }
    }
}

impl From<BuffersConfig> for PoolConfig {
    fn from(buffers: BuffersConfig) -> Self {
        Self {
            max_memory: buffers.max_memory,
            chunk_size: buffers.chunk_size,
            max_idle: buffers.max_idle,
        }
    }
}

/// Application configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// The mount point for the filesystem.
    #[serde(default = "default_mount_point")]
    pub mount_point: PathBuf,

    /// Verbose, plain logging.
    #[serde(default)]
    pub debug: bool,

    /// How long the kernel may cache attributes, in seconds.
    #[serde(default = "default_ttl_secs")]
    pub stat_cache_ttl_secs: u64,

    /// How long the kernel may cache names, and a listing stays fresh, in seconds.
    #[serde(default = "default_ttl_secs")]
    pub type_cache_ttl_secs: u64,

    /// The user that owns every file. If not specified, the current user.
    #[serde(default = "current_uid")]
    pub uid: u32,

    /// The group that owns every file. If not specified, the current group.
    #[serde(default = "current_gid")]
    pub gid: u32,

    /// Name resolution settings.
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// Read buffer settings.
    #[serde(default)]
    pub buffers: BuffersConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mount_point: default_mount_point(),
            debug: false,
            stat_cache_ttl_secs: default_ttl_secs(),
            type_cache_ttl_secs: default_ttl_secs(),
            uid: current_uid(),
            gid: current_gid(),
            resolver: ResolverConfig::default(),
            buffers: BuffersConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Config {
    /// Validate the correctness of the configuration.
    ///
    /// Returns:
    /// - `Ok(())` if the configuration is valid.
    /// - `Err(Vec<String>)` containing a list of validation error messages otherwise.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.resolver.accessions.is_empty() {
            errors.push("No accessions to mount. Pass --accession or set resolver.accessions.".to_owned());
        }

        if self.buffers.chunk_size.as_u64() == 0 {
            errors.push("buffers.chunk-size must be greater than zero.".to_owned());
        } else if self.buffers.chunk_size > self.buffers.max_memory {
            errors.push(format!(
                "buffers.chunk-size ({}) is larger than buffers.max-memory ({}).",
                self.buffers.chunk_size, self.buffers.max_memory
            ));
        }

        if self.resolver.page_size == 0 {
            errors.push("resolver.page-size must be greater than zero.".to_owned());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Filesystem options derived from this configuration.
    pub fn fs_options(&self) -> FsOptions {
        FsOptions {
            stat_ttl: Duration::from_secs(self.stat_cache_ttl_secs),
            type_ttl: Duration::from_secs(self.type_cache_ttl_secs),
            uid: self.uid,
            gid: self.gid,
        }
    }

    /// Returns config file paths in descending priority order.
    /// On macOS, skips `dirs::config_dir()` (resolves to ~/Library/Application Support/).
    fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(not(target_os = "macos"))]
        if let Some(xdg) = dirs::config_dir() {
            paths.push(xdg.join("accession-fs").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("accession-fs").join("config.toml"));
        }

        paths.push(PathBuf::from("/etc/accession-fs/config.toml"));

        paths
    }

    /// Finds the first existing config file from search paths.
    fn find_config_file() -> Option<PathBuf> {
        Self::config_search_paths().into_iter().find(|p| p.exists())
    }

    /// Loads config from a single TOML file.
    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading configuration file.");
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Loads configuration from the external path if given, else the first config file found,
    /// else the defaults.
    pub fn load_or_default(external_config_path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = external_config_path {
            return Self::load_from_file(path);
        }
        match Self::find_config_file() {
            Some(path) => Self::load_from_file(&path),
            None => Ok(Self::default()),
        }
    }
}
