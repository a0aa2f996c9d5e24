//! Configuration consumed by the storage engine.
//!
//! The engine only needs a handful of answers from the registry's
//! configuration: where storage lives, where the config file itself lives
//! (relative storage paths resolve against it), which storage root a given
//! package uses, and a secret. [`ConfigProvider`] is that boundary;
//! [`StorageConfig`] is the bundled implementation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// Per-package settings returned by [`ConfigProvider::matched_package_spec`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSpec {
    /// Storage root override for matching packages.
    #[serde(default)]
    pub storage: Option<PathBuf>,
}

/// What the storage engine needs to know about the registry configuration.
pub trait ConfigProvider: Send + Sync + std::fmt::Debug {
    /// Path of the configuration file, if it was loaded from one.
    fn self_path(&self) -> Option<&Path>;

    /// Default storage root.
    fn storage_root(&self) -> Option<&Path>;

    /// Settings of the package rule matching `name`.
    fn matched_package_spec(&self, name: &str) -> PackageSpec;

    /// Validate a stored secret, returning the secret to use from now on.
    fn check_secret_key(&self, secret: &str) -> String;

    /// Resolve `path` against the directory holding the config file.
    fn resolve_path(&self, path: &Path) -> PathBuf {
        self.self_path()
            .and_then(Path::parent)
            .unwrap_or_else(|| Path::new(""))
            .join(path)
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Default storage root, relative to the config file's directory.
    #[serde(default)]
    pub storage: Option<PathBuf>,

    /// Path of the config file. Set by the loader, never read from the file.
    #[serde(skip)]
    pub self_path: Option<PathBuf>,

    /// Package rules keyed by pattern: an exact name, a `prefix*` glob, or `*`/`**`.
    #[serde(default)]
    pub packages: BTreeMap<String, PackageSpec>,

    /// Fixed secret, used when the index has none.
    #[serde(default)]
    pub secret: Option<String>,
}

impl StorageConfig {
    /// Create a config with only a storage root.
    pub fn new(storage: impl Into<PathBuf>) -> Self {
        Self {
            storage: Some(storage.into()),
            ..Self::default()
        }
    }

    /// Load a YAML config file. Relative storage paths resolve against its directory.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| StorageError::Config {
            message: format!("failed to read {}: {}", path.display(), e),
        })?;
        let mut config = Self::from_yaml_str(&content)?;
        config.self_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Parse a YAML config document.
    pub fn from_yaml_str(content: &str) -> StorageResult<Self> {
        serde_yaml::from_str(content).map_err(|e| StorageError::Config {
            message: format!("invalid storage config: {}", e),
        })
    }

    /// Create config from environment variables.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `PKGSTORE_STORAGE` | Storage root |
    /// | `PKGSTORE_CONFIG_PATH` | Config file path, used to resolve a relative root |
    /// | `PKGSTORE_SECRET` | Fixed secret |
    pub fn from_env() -> Self {
        Self {
            storage: std::env::var_os("PKGSTORE_STORAGE").map(PathBuf::from),
            self_path: std::env::var_os("PKGSTORE_CONFIG_PATH").map(PathBuf::from),
            packages: BTreeMap::new(),
            secret: std::env::var("PKGSTORE_SECRET")
                .ok()
                .filter(|s| !s.is_empty()),
        }
    }

    /// Set the config file path.
    pub fn with_self_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.self_path = Some(path.into());
        self
    }

    /// Add a package rule.
    pub fn with_package(mut self, pattern: impl Into<String>, spec: PackageSpec) -> Self {
        self.packages.insert(pattern.into(), spec);
        self
    }

    /// Set a fixed secret.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }
}

impl ConfigProvider for StorageConfig {
    fn self_path(&self) -> Option<&Path> {
        self.self_path.as_deref()
    }

    fn storage_root(&self) -> Option<&Path> {
        self.storage.as_deref()
    }

    /// Exact names win; otherwise the wildcard rule with the longest literal prefix.
    fn matched_package_spec(&self, name: &str) -> PackageSpec {
        if let Some(spec) = self.packages.get(name) {
            return spec.clone();
        }

        self.packages
            .iter()
            .filter_map(|(pattern, spec)| {
                let prefix = pattern.trim_end_matches('*');
                let is_glob = prefix.len() < pattern.len();
                (is_glob && name.starts_with(prefix)).then_some((prefix.len(), spec))
            })
            .max_by_key(|(specificity, _)| *specificity)
            .map(|(_, spec)| spec.clone())
            .unwrap_or_default()
    }

    fn check_secret_key(&self, secret: &str) -> String {
        if !secret.is_empty() {
            return secret.to_string();
        }
        match self.secret.as_deref() {
            Some(configured) if !configured.is_empty() => configured.to_string(),
            _ => generate_secret(),
        }
    }
}

/// 32 random bytes, hex encoded.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
