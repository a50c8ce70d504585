use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    error::{BucketError, Result},
    permissions::{BucketTokens, Permissions},
    storage::{MemoryStorage, Storage},
};

const ENV_PREFIX: &str = "BUCKETDB_";

/// Which [`Storage`] the process runs on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Memory,
    Banyan,
}

impl FromStr for Backend {
    type Err = BucketError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "memory" => Ok(Backend::Memory),
            "banyan" => Ok(Backend::Banyan),
            other => Err(BucketError::Config(format!(
                "Unknown storage backend: {other}"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: Backend,
    /// File the banyan backend writes bucket root links to.
    pub state_path: Option<PathBuf>,
    /// Capacity in bytes of the in-memory block store used by the banyan backend.
    pub memory_store_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            state_path: None,
            memory_store_size: 1 << 30,
        }
    }
}

/// Process configuration, read once at start up and passed by reference.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_name: String,
    pub storage: StorageConfig,
    /// Buckets that answer ungrouped queries. Others only serve `group_by` or `period` queries.
    pub raw_queries_allowed: BTreeMap<String, bool>,
    pub tokens: BucketTokens,
    pub permissions: Permissions,
    /// Largest accepted CSV upload, in bytes.
    pub max_upload_size: usize,
    /// `tracing_subscriber::EnvFilter` directives used when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_name: "bucketdb".to_string(),
            storage: StorageConfig::default(),
            raw_queries_allowed: BTreeMap::new(),
            tokens: BucketTokens::default(),
            permissions: Permissions::default(),
            max_upload_size: 100_000,
            log_filter: "bucketdb=info".to_string(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            BucketError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        let config: Config = serde_json::from_str(&contents).map_err(|e| {
            BucketError::Config(format!("Failed to parse config file {:?}: {}", path, e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the file, then applies `BUCKETDB_*` environment overrides.
    pub fn from_file_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(format!("{ENV_PREFIX}{name}")).ok())
    }

    /// Applies overrides looked up by unprefixed name (`BACKEND`, `STATE_PATH`, ...).
    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("DATABASE_NAME") {
            self.database_name = name;
        }
        if let Some(backend) = lookup("BACKEND") {
            self.storage.backend = backend.parse()?;
        }
        if let Some(path) = lookup("STATE_PATH") {
            self.storage.state_path = Some(PathBuf::from(path));
        }
        if let Some(size) = lookup("MEMORY_STORE_SIZE") {
            self.storage.memory_store_size = parse_number("MEMORY_STORE_SIZE", &size)?;
        }
        if let Some(size) = lookup("MAX_UPLOAD_SIZE") {
            self.max_upload_size = parse_number("MAX_UPLOAD_SIZE", &size)?;
        }
        if let Some(filter) = lookup("LOG") {
            self.log_filter = filter;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_name.is_empty() {
            return Err(BucketError::Config("database_name must not be empty".into()));
        }
        if self.max_upload_size == 0 {
            return Err(BucketError::Config("max_upload_size must be positive".into()));
        }
        if self.storage.backend == Backend::Banyan && self.storage.memory_store_size == 0 {
            return Err(BucketError::Config(
                "memory_store_size must be positive for the banyan backend".into(),
            ));
        }
        Ok(())
    }

    pub fn raw_queries_allowed(&self, bucket: &str) -> bool {
        self.raw_queries_allowed.get(bucket).copied().unwrap_or(false)
    }

    /// Opens the configured backend.
    ///
    /// The banyan backend keeps blocks in memory, so it starts with no buckets and only writes
    /// its root links to `state_path`.
    pub fn open_storage(&self) -> Result<Arc<dyn Storage>> {
        info!(backend = ?self.storage.backend, "opening storage");
        match self.storage.backend {
            Backend::Memory => Ok(Arc::new(MemoryStorage::new())),
            #[cfg(feature = "banyan-store")]
            Backend::Banyan => {
                use crate::storage::{memory_store, BanyanStorage};
                Ok(Arc::new(BanyanStorage::new(
                    memory_store(self.storage.memory_store_size),
                    banyan::Config::debug_fast(),
                    banyan::Secrets::default(),
                    self.storage.state_path.as_deref(),
                )))
            }
            #[cfg(not(feature = "banyan-store"))]
            Backend::Banyan => Err(BucketError::Config(
                "bucketdb was built without the banyan-store feature".into(),
            )),
        }
    }
}

fn parse_number(name: &str, value: &str) -> Result<usize> {
    value
        .parse()
        .map_err(|_| BucketError::Config(format!("{ENV_PREFIX}{name} must be a number, got {value}")))
}
