//! Object storage used by both jobs
//!
//! Pipelines talk to an [`ObjectStore`]: S3 in production, a directory tree
//! for local runs and tests. Paths given on the command line are parsed into
//! a [`StorageUri`] and resolved into a [`Location`] (store plus key prefix).

use anyhow::Result;
use async_trait::async_trait;
use bronze_common::BronzeError;
use bytes::Bytes;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

pub mod config;
pub mod local;
pub mod s3;

pub use config::StorageConfig;
pub use local::LocalStore;
pub use s3::S3Store;

/// A listed object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
}

impl ObjectInfo {
    /// Last `/`-separated segment of the key
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

/// Minimal key/value object store
#[async_trait]
pub trait ObjectStore: Send + Sync + std::fmt::Debug {
    /// All objects whose key starts with `prefix`, in key order, across every
    /// page of the underlying listing.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;

    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Create or replace an object
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Remove an object; removing a missing object succeeds
    async fn delete(&self, key: &str) -> Result<()>;

    /// Human-readable URI for logs
    fn describe(&self, key: &str) -> String;
}

/// A parsed path argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageUri {
    S3 { bucket: String, prefix: String },
    Local(PathBuf),
}

impl FromStr for StorageUri {
    type Err = BronzeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(BronzeError::InvalidLocation("empty path".to_string()));
        }

        for scheme in ["s3://", "s3a://", "s3n://"] {
            if let Some(rest) = s.strip_prefix(scheme) {
                let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
                if bucket.is_empty() {
                    return Err(BronzeError::InvalidLocation(format!("missing bucket in '{}'", s)));
                }
                return Ok(StorageUri::S3 {
                    bucket: bucket.to_string(),
                    prefix: prefix.trim_matches('/').to_string(),
                });
            }
        }

        if let Some(path) = s.strip_prefix("file://") {
            return Ok(StorageUri::Local(PathBuf::from(path)));
        }
        if s.contains("://") {
            return Err(BronzeError::InvalidLocation(format!("unsupported scheme in '{}'", s)));
        }
        Ok(StorageUri::Local(PathBuf::from(s)))
    }
}

impl StorageUri {
    /// Whether `other` is this location or lies below it
    pub fn contains(&self, other: &StorageUri) -> bool {
        match (self, other) {
            (
                StorageUri::S3 { bucket, prefix },
                StorageUri::S3 {
                    bucket: other_bucket,
                    prefix: other_prefix,
                },
            ) => {
                bucket == other_bucket
                    && (prefix.is_empty()
                        || other_prefix == prefix
                        || other_prefix
                            .strip_prefix(prefix.as_str())
                            .is_some_and(|rest| rest.starts_with('/')))
            },
            (StorageUri::Local(path), StorageUri::Local(other_path)) => {
                other_path.starts_with(path)
            },
            _ => false,
        }
    }
}

/// A store plus a directory-like key prefix
#[derive(Debug, Clone)]
pub struct Location {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl Location {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl AsRef<str>) -> Self {
        Self {
            store,
            prefix: prefix.as_ref().trim_matches('/').to_string(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Full key of `relative` below this location
    pub fn key(&self, relative: &str) -> String {
        let relative = relative.trim_start_matches('/');
        if self.prefix.is_empty() {
            relative.to_string()
        } else {
            format!("{}/{}", self.prefix, relative)
        }
    }

    pub fn child(&self, relative: &str) -> Location {
        Location::new(self.store.clone(), self.key(relative))
    }

    pub fn uri(&self) -> String {
        self.store.describe(&self.prefix)
    }

    /// Objects below this location; keys stay absolute within the store
    pub async fn list(&self) -> Result<Vec<ObjectInfo>> {
        let prefix = if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.prefix)
        };
        self.store.list(&prefix).await
    }

    pub async fn get(&self, relative: &str) -> Result<Bytes> {
        self.store.get(&self.key(relative)).await
    }

    pub async fn put(&self, relative: &str, data: Bytes) -> Result<()> {
        self.store.put(&self.key(relative), data).await
    }

    /// Remove every object below this location, returning how many went
    pub async fn delete_all(&self) -> Result<usize> {
        let objects = self.list().await?;
        for object in &objects {
            self.store.delete(&object.key).await?;
        }
        if !objects.is_empty() {
            debug!(location = %self.uri(), removed = objects.len(), "Cleared location");
        }
        Ok(objects.len())
    }
}

/// Turns path arguments into locations, sharing one S3 client
pub struct StorageResolver {
    config: StorageConfig,
    client: OnceCell<aws_sdk_s3::Client>,
}

impl StorageResolver {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> aws_sdk_s3::Client {
        self.client
            .get_or_init(|| self.config.build_client())
            .await
            .clone()
    }

    /// Store for a whole bucket
    pub async fn bucket(&self, bucket: &str) -> Arc<dyn ObjectStore> {
        Arc::new(S3Store::new(self.client().await, bucket))
    }

    pub async fn resolve(&self, uri: &StorageUri) -> Location {
        match uri {
            StorageUri::S3 { bucket, prefix } => Location::new(self.bucket(bucket).await, prefix),
            StorageUri::Local(path) => Location::new(Arc::new(LocalStore::new(path)), ""),
        }
    }
}
