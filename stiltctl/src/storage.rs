//! Object storage for meteorology and simulation artifacts.
//!
//! Keys are `/`-separated relative paths. Writes replace whole objects, so
//! concurrent writers of the same key leave the last complete write.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::domain::SceneId;
use crate::error::{Result, StiltError};

/// Key of a scene's cropped meteorology.
pub fn scene_meteorology_key(scene_id: &SceneId) -> String {
    format!("by-scene-id/{scene_id}/meteorology.arl")
}

/// Key of an artifact produced by one simulation.
pub fn simulation_artifact_key(simulation_id: &str, name: &str) -> String {
    format!("by-simulation-id/{simulation_id}/{name}")
}

/// A bucket of immutable-by-convention objects.
#[async_trait]
pub trait ArtifactStore: Send + Sync + 'static {
    /// Read an object; missing keys fail with
    /// [`StiltError::ArtifactNotFound`].
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Write an object, replacing any previous content.
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Copy an object to a local file, creating parent directories.
    async fn download(&self, key: &str, dest: &Path) -> Result<()> {
        let data = self.get(key).await?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &data).await?;
        Ok(())
    }

    /// Store a local file under `key`.
    async fn upload(&self, key: &str, src: &Path) -> Result<()> {
        let data = tokio::fs::read(src).await?;
        self.put(key, Bytes::from(data)).await
    }
}

fn checked_relative(key: &str) -> Result<PathBuf> {
    let path = Path::new(key);
    let clean = !key.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if clean {
        Ok(path.to_path_buf())
    } else {
        Err(StiltError::InvalidArtifactKey(key.to_string()))
    }
}

/// Bucket backed by a local directory.
#[derive(Clone, Debug)]
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        Ok(self.root.join(checked_relative(key)?))
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StiltError::ArtifactNotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.path_for(key)?;
        let parent = path.parent().unwrap_or(&self.root).to_path_buf();
        tokio::fs::create_dir_all(&parent).await?;
        // Readers never observe a partial object.
        let staged = tempfile::NamedTempFile::new_in(&parent)?.into_temp_path();
        tokio::fs::write(&staged, &data).await?;
        staged
            .persist(&path)
            .map_err(|err| StiltError::Io(err.error))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.path_for(key)?).await?)
    }
}

/// Bucket held in process memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryArtifactStore {
    objects: Arc<RwLock<HashMap<String, Bytes>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn get(&self, key: &str) -> Result<Bytes> {
        self.objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| StiltError::ArtifactNotFound(key.to_string()))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        checked_relative(key)?;
        self.objects.write().insert(key.to_string(), data);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.read().contains_key(key))
    }
}

/// Resolves bucket names to stores.
pub trait BucketProvider: Send + Sync {
    fn bucket(&self, name: &str) -> Arc<dyn ArtifactStore>;
}

/// Buckets as subdirectories of one local root.
#[derive(Clone, Debug)]
pub struct LocalBuckets {
    root: PathBuf,
}

impl LocalBuckets {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl BucketProvider for LocalBuckets {
    fn bucket(&self, name: &str) -> Arc<dyn ArtifactStore> {
        Arc::new(LocalArtifactStore::new(self.root.join(name)))
    }
}

/// In-memory buckets, created on first use and shared by name.
#[derive(Clone, Debug, Default)]
pub struct MemoryBuckets {
    buckets: Arc<RwLock<HashMap<String, MemoryArtifactStore>>>,
}

impl MemoryBuckets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn memory_bucket(&self, name: &str) -> MemoryArtifactStore {
        self.buckets
            .write()
            .entry(name.to_string())
            .or_default()
            .clone()
    }
}

impl BucketProvider for MemoryBuckets {
    fn bucket(&self, name: &str) -> Arc<dyn ArtifactStore> {
        Arc::new(self.memory_bucket(name))
    }
}
