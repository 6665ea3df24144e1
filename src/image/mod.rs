//! Image source / store collaborators. Bytes are opaque here; only workers
//! look inside them.

use std::path::{Component, Path, PathBuf};
use async_trait::async_trait;
use anyhow::{Result, anyhow, Context as AnyhowContext};
use dashmap::DashMap;
use tracing::debug;

pub mod http;

#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn read(&self, locator: &str) -> Result<Vec<u8>>;
    async fn write(&self, locator: &str, bytes: &[u8]) -> Result<()>;
    /// Locators starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
    async fn remove(&self, locator: &str) -> Result<()>;
}

impl std::fmt::Debug for dyn ImageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ImageStore")
    }
}

#[derive(Debug, Default)]
pub struct InMemoryImageStore {
    images: DashMap<String, Vec<u8>>,
}

impl InMemoryImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, locator: &str) -> bool {
        self.images.contains_key(locator)
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

#[async_trait]
impl ImageStore for InMemoryImageStore {
    async fn read(&self, locator: &str) -> Result<Vec<u8>> {
        self.images
            .get(locator)
            .map(|v| v.value().clone())
            .ok_or_else(|| anyhow!("Image not found: {}", locator))
    }

    async fn write(&self, locator: &str, bytes: &[u8]) -> Result<()> {
        self.images.insert(locator.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut found: Vec<String> = self
            .images
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        found.sort();
        Ok(found)
    }

    async fn remove(&self, locator: &str) -> Result<()> {
        self.images.remove(locator);
        Ok(())
    }
}

/// Store rooted at a directory; locators are relative paths inside it.
#[derive(Debug, Clone)]
pub struct FileImageStore {
    root: PathBuf,
}

impl FileImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, locator: &str) -> Result<PathBuf> {
        let rel = Path::new(locator);
        if rel.components().any(|c| !matches!(c, Component::Normal(_) | Component::CurDir)) {
            return Err(anyhow!("Locator escapes store root: {}", locator));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ImageStore for FileImageStore {
    async fn read(&self, locator: &str) -> Result<Vec<u8>> {
        let path = self.resolve(locator)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read image {}", path.display()))
    }

    async fn write(&self, locator: &str, bytes: &[u8]) -> Result<()> {
        let path = self.resolve(locator)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write image {}", path.display()))?;
        debug!(path = %path.display(), size = bytes.len(), "Image written");
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        // Prefix is "dir/" or "dir/name-start"; only that directory is scanned.
        let (dir, name_prefix) = match prefix.rsplit_once('/') {
            Some((dir, rest)) => (dir, rest),
            None => ("", prefix),
        };
        let dir_path = self.resolve(if dir.is_empty() { "." } else { dir })?;
        let mut entries = match tokio::fs::read_dir(&dir_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(name_prefix) {
                found.push(if dir.is_empty() { name } else { format!("{}/{}", dir, name) });
            }
        }
        found.sort();
        Ok(found)
    }

    async fn remove(&self, locator: &str) -> Result<()> {
        let path = self.resolve(locator)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }
}
