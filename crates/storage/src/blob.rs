use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};

/// Content-addressable blob storage: named byte payloads under deterministic
/// keys. Implementations own durability; callers own key derivation.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Store a payload under `key`, returning a fetchable location.
    async fn put(&self, key: &str, payload: &[u8], content_type: &str) -> Result<String>;

    /// Fetch the payload stored under `key`.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
}

/// Filesystem-backed blob store. Keys map to paths under a root directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("create blob root: {}", root.display()))?;
        Ok(Self { root })
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("invalid blob key: {key}");
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait::async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, payload: &[u8], _content_type: &str) -> Result<String> {
        let path = self.resolve(key)?;
        let payload = payload.to_vec();
        let location = path.display().to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create blob dir: {}", parent.display()))?;
            }
            std::fs::write(&path, payload)
                .with_context(|| format!("write blob: {}", path.display()))?;
            Ok(())
        })
        .await??;
        Ok(location)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key)?;
        tokio::task::spawn_blocking(move || {
            std::fs::read(&path).with_context(|| format!("read blob: {}", path.display()))
        })
        .await?
    }
}
