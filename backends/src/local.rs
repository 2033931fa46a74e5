use crate::backend::{Backend, BackendType, ObjectInfo};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use shardvault_core::{Error, Result};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Destination rooted at a local directory; keys map to relative paths.
pub struct LocalBackend {
    base_path: PathBuf,
}

impl LocalBackend {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    fn full_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(Error::Backend(format!("Invalid object key: {}", key)));
        }
        Ok(self.base_path.join(relative))
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.base_path).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(fs::try_exists(self.full_path(key)?).await?)
    }

    async fn upload(&self, suggested_key: &str, data: Bytes) -> Result<String> {
        let full_path = self.full_path(suggested_key)?;
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        // Readers never observe a partially written part.
        let staging = full_path.with_extension("partial");
        fs::write(&staging, &data)
            .await
            .map_err(|e| Error::Backend(format!("Failed to write {}: {}", suggested_key, e)))?;
        fs::rename(&staging, &full_path)
            .await
            .map_err(|e| Error::Backend(format!("Failed to write {}: {}", suggested_key, e)))?;
        Ok(suggested_key.to_string())
    }

    async fn download(&self, key: &str) -> Result<Bytes> {
        let data = fs::read(self.full_path(key)?)
            .await
            .map_err(|e| Error::Backend(format!("Failed to read {}: {}", key, e)))?;
        Ok(Bytes::from(data))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let full_path = self.full_path(key)?;
        if full_path.is_file() {
            fs::remove_file(&full_path)
                .await
                .map_err(|e| Error::Backend(format!("Failed to delete {}: {}", key, e)))?;
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let full_path = self.full_path(prefix)?;
        let mut results = Vec::new();

        if full_path.is_dir() {
            let mut entries = fs::read_dir(&full_path).await?;
            while let Some(entry) = entries.next_entry().await? {
                if let Some(name) = entry.file_name().to_str() {
                    if entry.file_type().await?.is_file() {
                        results.push(format!("{}/{}", prefix, name));
                    }
                }
            }
        }
        results.sort();
        Ok(results)
    }

    async fn stat(&self, key: &str) -> Result<ObjectInfo> {
        let metadata = fs::metadata(self.full_path(key)?)
            .await
            .map_err(|e| Error::Backend(format!("Failed to stat {}: {}", key, e)))?;
        let modified = metadata
            .modified()
            .map_err(|e| Error::Backend(format!("Failed to get modified time: {}", e)))?;
        let modified: DateTime<Utc> = modified.into();

        Ok(ObjectInfo {
            key: key.to_string(),
            size: metadata.len(),
            modified,
        })
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Local
    }
}
