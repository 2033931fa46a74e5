use crate::backend::{Backend, BackendType, ObjectInfo};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use shardvault_core::{Error, Result};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// In-process destination with fault injection hooks.
#[derive(Default)]
pub struct MemoryBackend {
    objects: RwLock<BTreeMap<String, (Bytes, DateTime<Utc>)>>,
    failing_keys: RwLock<HashSet<String>>,
    offline: AtomicBool,
    transient_failures: AtomicU32,
    uploads: AtomicUsize,
    downloads: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every call fails with a connection error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Makes the next `count` calls fail with a transient error.
    pub fn fail_next(&self, count: u32) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Downloads of `key` fail permanently until the key is cleared.
    pub async fn fail_key(&self, key: &str) {
        self.failing_keys.write().await.insert(key.to_string());
    }

    pub async fn clear_failures(&self) {
        self.failing_keys.write().await.clear();
    }

    pub async fn remove(&self, key: &str) -> bool {
        self.objects.write().await.remove(key).is_some()
    }

    /// Flips one byte of the stored object.
    pub async fn corrupt(&self, key: &str) -> bool {
        let mut objects = self.objects.write().await;
        let Some((data, _)) = objects.get_mut(key) else {
            return false;
        };
        let mut bytes = data.to_vec();
        if let Some(byte) = bytes.first_mut() {
            *byte ^= 0xff;
        }
        *data = Bytes::from(bytes);
        true
    }

    pub async fn keys(&self) -> Vec<String> {
        self.objects.read().await.keys().cloned().collect()
    }

    pub async fn object_count(&self) -> usize {
        self.objects.read().await.len()
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Backend("connection refused: destination offline".to_string()));
        }
        let consumed = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if consumed.is_ok() {
            return Err(Error::Backend("service temporarily unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn init(&self) -> Result<()> {
        self.check_reachable()
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check_reachable()?;
        Ok(self.objects.read().await.contains_key(key))
    }

    async fn upload(&self, suggested_key: &str, data: Bytes) -> Result<String> {
        self.check_reachable()?;
        self.uploads.fetch_add(1, Ordering::SeqCst);
        self.objects
            .write()
            .await
            .insert(suggested_key.to_string(), (data, Utc::now()));
        Ok(suggested_key.to_string())
    }

    async fn download(&self, key: &str) -> Result<Bytes> {
        self.check_reachable()?;
        self.downloads.fetch_add(1, Ordering::SeqCst);
        if self.failing_keys.read().await.contains(key) {
            return Err(Error::Backend(format!("injected read failure for {}", key)));
        }
        self.objects
            .read()
            .await
            .get(key)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| Error::Backend(format!("Object not found: {}", key)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_reachable()?;
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.check_reachable()?;
        let dir = format!("{}/", prefix.trim_end_matches('/'));
        Ok(self
            .objects
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(&dir) && !k[dir.len()..].contains('/'))
            .cloned()
            .collect())
    }

    async fn stat(&self, key: &str) -> Result<ObjectInfo> {
        self.check_reachable()?;
        let objects = self.objects.read().await;
        let (data, modified) = objects
            .get(key)
            .ok_or_else(|| Error::Backend(format!("Object not found: {}", key)))?;
        Ok(ObjectInfo {
            key: key.to_string(),
            size: data.len() as u64,
            modified: *modified,
        })
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Memory
    }
}
