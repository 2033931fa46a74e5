use async_trait::async_trait;
use bytes::Bytes;
use shardvault_core::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Local,
    Memory,
}

/// Object-store contract for one destination.
///
/// `upload` receives a suggested key and returns the key the object was
/// actually stored under; callers must persist the returned key.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn init(&self) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn upload(&self, suggested_key: &str, data: Bytes) -> Result<String>;

    async fn download(&self, key: &str) -> Result<Bytes>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Keys directly under `prefix`. Destinations that cannot list return an
    /// error.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn stat(&self, key: &str) -> Result<ObjectInfo>;

    fn backend_type(&self) -> BackendType;
}

#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub modified: chrono::DateTime<chrono::Utc>,
}
