pub mod backend;
pub mod connectivity;
pub mod local;
pub mod memory;
pub mod retry;

pub use backend::{Backend, BackendType, ObjectInfo};
pub use connectivity::{AlwaysOnline, ConnectivityGuard, ConnectivityProbe, TcpProbe};
pub use local::LocalBackend;
pub use memory::MemoryBackend;
pub use retry::{RetryConfig, Retryable, retry_with_backoff};
