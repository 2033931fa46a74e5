pub mod chunker;
pub mod config;
pub mod crypto;
pub mod ecc;
pub mod error;
pub mod format;
pub mod identity;
pub mod repository;
pub mod shutdown;
pub mod types;

pub use config::VaultConfig;
pub use error::{Error, Result};
pub use identity::{Identity, PublicIdentity};
pub use repository::{MemoryRepository, MetadataRepository};
pub use shutdown::Shutdown;
pub use types::*;
