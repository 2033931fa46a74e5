use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Invalid encapsulation length: {len} bytes")]
    InvalidEncapsulation { len: usize },

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid password")]
    InvalidPassword,

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Part {index} is corrupt")]
    CorruptPart { index: usize },

    #[error("Part {index} is missing")]
    MissingPart { index: usize },

    #[error("Insufficient shards: {available} verified, {required} required")]
    InsufficientShards { available: usize, required: usize },

    #[error("Insufficient parts: fetched {available} of {required} required")]
    InsufficientParts { available: usize, required: usize },

    #[error("Corrupt storage for block {hash}: {reason}")]
    CorruptBlockStorage { hash: String, reason: String },

    #[error("Block not found: {hash}")]
    BlockNotFound { hash: String },

    #[error("Content of {path} differs from backup at offset {offset}")]
    CompareMismatch { path: String, offset: u64 },

    #[error("Length mismatch for {path}: expected {expected} bytes, got {actual}")]
    LengthMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("Failed to restore {path}: {reason}")]
    RestoreFailed { path: String, reason: String },

    #[error("Shutdown requested")]
    ShutdownRequested,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Errors that invalidate one stored copy of a block but say nothing about
    /// the other copies.
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            Error::CorruptPart { .. }
                | Error::MissingPart { .. }
                | Error::InsufficientShards { .. }
                | Error::InsufficientParts { .. }
                | Error::CorruptBlockStorage { .. }
                | Error::DecryptionFailed(_)
                | Error::InvalidEncapsulation { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
