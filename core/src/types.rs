use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Content hash of a block's plaintext payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockHash([u8; 32]);

impl BlockHash {
    pub fn new(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }

    pub fn from_data(data: &[u8]) -> Self {
        Self::new(blake3::hash(data))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn short_string(&self) -> String {
        self.to_hex().chars().take(8).collect()
    }
}

impl From<blake3::Hash> for BlockHash {
    fn from(hash: blake3::Hash) -> Self {
        Self::new(hash)
    }
}

impl FromStr for BlockHash {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut array = [0u8; 32];
        array.copy_from_slice(&bytes);
        Ok(Self(array))
    }
}

impl Serialize for BlockHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        BlockHash::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

pub type DestinationId = String;
pub type PartKey = String;

/// Free-form algorithm parameters persisted with a storage record.
pub type Metadata = BTreeMap<String, String>;

/// How a block's payload bytes were produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatTag {
    /// A contiguous slice of one file, stored as-is.
    Raw,
    /// A contiguous slice of one file, zlib compressed.
    Compressed,
    /// Several small files bin-packed into one payload.
    Archived,
    /// Ordered list of sub-block hashes whose contents concatenate.
    Chain,
}

impl fmt::Display for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FormatTag::Raw => "raw",
            FormatTag::Compressed => "compressed",
            FormatTag::Archived => "archived",
            FormatTag::Chain => "chain",
        };
        f.write_str(name)
    }
}

/// One destination's encrypted, erasure-coded copy of a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRecord {
    pub destination: DestinationId,
    pub encryption: String,
    #[serde(default)]
    pub encryption_metadata: Metadata,
    pub error_correction: String,
    #[serde(default)]
    pub error_correction_metadata: Metadata,
    pub part_keys: Vec<PartKey>,
}

impl StorageRecord {
    pub fn new(destination: impl Into<DestinationId>, encryption: &str, error_correction: &str) -> Self {
        Self {
            destination: destination.into(),
            encryption: encryption.to_string(),
            encryption_metadata: Metadata::new(),
            error_correction: error_correction.to_string(),
            error_correction_metadata: Metadata::new(),
            part_keys: Vec::new(),
        }
    }

    pub fn part_count(&self) -> usize {
        self.part_keys.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub hash: BlockHash,
    pub format: FormatTag,
    pub created: DateTime<Utc>,
    pub storage: Vec<StorageRecord>,
}

impl Block {
    pub fn new(hash: BlockHash, format: FormatTag) -> Self {
        Self {
            hash,
            format,
            created: Utc::now(),
            storage: Vec::new(),
        }
    }

    pub fn record_for(&self, destination: &str) -> Option<&StorageRecord> {
        self.storage.iter().find(|r| r.destination == destination)
    }

    pub fn destinations(&self) -> Vec<DestinationId> {
        self.storage.iter().map(|r| r.destination.clone()).collect()
    }
}

/// A single contiguous slice of a file within a block's payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilePart {
    pub block_hash: BlockHash,
    /// Index of the slice within the block's payload (archive entry index).
    pub index: u32,
    /// Hash of the original slice bytes, used for dedup lookups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_hash: Option<BlockHash>,
}

/// Byte range of a file and the part holding it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRange {
    pub offset: u64,
    pub length: u64,
    pub part: FilePart,
}

impl FileRange {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// One complete alternative set of ranges reconstructing a file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLocation {
    pub ranges: Vec<FileRange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupFile {
    pub path: PathBuf,
    pub length: u64,
    /// Modification time of the source when it was backed up, in milliseconds.
    pub modified: i64,
    pub locations: Vec<FileLocation>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_hash_hex_roundtrip() {
        let hash = BlockHash::from_data(b"shardvault");
        let parsed: BlockHash = hash.to_hex().parse().unwrap();
        assert_eq!(hash, parsed);
        assert_eq!(hash.short_string().len(), 8);
    }

    #[test]
    fn test_block_hash_rejects_short_hex() {
        assert!("abcd".parse::<BlockHash>().is_err());
    }

    #[test]
    fn test_storage_record_serializes_losslessly() {
        let mut record = StorageRecord::new("primary", "xchacha20-poly1305", "reed-solomon");
        record
            .error_correction_metadata
            .insert("data_shards".to_string(), "8".to_string());
        record
            .encryption_metadata
            .insert("recipient:abcd".to_string(), "AAAA".to_string());
        record.part_keys = vec!["a/1".to_string(), "a/2".to_string()];

        let json = serde_json::to_string(&record).unwrap();
        let back: StorageRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record, back);
    }
}
