use crate::types::{Block, BlockHash, BackupFile, FilePart};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::fs;
use tokio::sync::RwLock;

/// Lookup and insert contract the storage engine needs from the metadata
/// repository.
///
/// The repository owns blocks and file parts; the engine only creates blocks
/// (on upload) and reads them (on download and dedup checks). Durable storage
/// and replication of these records is the implementor's concern.
#[async_trait]
pub trait MetadataRepository: Send + Sync {
    /// Returns the block whose plaintext hashes to `hash`, if recorded.
    async fn block_by_hash(&self, hash: &BlockHash) -> Result<Option<Block>>;

    /// Durably records `block`, replacing any record with the same hash.
    async fn insert_block(&self, block: Block) -> Result<()>;

    /// Returns every known file part whose original bytes hash to `hash`.
    async fn file_parts_by_hash(&self, hash: &BlockHash) -> Result<Vec<FilePart>>;
}

/// Repository held in memory, optionally persisted as a single JSON document.
///
/// # Examples
///
/// ```no_run
/// use shardvault_core::repository::MemoryRepository;
///
/// #[tokio::main]
/// async fn main() -> shardvault_core::Result<()> {
///     let repo = MemoryRepository::new();
///     repo.save("./vault-index.json").await?;
///
///     let restored = MemoryRepository::load("./vault-index.json").await?;
///     assert_eq!(restored.block_count().await, 0);
///     Ok(())
/// }
/// ```
#[derive(Default)]
pub struct MemoryRepository {
    state: RwLock<State>,
    inserts: AtomicUsize,
}

#[derive(Default)]
struct State {
    blocks: HashMap<BlockHash, Block>,
    parts_by_hash: HashMap<BlockHash, Vec<FilePart>>,
    files: BTreeMap<PathBuf, BackupFile>,
}

impl State {
    fn index_file(&mut self, file: &BackupFile) {
        for location in &file.locations {
            for range in &location.ranges {
                let Some(part_hash) = range.part.part_hash else {
                    continue;
                };
                let parts = self.parts_by_hash.entry(part_hash).or_default();
                if !parts.contains(&range.part) {
                    parts.push(range.part.clone());
                }
            }
        }
    }
}

/// On-disk shape of a persisted repository.
#[derive(Debug, Serialize, Deserialize)]
struct Document {
    blocks: Vec<Block>,
    files: Vec<BackupFile>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a backed-up file and indexes its parts for dedup lookups.
    pub async fn add_file(&self, file: BackupFile) {
        let mut state = self.state.write().await;
        state.index_file(&file);
        state.files.insert(file.path.clone(), file);
    }

    pub async fn file(&self, path: &Path) -> Option<BackupFile> {
        self.state.read().await.files.get(path).cloned()
    }

    pub async fn files(&self) -> Vec<BackupFile> {
        self.state.read().await.files.values().cloned().collect()
    }

    pub async fn blocks(&self) -> Vec<Block> {
        let state = self.state.read().await;
        let mut blocks: Vec<Block> = state.blocks.values().cloned().collect();
        blocks.sort_by_key(|b| b.hash);
        blocks
    }

    pub async fn block_count(&self) -> usize {
        self.state.read().await.blocks.len()
    }

    /// Number of `insert_block` calls served so far.
    pub fn insert_count(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let document = {
            let state = self.state.read().await;
            let mut blocks: Vec<Block> = state.blocks.values().cloned().collect();
            blocks.sort_by_key(|b| b.hash);
            Document {
                blocks,
                files: state.files.values().cloned().collect(),
            }
        };
        let data = serde_json::to_vec_pretty(&document)?;
        fs::write(path, data).await?;
        Ok(())
    }

    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read(path).await?;
        let document: Document = serde_json::from_slice(&data)?;

        let mut state = State::default();
        for block in document.blocks {
            state.blocks.insert(block.hash, block);
        }
        for file in document.files {
            state.index_file(&file);
            state.files.insert(file.path.clone(), file);
        }
        Ok(Self {
            state: RwLock::new(state),
            inserts: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl MetadataRepository for MemoryRepository {
    async fn block_by_hash(&self, hash: &BlockHash) -> Result<Option<Block>> {
        Ok(self.state.read().await.blocks.get(hash).cloned())
    }

    async fn insert_block(&self, block: Block) -> Result<()> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        self.state.write().await.blocks.insert(block.hash, block);
        Ok(())
    }

    async fn file_parts_by_hash(&self, hash: &BlockHash) -> Result<Vec<FilePart>> {
        Ok(self
            .state
            .read()
            .await
            .parts_by_hash
            .get(hash)
            .cloned()
            .unwrap_or_default())
    }
}
