use crate::config::AssignmentSettings;
use crate::format::{self, ArchiveBuilder};
use crate::repository::MetadataRepository;
use crate::types::{BackupFile, BlockHash, FileLocation, FilePart, FileRange, FormatTag};
use crate::Result;
use bytes::Bytes;
use fastcdc::v2020::FastCDC;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

/// A file's bytes as handed over by the scanner.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    /// Modification time in milliseconds since the epoch.
    pub modified: i64,
    pub data: Bytes,
}

/// A block that still has to go through the upload pipeline.
#[derive(Debug, Clone)]
pub struct PendingBlock {
    pub hash: BlockHash,
    pub format: FormatTag,
    pub payload: Bytes,
}

impl PendingBlock {
    fn new(format: FormatTag, payload: Bytes) -> Self {
        Self {
            hash: BlockHash::from_data(&payload),
            format,
            payload,
        }
    }
}

#[derive(Debug, Default)]
pub struct Assignment {
    /// New blocks in the order they should be uploaded; chain sub-blocks
    /// precede the chain that lists them.
    pub blocks: Vec<PendingBlock>,
    pub files: Vec<BackupFile>,
}

/// Where a range's content lives while the batch is being assembled.
enum Slot {
    Ready(FilePart),
    Archive { archive: usize, entry: u32, part_hash: BlockHash },
}

struct PendingRange {
    offset: u64,
    length: u64,
    slot: Slot,
}

/// Groups file bytes into blocks.
///
/// - files of at least `raw_threshold` bytes become fixed-size raw chunks, and
///   when there are more than `chain_threshold` of them a chain block lists them
/// - files up to `small_file_limit` are bin-packed into archive blocks
/// - everything in between is cut into content-defined chunks and compressed
///
/// Every slice is looked up by content hash first; a known slice reuses the
/// existing file part instead of producing a new block.
pub struct BlockAssigner {
    settings: AssignmentSettings,
}

impl BlockAssigner {
    pub fn new(settings: AssignmentSettings) -> Self {
        Self { settings }
    }

    pub async fn assign(
        &self,
        repo: &dyn MetadataRepository,
        sources: Vec<SourceFile>,
    ) -> Result<Assignment> {
        let mut batch = Batch::default();
        let mut pending_files = Vec::with_capacity(sources.len());

        for source in sources {
            let length = source.data.len() as u64;
            let ranges = if length == 0 {
                Vec::new()
            } else if length <= self.settings.small_file_limit {
                self.assign_small(repo, &mut batch, &source.data).await?
            } else if length >= self.settings.raw_threshold {
                self.assign_raw(repo, &mut batch, &source.data).await?
            } else {
                self.assign_compressed(repo, &mut batch, &source.data).await?
            };
            pending_files.push((source.path, length, source.modified, ranges));
        }

        batch.seal_archive()?;
        let archives = std::mem::take(&mut batch.sealed_archives);
        let archive_hashes: Vec<BlockHash> = archives.iter().map(|b| b.hash).collect();
        batch.blocks.extend(archives);

        let files = pending_files
            .into_iter()
            .map(|(path, length, modified, ranges)| BackupFile {
                path,
                length,
                modified,
                locations: vec![FileLocation {
                    ranges: ranges
                        .into_iter()
                        .map(|range| FileRange {
                            offset: range.offset,
                            length: range.length,
                            part: match range.slot {
                                Slot::Ready(part) => part,
                                Slot::Archive { archive, entry, part_hash } => FilePart {
                                    block_hash: archive_hashes[archive],
                                    index: entry,
                                    part_hash: Some(part_hash),
                                },
                            },
                        })
                        .collect(),
                }],
            })
            .collect();

        debug!(
            blocks = batch.blocks.len(),
            reused = batch.reused,
            "Assigned file contents to blocks"
        );
        Ok(Assignment {
            blocks: batch.blocks,
            files,
        })
    }

    async fn assign_small(
        &self,
        repo: &dyn MetadataRepository,
        batch: &mut Batch,
        data: &Bytes,
    ) -> Result<Vec<PendingRange>> {
        let part_hash = BlockHash::from_data(data);
        let length = data.len() as u64;

        if let Some(slot) = batch.lookup(repo, &part_hash).await? {
            return Ok(vec![PendingRange { offset: 0, length, slot }]);
        }

        if batch.archive.is_full(self.settings.archive_target_size) {
            batch.seal_archive()?;
        }
        let entry = batch.archive.push(data);
        let archive = batch.sealed_archives.len();
        batch.archive_slots.insert(part_hash, (archive, entry));
        Ok(vec![PendingRange {
            offset: 0,
            length,
            slot: Slot::Archive { archive, entry, part_hash },
        }])
    }

    async fn assign_compressed(
        &self,
        repo: &dyn MetadataRepository,
        batch: &mut Batch,
        data: &Bytes,
    ) -> Result<Vec<PendingRange>> {
        let (min, avg, max) = self.settings.cdc_sizes()?;
        let chunker = FastCDC::new(data, min, avg, max);
        let mut ranges = Vec::new();
        for chunk in chunker {
            let slice = data.slice(chunk.offset..chunk.offset + chunk.length);
            let part_hash = BlockHash::from_data(&slice);
            let slot = match batch.lookup(repo, &part_hash).await? {
                Some(slot) => slot,
                None => {
                    let compressed = format::compress(&slice)?;
                    let block = if compressed.len() < slice.len() {
                        PendingBlock::new(FormatTag::Compressed, Bytes::from(compressed))
                    } else {
                        PendingBlock::new(FormatTag::Raw, slice)
                    };
                    batch.add(block, part_hash)
                }
            };
            ranges.push(PendingRange {
                offset: chunk.offset as u64,
                length: chunk.length as u64,
                slot,
            });
        }
        Ok(ranges)
    }

    async fn assign_raw(
        &self,
        repo: &dyn MetadataRepository,
        batch: &mut Batch,
        data: &Bytes,
    ) -> Result<Vec<PendingRange>> {
        let chunk_size = self.settings.raw_chunk_size;
        let chunk_count = data.len().div_ceil(chunk_size);

        if chunk_count > self.settings.chain_threshold {
            let part_hash = BlockHash::from_data(data);
            if let Some(slot) = batch.lookup(repo, &part_hash).await? {
                return Ok(vec![PendingRange {
                    offset: 0,
                    length: data.len() as u64,
                    slot,
                }]);
            }

            let mut hashes = Vec::with_capacity(chunk_count);
            for start in (0..data.len()).step_by(chunk_size) {
                let end = (start + chunk_size).min(data.len());
                let block = PendingBlock::new(FormatTag::Raw, data.slice(start..end));
                hashes.push(block.hash);
                batch.blocks.push(block);
            }
            let chain = PendingBlock::new(FormatTag::Chain, Bytes::from(format::encode_chain(&hashes)?));
            let slot = batch.add(chain, part_hash);
            return Ok(vec![PendingRange {
                offset: 0,
                length: data.len() as u64,
                slot,
            }]);
        }

        let mut ranges = Vec::with_capacity(chunk_count);
        for start in (0..data.len()).step_by(chunk_size) {
            let end = (start + chunk_size).min(data.len());
            let slice = data.slice(start..end);
            let part_hash = BlockHash::from_data(&slice);
            let slot = match batch.lookup(repo, &part_hash).await? {
                Some(slot) => slot,
                None => batch.add(PendingBlock::new(FormatTag::Raw, slice), part_hash),
            };
            ranges.push(PendingRange {
                offset: start as u64,
                length: (end - start) as u64,
                slot,
            });
        }
        Ok(ranges)
    }
}

#[derive(Default)]
struct Batch {
    blocks: Vec<PendingBlock>,
    known: HashMap<BlockHash, FilePart>,
    archive: ArchiveBuilder,
    sealed_archives: Vec<PendingBlock>,
    archive_slots: HashMap<BlockHash, (usize, u32)>,
    reused: usize,
}

impl Batch {
    async fn lookup(
        &mut self,
        repo: &dyn MetadataRepository,
        part_hash: &BlockHash,
    ) -> Result<Option<Slot>> {
        if let Some(part) = self.known.get(part_hash) {
            return Ok(Some(Slot::Ready(part.clone())));
        }
        if let Some((archive, entry)) = self.archive_slots.get(part_hash) {
            return Ok(Some(Slot::Archive {
                archive: *archive,
                entry: *entry,
                part_hash: *part_hash,
            }));
        }
        if let Some(part) = repo.file_parts_by_hash(part_hash).await?.into_iter().next() {
            self.reused += 1;
            self.known.insert(*part_hash, part.clone());
            return Ok(Some(Slot::Ready(part)));
        }
        Ok(None)
    }

    fn add(&mut self, block: PendingBlock, part_hash: BlockHash) -> Slot {
        let part = FilePart {
            block_hash: block.hash,
            index: 0,
            part_hash: Some(part_hash),
        };
        self.known.insert(part_hash, part.clone());
        self.blocks.push(block);
        Slot::Ready(part)
    }

    /// Closes the open archive; its index is its position in `sealed_archives`.
    fn seal_archive(&mut self) -> Result<()> {
        if !self.archive.is_empty() {
            let builder = std::mem::take(&mut self.archive);
            let payload = Bytes::from(builder.finish()?);
            self.sealed_archives
                .push(PendingBlock::new(FormatTag::Archived, payload));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryRepository;

    fn settings() -> AssignmentSettings {
        AssignmentSettings {
            raw_threshold: 64 * 1024,
            raw_chunk_size: 16 * 1024,
            compressed_avg_chunk: 1024,
            small_file_limit: 256,
            archive_target_size: 600,
            chain_threshold: 8,
        }
    }

    fn source(path: &str, data: Vec<u8>) -> SourceFile {
        SourceFile {
            path: PathBuf::from(path),
            modified: 0,
            data: Bytes::from(data),
        }
    }

    fn noise(len: usize, seed: u32) -> Vec<u8> {
        let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect()
    }

    fn covered(file: &BackupFile) -> u64 {
        file.locations[0].ranges.iter().map(|r| r.length).sum()
    }

    #[tokio::test]
    async fn test_small_files_are_bin_packed() {
        let repo = MemoryRepository::new();
        let assigner = BlockAssigner::new(settings());
        let sources = (0..5).map(|i| source(&format!("f{i}"), noise(200, i))).collect();

        let assignment = assigner.assign(&repo, sources).await.unwrap();
        assert!(assignment.blocks.iter().all(|b| b.format == FormatTag::Archived));
        // 600-byte target: three 200-byte entries fill the first archive.
        assert_eq!(assignment.blocks.len(), 2);

        let first = &assignment.files[0].locations[0].ranges[0].part;
        let fourth = &assignment.files[3].locations[0].ranges[0].part;
        assert_eq!(first.block_hash, assignment.blocks[0].hash);
        assert_eq!(fourth.block_hash, assignment.blocks[1].hash);
        assert_eq!(fourth.index, 0);

        let payload = assignment.blocks[0].payload.clone();
        let entry = format::extract(FormatTag::Archived, payload, 2).unwrap();
        assert_eq!(&entry[..], &noise(200, 2)[..]);
    }

    #[tokio::test]
    async fn test_medium_file_compressed_chunks_cover_file() {
        let repo = MemoryRepository::new();
        let assigner = BlockAssigner::new(settings());
        let data = b"the quick brown fox jumps over the lazy dog. ".repeat(400);

        let assignment = assigner
            .assign(&repo, vec![source("text", data.clone())])
            .await
            .unwrap();
        let file = &assignment.files[0];
        assert_eq!(file.length, data.len() as u64);
        assert_eq!(covered(file), data.len() as u64);
        assert!(assignment.blocks.iter().any(|b| b.format == FormatTag::Compressed));
    }

    #[tokio::test]
    async fn test_large_file_raw_chunks_and_chain() {
        let repo = MemoryRepository::new();
        let assigner = BlockAssigner::new(settings());

        let raw = noise(100 * 1024, 1);
        let chained = noise(200 * 1024, 2);
        let assignment = assigner
            .assign(&repo, vec![source("raw", raw), source("chained", chained)])
            .await
            .unwrap();

        assert_eq!(assignment.files[0].locations[0].ranges.len(), 7);
        assert_eq!(covered(&assignment.files[0]), 100 * 1024);

        let chain_range = &assignment.files[1].locations[0].ranges;
        assert_eq!(chain_range.len(), 1);
        let chain = assignment.blocks.last().unwrap();
        assert_eq!(chain.format, FormatTag::Chain);
        assert_eq!(chain_range[0].part.block_hash, chain.hash);
        let listed = format::decode_chain(&chain.payload).unwrap();
        assert_eq!(listed.len(), 13);
        assert!(listed
            .iter()
            .all(|h| assignment.blocks.iter().any(|b| b.hash == *h)));
    }

    #[tokio::test]
    async fn test_known_content_is_reused() {
        let repo = MemoryRepository::new();
        let assigner = BlockAssigner::new(settings());
        let data = noise(100 * 1024, 7);

        let first = assigner
            .assign(&repo, vec![source("a", data.clone())])
            .await
            .unwrap();
        for file in first.files.clone() {
            repo.add_file(file).await;
        }

        let second = assigner
            .assign(&repo, vec![source("b", data), source("c", noise(100, 3)), source("d", noise(100, 3))])
            .await
            .unwrap();
        // Only the single archive holding "c" is new; "d" duplicates "c".
        assert_eq!(second.blocks.len(), 1);
        assert_eq!(
            second.files[0].locations[0].ranges,
            first.files[0].locations[0].ranges
        );
        assert_eq!(
            second.files[1].locations[0].ranges[0].part,
            second.files[2].locations[0].ranges[0].part
        );
    }

    #[tokio::test]
    async fn test_empty_file_has_no_ranges() {
        let repo = MemoryRepository::new();
        let assignment = BlockAssigner::new(settings())
            .assign(&repo, vec![source("empty", Vec::new())])
            .await
            .unwrap();
        assert!(assignment.blocks.is_empty());
        assert!(assignment.files[0].locations[0].ranges.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_average_chunk_is_rejected() {
        let repo = MemoryRepository::new();
        let mut settings = settings();
        settings.compressed_avg_chunk = 8 * 1024 * 1024;
        let result = BlockAssigner::new(settings)
            .assign(&repo, vec![source("medium", noise(4 * 1024, 3))])
            .await;
        assert!(matches!(result, Err(crate::Error::Configuration(_))));
    }
}
