//! Download pipeline: fetch a sufficient subset of a storage record's parts,
//! decode, decrypt, and fall back to the next record when a copy is unusable.

use crate::destination::Destination;
use crate::transfer::TransferContext;
use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use shardvault_core::crypto::EncryptorRegistry;
use shardvault_core::ecc::{EccRegistry, ErrorCorrector};
use shardvault_core::identity::Identity;
use shardvault_core::{
    Block, BlockHash, DestinationId, Error, FormatTag, MetadataRepository, Result, StorageRecord,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, warn};

/// Counters describing how much trouble reconstruction ran into.
#[derive(Debug, Default)]
pub struct DownloadStats {
    blocks: AtomicU64,
    bytes: AtomicU64,
    fallbacks: AtomicU64,
    corrupt_parts: AtomicU64,
    failed_fetches: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadStatsSnapshot {
    pub blocks: u64,
    pub bytes: u64,
    pub fallbacks: u64,
    pub corrupt_parts: u64,
    pub failed_fetches: u64,
}

impl DownloadStats {
    pub fn snapshot(&self) -> DownloadStatsSnapshot {
        DownloadStatsSnapshot {
            blocks: self.blocks.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            corrupt_parts: self.corrupt_parts.load(Ordering::Relaxed),
            failed_fetches: self.failed_fetches.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadedBlock {
    pub hash: BlockHash,
    pub format: FormatTag,
    pub payload: Bytes,
}

pub struct Downloader {
    repo: Arc<dyn MetadataRepository>,
    destinations: BTreeMap<DestinationId, Arc<Destination>>,
    transfer: TransferContext,
    identity: Arc<Identity>,
    encryptors: EncryptorRegistry,
    correctors: EccRegistry,
    stats: DownloadStats,
}

impl Downloader {
    pub fn new(
        repo: Arc<dyn MetadataRepository>,
        destinations: BTreeMap<DestinationId, Arc<Destination>>,
        transfer: TransferContext,
        identity: Arc<Identity>,
    ) -> Self {
        Self {
            repo,
            destinations,
            transfer,
            identity,
            encryptors: EncryptorRegistry::builtin(),
            correctors: EccRegistry::builtin(),
            stats: DownloadStats::default(),
        }
    }

    pub fn stats(&self) -> DownloadStatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn download(&self, hash: &BlockHash) -> Result<DownloadedBlock> {
        let block = self
            .repo
            .block_by_hash(hash)
            .await?
            .ok_or_else(|| Error::BlockNotFound { hash: hash.to_hex() })?;
        self.download_block(&block).await
    }

    /// Tries every storage record of `block` in stored order and returns the
    /// first fully verified plaintext.
    pub async fn download_block(&self, block: &Block) -> Result<DownloadedBlock> {
        let shutdown = self.transfer.shutdown();
        let mut last_error = None;

        for (position, record) in block.storage.iter().enumerate() {
            shutdown.check()?;
            let error = match self.read_record(block, record).await {
                Ok(payload) => {
                    self.stats.blocks.fetch_add(1, Ordering::Relaxed);
                    self.stats.bytes.fetch_add(payload.len() as u64, Ordering::Relaxed);
                    return Ok(DownloadedBlock {
                        hash: block.hash,
                        format: block.format,
                        payload,
                    });
                }
                Err(Error::ShutdownRequested) => return Err(Error::ShutdownRequested),
                Err(e) => e,
            };

            if position + 1 < block.storage.len() {
                self.stats.fallbacks.fetch_add(1, Ordering::Relaxed);
                warn!(
                    block = %block.hash.short_string(),
                    destination = %record.destination,
                    error = %error,
                    "Storage record unusable, falling back to next copy"
                );
            }
            last_error = Some(error);
        }

        let error = last_error.unwrap_or_else(|| Error::CorruptBlockStorage {
            hash: block.hash.to_hex(),
            reason: "block has no storage records".to_string(),
        });
        error!(
            block = %block.hash.short_string(),
            copies = block.storage.len(),
            error = %error,
            "Block could not be reconstructed from any copy"
        );
        Err(error)
    }

    async fn read_record(&self, block: &Block, record: &StorageRecord) -> Result<Bytes> {
        let destination = self.destinations.get(&record.destination).ok_or_else(|| {
            Error::Configuration(format!(
                "storage record references unconfigured destination '{}'",
                record.destination
            ))
        })?;
        let encryptor = self.encryptors.resolve(&record.encryption, false)?;
        let corrector = self.correctors.for_record(&record.error_correction)?;

        let parts = self.fetch_parts(destination, record, corrector.as_ref()).await?;
        let ciphertext = corrector.decode(&record.error_correction_metadata, parts)?;
        let plaintext = encryptor.decrypt(&record.encryption_metadata, &ciphertext, &self.identity)?;

        if BlockHash::from_data(&plaintext) != block.hash {
            return Err(Error::CorruptBlockStorage {
                hash: block.hash.to_hex(),
                reason: format!("decoded content from '{}' does not match its hash", record.destination),
            });
        }
        Ok(Bytes::from(plaintext))
    }

    /// Fetches parts until the corrector's minimum is met. Parts that fail to
    /// download or verify leave a hole and pull in the next unfetched part.
    async fn fetch_parts(
        &self,
        destination: &Destination,
        record: &StorageRecord,
        corrector: &dyn ErrorCorrector,
    ) -> Result<Vec<Option<Bytes>>> {
        let metadata = &record.error_correction_metadata;
        let total = record.part_keys.len();
        let required = corrector.minimum_sufficient_parts(metadata, total)?;
        if required > total {
            return Err(Error::InsufficientParts {
                available: total,
                required,
            });
        }

        let shutdown = self.transfer.shutdown();
        let mut parts: Vec<Option<Bytes>> = vec![None; total];
        let mut in_flight = FuturesUnordered::new();
        let fetch = |index: usize| async move {
            let result = self.transfer.download(destination, &record.part_keys[index]).await;
            (index, result)
        };
        for index in 0..required {
            in_flight.push(fetch(index));
        }
        let mut next = required;
        let mut fetched = 0;

        while fetched < required {
            let (index, result) = tokio::select! {
                completed = in_flight.next() => match completed {
                    Some(completed) => completed,
                    None => break,
                },
                _ = shutdown.cancelled() => return Err(Error::ShutdownRequested),
            };
            match result {
                Ok(data) if corrector.verify_part(metadata, &data) => {
                    parts[index] = Some(data);
                    fetched += 1;
                    continue;
                }
                Ok(_) => {
                    self.stats.corrupt_parts.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        destination = destination.id(),
                        error = %Error::CorruptPart { index },
                        "Part failed verification, treating as missing"
                    );
                }
                Err(Error::ShutdownRequested) => return Err(Error::ShutdownRequested),
                Err(e) => {
                    self.stats.failed_fetches.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        destination = destination.id(),
                        part = index,
                        error = %e,
                        "Part fetch failed, treating as missing"
                    );
                }
            }
            if next < total {
                in_flight.push(fetch(next));
                next += 1;
            }
        }
        Ok(parts)
    }
}
