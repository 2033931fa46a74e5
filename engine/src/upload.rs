//! Upload pipeline: dedup check, per-destination encode, part fan-out and the
//! single durable insert once every part has landed.

use crate::destination::Destination;
use crate::transfer::TransferContext;
use bytes::Bytes;
use shardvault_core::crypto::Recipients;
use shardvault_core::identity::PublicIdentity;
use shardvault_core::{
    Block, BlockHash, DestinationId, Error, FormatTag, MetadataRepository, Result, StorageRecord,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// A block to be stored on a set of destinations.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub hash: BlockHash,
    pub format: FormatTag,
    pub plaintext: Bytes,
    pub destinations: Vec<DestinationId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Every required destination already held the block; nothing was sent.
    AlreadyStored,
    /// The block was durably recorded; `uploaded` lists the destinations
    /// that received new parts.
    Stored { uploaded: Vec<DestinationId> },
    Failed {
        reason: String,
        /// Destinations whose parts all succeeded.
        reached: usize,
        required: usize,
    },
}

impl UploadOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, UploadOutcome::Failed { .. })
    }
}

pub type UploadCallback = Box<dyn FnOnce(UploadOutcome) + Send + 'static>;

/// Counting join over a dynamically growing set of part uploads.
///
/// `schedule` is called before each transfer starts and `complete` when it
/// ends; `mark_ready` is called once nothing more will be scheduled. The gate
/// fires exactly once, from whichever of `complete` or `mark_ready` observes
/// "ready and nothing outstanding".
pub struct CompletionGate {
    outstanding: AtomicUsize,
    ready: AtomicBool,
    failed: AtomicBool,
    fired: AtomicBool,
    notify: Mutex<Option<oneshot::Sender<bool>>>,
}

impl CompletionGate {
    /// Returns the gate and a receiver resolving to `true` when every
    /// scheduled completion succeeded.
    pub fn new() -> (Arc<Self>, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        let gate = Arc::new(Self {
            outstanding: AtomicUsize::new(0),
            ready: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            fired: AtomicBool::new(false),
            notify: Mutex::new(Some(tx)),
        });
        (gate, rx)
    }

    pub fn schedule(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    pub fn complete(&self, ok: bool) {
        if !ok {
            self.failed.store(true, Ordering::SeqCst);
        }
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 && self.ready.load(Ordering::SeqCst) {
            self.fire();
        }
    }

    /// Marks the join as failed without a pending completion, e.g. when
    /// encoding for a destination fails.
    pub fn fail(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
        if self.outstanding.load(Ordering::SeqCst) == 0 {
            self.fire();
        }
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    fn fire(&self) {
        if self
            .fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let sender = self.notify.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(sender) = sender {
            let _ = sender.send(!self.failed.load(Ordering::SeqCst));
        }
    }
}

/// Shares the caller's plaintext between destination encodes and drops the
/// pipeline's reference once the last encode has started.
struct PlaintextLease {
    data: Mutex<Option<Bytes>>,
    remaining: AtomicUsize,
}

impl PlaintextLease {
    fn new(data: Bytes, users: usize) -> Self {
        Self {
            data: Mutex::new(Some(data)),
            remaining: AtomicUsize::new(users),
        }
    }

    fn take(&self) -> Option<Bytes> {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            data.take()
        } else {
            data.clone()
        }
    }

    #[cfg(test)]
    fn is_released(&self) -> bool {
        self.data.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }
}

/// What the dedup check decided for one request.
enum Plan {
    Done,
    Upload {
        /// Same-format block already on record; its records carry forward
        /// except those of destinations re-encoded now.
        existing: Option<Block>,
        /// Required destinations that already hold a reusable record.
        covered: usize,
        needed: Vec<Arc<Destination>>,
    },
}

/// Part keys collected for one destination while its uploads run.
struct PendingRecord {
    record: Mutex<StorageRecord>,
    succeeded: AtomicUsize,
}

pub struct Uploader {
    repo: Arc<dyn MetadataRepository>,
    destinations: BTreeMap<DestinationId, Arc<Destination>>,
    transfer: TransferContext,
    owner: PublicIdentity,
    shares: Arc<Vec<PublicIdentity>>,
}

impl Uploader {
    pub fn new(
        repo: Arc<dyn MetadataRepository>,
        destinations: BTreeMap<DestinationId, Arc<Destination>>,
        transfer: TransferContext,
        owner: PublicIdentity,
        shares: Vec<PublicIdentity>,
    ) -> Self {
        Self {
            repo,
            destinations,
            transfer,
            owner,
            shares: Arc::new(shares),
        }
    }

    /// Starts storing a block and returns immediately; `callback` receives
    /// the outcome exactly once. Errors never escape except through it.
    pub fn upload(self: &Arc<Self>, request: UploadRequest, callback: UploadCallback) {
        let uploader = Arc::clone(self);
        tokio::spawn(async move {
            let hash = request.hash;
            let required = request.destinations.len();
            let outcome = match uploader.run(request).await {
                Ok(outcome) => outcome,
                Err(e) => UploadOutcome::Failed {
                    reason: e.to_string(),
                    reached: 0,
                    required,
                },
            };
            if let UploadOutcome::Failed { reason, reached, required } = &outcome {
                warn!(
                    block = %hash.short_string(),
                    reached,
                    required,
                    reason = %reason,
                    "Block upload failed"
                );
            }
            callback(outcome);
        });
    }

    pub async fn upload_and_wait(self: &Arc<Self>, request: UploadRequest) -> UploadOutcome {
        let required = request.destinations.len();
        let (tx, rx) = oneshot::channel();
        self.upload(
            request,
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        );
        rx.await.unwrap_or_else(|_| UploadOutcome::Failed {
            reason: "upload task ended without reporting".to_string(),
            reached: 0,
            required,
        })
    }

    async fn plan(&self, request: &UploadRequest) -> Result<Plan> {
        let mut required = BTreeSet::new();
        for id in &request.destinations {
            if !self.destinations.contains_key(id) {
                return Err(Error::Configuration(format!("unknown destination '{}'", id)));
            }
            required.insert(id.clone());
        }

        let mut existing = None;
        let mut covered = BTreeSet::new();
        if let Some(block) = self.repo.block_by_hash(&request.hash).await? {
            if block.format == request.format {
                for record in &block.storage {
                    if !required.contains(&record.destination) {
                        continue;
                    }
                    if let Some(destination) = self.destinations.get(&record.destination) {
                        if self.is_reusable(destination, record) {
                            covered.insert(record.destination.clone());
                        }
                    }
                }
                existing = Some(block);
            } else {
                info!(
                    block = %request.hash.short_string(),
                    stored = %block.format,
                    requested = %request.format,
                    "Stored block has a different format, re-encoding for every destination"
                );
                // Foreign-format copies cannot be reused; the still-configured
                // destinations they covered are rebuilt in the new format.
                for record in &block.storage {
                    if self.destinations.contains_key(&record.destination) {
                        required.insert(record.destination.clone());
                    }
                }
            }
        }

        let needed: Vec<Arc<Destination>> = required
            .iter()
            .filter(|id| !covered.contains(*id))
            .filter_map(|id| self.destinations.get(id).cloned())
            .collect();
        if needed.is_empty() {
            return Ok(Plan::Done);
        }
        Ok(Plan::Upload {
            existing,
            covered: covered.len(),
            needed,
        })
    }

    fn is_reusable(&self, destination: &Destination, record: &StorageRecord) -> bool {
        let encryptor = destination.encryptor();
        record.encryption == encryptor.algorithm()
            && encryptor.is_valid(&record.encryption_metadata)
            && !record.part_keys.is_empty()
    }

    async fn run(&self, request: UploadRequest) -> Result<UploadOutcome> {
        let plan = self.plan(&request).await?;
        let UploadRequest { hash, format, plaintext, .. } = request;
        let (existing, covered, needed) = match plan {
            Plan::Done => {
                debug!(block = %hash.short_string(), "Block already stored on every destination");
                return Ok(UploadOutcome::AlreadyStored);
            }
            Plan::Upload { existing, covered, needed } => (existing, covered, needed),
        };
        let required = covered + needed.len();

        let shutdown = self.transfer.shutdown().clone();
        let (gate, finished) = CompletionGate::new();
        let lease = PlaintextLease::new(plaintext, needed.len());
        let mut pending = Vec::with_capacity(needed.len());
        let mut setup_error = None;

        for destination in &needed {
            if shutdown.is_requested() {
                setup_error = Some(Error::ShutdownRequested);
                gate.fail();
                break;
            }
            let Some(plaintext) = lease.take() else {
                gate.fail();
                break;
            };
            let (record, parts) = match self.encode(destination, &plaintext) {
                Ok(encoded) => encoded,
                Err(e) => {
                    warn!(
                        block = %hash.short_string(),
                        destination = destination.id(),
                        error = %e,
                        "Failed to encode block for destination"
                    );
                    setup_error = Some(e);
                    gate.fail();
                    break;
                }
            };
            drop(plaintext);

            let entry = Arc::new(PendingRecord {
                record: Mutex::new(record),
                succeeded: AtomicUsize::new(0),
            });
            pending.push((Arc::clone(destination), Arc::clone(&entry)));

            for (index, part) in parts.into_iter().enumerate() {
                let key = part_key(&hash, destination.id(), index);
                gate.schedule();
                let gate = Arc::clone(&gate);
                let entry = Arc::clone(&entry);
                let destination = Arc::clone(destination);
                let transfer = self.transfer.clone();
                tokio::spawn(async move {
                    let result = transfer.upload(&destination, &key, part).await;
                    let ok = match result {
                        Ok(actual_key) => {
                            let mut record = entry.record.lock().unwrap_or_else(|e| e.into_inner());
                            record.part_keys[index] = actual_key;
                            entry.succeeded.fetch_add(1, Ordering::SeqCst);
                            true
                        }
                        Err(e) => {
                            debug!(
                                destination = destination.id(),
                                part = index,
                                error = %e,
                                "Part upload failed"
                            );
                            false
                        }
                    };
                    gate.complete(ok);
                });
            }
        }
        gate.mark_ready();

        let all_ok = tokio::select! {
            result = finished => result.unwrap_or(false),
            _ = shutdown.cancelled() => false,
        };

        let mut reached = covered;
        let mut uploaded = Vec::new();
        let mut records = Vec::with_capacity(pending.len());
        for (destination, entry) in &pending {
            let record = entry.record.lock().unwrap_or_else(|e| e.into_inner()).clone();
            if entry.succeeded.load(Ordering::SeqCst) == record.part_count() {
                reached += 1;
            }
            uploaded.push(destination.id().to_string());
            records.push(record);
        }

        if !all_ok || setup_error.is_some() {
            let reason = match setup_error {
                Some(e) => e.to_string(),
                None if shutdown.is_requested() => Error::ShutdownRequested.to_string(),
                None => "one or more parts failed to upload".to_string(),
            };
            return Ok(UploadOutcome::Failed { reason, reached, required });
        }

        let mut block = existing.unwrap_or_else(|| Block::new(hash, format));
        block
            .storage
            .retain(|record| !uploaded.contains(&record.destination));
        block.storage.extend(records);
        self.repo.insert_block(block).await?;
        debug!(
            block = %hash.short_string(),
            destinations = ?uploaded,
            "Block finalized"
        );
        Ok(UploadOutcome::Stored { uploaded })
    }

    /// Encrypts and erasure-codes `plaintext` for one destination. The
    /// returned record has a placeholder key per part.
    fn encode(&self, destination: &Destination, plaintext: &[u8]) -> Result<(StorageRecord, Vec<Bytes>)> {
        let encryptor = destination.encryptor();
        let corrector = destination.corrector();
        let mut record =
            StorageRecord::new(destination.id(), encryptor.algorithm(), corrector.algorithm());

        let recipients = Recipients::new(&self.owner, &self.shares);
        let ciphertext = encryptor.encrypt(&mut record.encryption_metadata, plaintext, recipients)?;
        let parts = corrector.encode(&mut record.error_correction_metadata, &ciphertext)?;
        record.part_keys = vec![String::new(); parts.len()];
        Ok((record, parts))
    }
}

/// Suggested object key for one part. The random suffix keeps concurrent
/// redundant uploads of the same block from overwriting each other.
pub fn part_key(hash: &BlockHash, destination: &str, index: usize) -> String {
    let hex = hash.to_hex();
    format!(
        "{}/{}-{}-{}-{}",
        &hex[..2],
        hex,
        destination,
        index,
        uuid::Uuid::new_v4().simple()
    )
}
