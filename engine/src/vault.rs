use crate::destination::Destination;
use crate::download::{DownloadStatsSnapshot, DownloadedBlock, Downloader};
use crate::limiter::BandwidthLimits;
use crate::progress::{FileProgress, ProgressTracker};
use crate::restore::{FileRestorer, RestoreTarget};
use crate::transfer::TransferContext;
use crate::upload::{UploadOutcome, UploadRequest, Uploader};
use futures::future::join_all;
use shardvault_backends::{Backend, ConnectivityGuard, ConnectivityProbe, RetryConfig};
use shardvault_core::chunker::{BlockAssigner, SourceFile};
use shardvault_core::crypto::EncryptorRegistry;
use shardvault_core::ecc::EccRegistry;
use shardvault_core::identity::{Identity, PublicIdentity};
use shardvault_core::{
    BackupFile, BlockHash, DestinationId, Error, MetadataRepository, Result, Shutdown, VaultConfig,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Entry point wiring configuration, destinations and both pipelines.
///
/// # Examples
///
/// ```no_run
/// use shardvault_backends::{AlwaysOnline, Backend, LocalBackend};
/// use shardvault_core::{Identity, MemoryRepository, Shutdown, VaultConfig};
/// use shardvault_engine::BlockVault;
/// use std::collections::HashMap;
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> shardvault_core::Result<()> {
///     let config = VaultConfig::load("vault.toml").await?;
///     let mut backends: HashMap<String, Arc<dyn Backend>> = HashMap::new();
///     backends.insert("local".to_string(), Arc::new(LocalBackend::new("/srv/backup")));
///
///     let vault = BlockVault::new(
///         config,
///         backends,
///         Arc::new(MemoryRepository::new()),
///         Arc::new(Identity::generate()?),
///         Shutdown::new(),
///         Arc::new(AlwaysOnline),
///     )?;
///     vault.init().await?;
///     Ok(())
/// }
/// ```
pub struct BlockVault {
    config: VaultConfig,
    repo: Arc<dyn MetadataRepository>,
    destinations: BTreeMap<DestinationId, Arc<Destination>>,
    uploader: Arc<Uploader>,
    downloader: Arc<Downloader>,
    restorer: FileRestorer,
    progress: Arc<ProgressTracker>,
    shutdown: Shutdown,
}

impl BlockVault {
    pub fn new(
        config: VaultConfig,
        backends: HashMap<DestinationId, Arc<dyn Backend>>,
        repo: Arc<dyn MetadataRepository>,
        identity: Arc<Identity>,
        shutdown: Shutdown,
        probe: Arc<dyn ConnectivityProbe>,
    ) -> Result<Self> {
        config.validate()?;

        let encryptors = EncryptorRegistry::builtin();
        let correctors = EccRegistry::builtin();
        let mut destinations = BTreeMap::new();
        for (id, destination) in &config.destinations {
            let backend = backends.get(id).cloned().ok_or_else(|| {
                Error::Configuration(format!("no backend supplied for destination '{}'", id))
            })?;
            let destination =
                Destination::from_config(id, destination, &config, backend, &encryptors, &correctors)?;
            destinations.insert(id.clone(), Arc::new(destination));
        }

        let shares = config
            .share_keys
            .iter()
            .map(|encoded| PublicIdentity::decode(encoded))
            .collect::<Result<Vec<_>>>()?;

        let guard = ConnectivityGuard::new(
            probe,
            Duration::from_millis(config.connectivity.poll_interval_ms),
            shutdown.clone(),
        );
        let retry = RetryConfig::from(&config.retry);
        let upload_transfer = TransferContext::new(
            config.workers,
            retry.clone(),
            guard.clone(),
            BandwidthLimits::new(config.upload_limit, None)?,
            shutdown.clone(),
        );
        let download_transfer = TransferContext::new(
            config.workers,
            retry,
            guard,
            BandwidthLimits::new(None, config.download_limit)?,
            shutdown.clone(),
        );

        let uploader = Arc::new(Uploader::new(
            Arc::clone(&repo),
            destinations.clone(),
            upload_transfer,
            identity.public().clone(),
            shares,
        ));
        let downloader = Arc::new(Downloader::new(
            Arc::clone(&repo),
            destinations.clone(),
            download_transfer,
            identity,
        ));
        let progress = Arc::new(ProgressTracker::new());
        let restorer = FileRestorer::new(Arc::clone(&downloader), Arc::clone(&progress), shutdown.clone());

        Ok(Self {
            config,
            repo,
            destinations,
            uploader,
            downloader,
            restorer,
            progress,
            shutdown,
        })
    }

    pub async fn init(&self) -> Result<()> {
        for destination in self.destinations.values() {
            destination.backend().init().await?;
        }
        info!(destinations = self.destinations.len(), "Block vault ready");
        Ok(())
    }

    pub fn destination_ids(&self) -> Vec<DestinationId> {
        self.destinations.keys().cloned().collect()
    }

    pub fn uploader(&self) -> &Arc<Uploader> {
        &self.uploader
    }

    pub fn downloader(&self) -> &Arc<Downloader> {
        &self.downloader
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    pub async fn upload(&self, request: UploadRequest) -> UploadOutcome {
        self.uploader.upload_and_wait(request).await
    }

    pub async fn download_block(&self, hash: &BlockHash) -> Result<DownloadedBlock> {
        self.downloader.download(hash).await
    }

    pub async fn restore_file(&self, file: &BackupFile, target: &RestoreTarget) -> Result<()> {
        self.restorer.restore(file, target).await
    }

    /// Assigns file contents to blocks, stores every new block on
    /// `destinations`, and returns the file records for the caller to persist.
    pub async fn backup_files(
        &self,
        sources: Vec<SourceFile>,
        destinations: &[DestinationId],
    ) -> Result<Vec<BackupFile>> {
        let assigner = BlockAssigner::new(self.config.assignment.clone());
        let assignment = assigner.assign(self.repo.as_ref(), sources).await?;

        let uploads = assignment.blocks.into_iter().map(|block| {
            self.uploader.upload_and_wait(UploadRequest {
                hash: block.hash,
                format: block.format,
                plaintext: block.payload,
                destinations: destinations.to_vec(),
            })
        });
        let outcomes = join_all(uploads).await;

        let failed: Vec<&UploadOutcome> = outcomes.iter().filter(|o| !o.is_success()).collect();
        if let Some(UploadOutcome::Failed { reason, .. }) = failed.first() {
            warn!(failed = failed.len(), total = outcomes.len(), "Backup left blocks unstored");
            return Err(Error::Other(format!(
                "{} of {} blocks failed to upload: {}",
                failed.len(),
                outcomes.len(),
                reason
            )));
        }
        Ok(assignment.files)
    }

    pub fn download_stats(&self) -> DownloadStatsSnapshot {
        self.downloader.stats()
    }

    pub fn progress(&self) -> Vec<FileProgress> {
        self.progress.in_flight()
    }
}
