use crate::limiter::BandwidthLimits;
use shardvault_backends::Backend;
use shardvault_core::config::{DestinationConfig, VaultConfig};
use shardvault_core::crypto::{BlockEncryptor, EncryptorRegistry};
use shardvault_core::ecc::{EccRegistry, ErrorCorrector};
use shardvault_core::{DestinationId, Result};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// A configured storage target: where parts go and how they are produced.
pub struct Destination {
    id: DestinationId,
    backend: Arc<dyn Backend>,
    encryptor: Arc<dyn BlockEncryptor>,
    corrector: Arc<dyn ErrorCorrector>,
    connections: Arc<Semaphore>,
    limits: BandwidthLimits,
}

impl Destination {
    pub fn new(
        id: impl Into<DestinationId>,
        backend: Arc<dyn Backend>,
        encryptor: Arc<dyn BlockEncryptor>,
        corrector: Arc<dyn ErrorCorrector>,
        max_connections: usize,
        limits: BandwidthLimits,
    ) -> Self {
        Self {
            id: id.into(),
            backend,
            encryptor,
            corrector,
            connections: Arc::new(Semaphore::new(max_connections.max(1))),
            limits,
        }
    }

    /// Resolves the destination's algorithms through the registries; unknown
    /// identifiers fail here rather than during a transfer.
    pub fn from_config(
        id: &str,
        config: &DestinationConfig,
        vault: &VaultConfig,
        backend: Arc<dyn Backend>,
        encryptors: &EncryptorRegistry,
        correctors: &EccRegistry,
    ) -> Result<Self> {
        let encryptor = encryptors.resolve(&config.encryption, vault.stable_for(id))?;
        let corrector = correctors.resolve(&config.error_correction, vault.max_part_size)?;
        let limits = BandwidthLimits::new(config.upload_limit, config.download_limit)?;
        Ok(Self::new(
            id,
            backend,
            encryptor,
            corrector,
            config.max_connections,
            limits,
        ))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn encryptor(&self) -> &Arc<dyn BlockEncryptor> {
        &self.encryptor
    }

    pub fn corrector(&self) -> &Arc<dyn ErrorCorrector> {
        &self.corrector
    }

    pub fn connections(&self) -> &Arc<Semaphore> {
        &self.connections
    }

    pub fn limits(&self) -> &BandwidthLimits {
        &self.limits
    }
}

impl std::fmt::Debug for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Destination")
            .field("id", &self.id)
            .field("backend", &self.backend.backend_type())
            .field("encryption", &self.encryptor.algorithm())
            .field("error_correction", &self.corrector.algorithm())
            .finish()
    }
}
