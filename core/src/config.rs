use crate::crypto::EncryptorRegistry;
use crate::ecc::EccRegistry;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub const DEFAULT_MAX_PART_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Worker-pool size of each transfer pipeline.
    pub workers: usize,
    pub max_part_size: usize,
    /// Global upload budget in bytes per second.
    pub upload_limit: Option<u64>,
    /// Global download budget in bytes per second.
    pub download_limit: Option<u64>,
    pub stable_encryption: bool,
    /// Encoded public identities that may decrypt every new block.
    pub share_keys: Vec<String>,
    pub retry: RetrySettings,
    pub connectivity: ConnectivitySettings,
    pub assignment: AssignmentSettings,
    pub destinations: BTreeMap<String, DestinationConfig>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            max_part_size: DEFAULT_MAX_PART_SIZE,
            upload_limit: None,
            download_limit: None,
            stable_encryption: false,
            share_keys: Vec::new(),
            retry: RetrySettings::default(),
            connectivity: ConnectivitySettings::default(),
            assignment: AssignmentSettings::default(),
            destinations: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    #[serde(default = "default_encryption")]
    pub encryption: String,
    /// Overrides the vault-wide `stable_encryption` flag.
    #[serde(default)]
    pub stable_encryption: Option<bool>,
    #[serde(default)]
    pub error_correction: ErrorCorrectionConfig,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default)]
    pub upload_limit: Option<u64>,
    #[serde(default)]
    pub download_limit: Option<u64>,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            encryption: default_encryption(),
            stable_encryption: None,
            error_correction: ErrorCorrectionConfig::default(),
            max_connections: default_max_connections(),
            upload_limit: None,
            download_limit: None,
        }
    }
}

fn default_encryption() -> String {
    "xchacha20-poly1305".to_string()
}

fn default_max_connections() -> usize {
    4
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorCorrectionConfig {
    pub algorithm: String,
    pub data_shards: usize,
    pub parity_shards: usize,
}

impl Default for ErrorCorrectionConfig {
    fn default() -> Self {
        Self {
            algorithm: "none".to_string(),
            data_shards: 8,
            parity_shards: 3,
        }
    }
}

impl ErrorCorrectionConfig {
    pub fn reed_solomon(data_shards: usize, parity_shards: usize) -> Self {
        Self {
            algorithm: "reed-solomon".to_string(),
            data_shards,
            parity_shards,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivitySettings {
    pub poll_interval_ms: u64,
}

impl Default for ConnectivitySettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssignmentSettings {
    /// Files at least this large are split into raw fixed-size chunks.
    pub raw_threshold: u64,
    pub raw_chunk_size: usize,
    /// Average content-defined chunk size for compressed chunks.
    pub compressed_avg_chunk: u32,
    /// Files up to this size are bin-packed into archive blocks.
    pub small_file_limit: u64,
    pub archive_target_size: usize,
    /// Raw chunk count above which a file is stored behind a chain block.
    pub chain_threshold: usize,
}

impl Default for AssignmentSettings {
    fn default() -> Self {
        Self {
            raw_threshold: 16 * 1024 * 1024,
            raw_chunk_size: 8 * 1024 * 1024,
            compressed_avg_chunk: 1024 * 1024,
            small_file_limit: 64 * 1024,
            archive_target_size: 4 * 1024 * 1024,
            chain_threshold: 64,
        }
    }
}

impl AssignmentSettings {
    /// Minimum, average and maximum content-defined chunk sizes, checked
    /// against the limits fastcdc accepts.
    pub fn cdc_sizes(&self) -> Result<(u32, u32, u32)> {
        use fastcdc::v2020::{
            AVERAGE_MAX, AVERAGE_MIN, MAXIMUM_MAX, MAXIMUM_MIN, MINIMUM_MAX, MINIMUM_MIN,
        };

        let avg = self.compressed_avg_chunk;
        if !(AVERAGE_MIN..=AVERAGE_MAX).contains(&avg) {
            return Err(Error::Configuration(format!(
                "compressed_avg_chunk must be between {} and {}, got {}",
                AVERAGE_MIN, AVERAGE_MAX, avg
            )));
        }
        let min = avg / 4;
        let max = avg
            .checked_mul(4)
            .ok_or_else(|| Error::Configuration("compressed_avg_chunk is too large".to_string()))?;
        if !(MINIMUM_MIN..=MINIMUM_MAX).contains(&min) || !(MAXIMUM_MIN..=MAXIMUM_MAX).contains(&max) {
            return Err(Error::Configuration(format!(
                "compressed chunk bounds {}..{} are outside what the chunker supports",
                min, max
            )));
        }
        Ok((min, avg, max))
    }
}

impl VaultConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: VaultConfig =
            toml::from_str(s).map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = tokio::fs::read_to_string(path).await?;
        Self::from_toml_str(&data)
    }

    pub fn destination(&self, id: &str) -> Result<&DestinationConfig> {
        self.destinations
            .get(id)
            .ok_or_else(|| Error::Configuration(format!("unknown destination '{}'", id)))
    }

    pub fn stable_for(&self, id: &str) -> bool {
        self.destinations
            .get(id)
            .and_then(|d| d.stable_encryption)
            .unwrap_or(self.stable_encryption)
    }

    /// Resolves every algorithm name and shard layout up front so bad
    /// configuration never surfaces while data is being processed.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Configuration("workers must be greater than 0".to_string()));
        }
        if self.max_part_size == 0 {
            return Err(Error::Configuration(
                "max_part_size must be greater than 0".to_string(),
            ));
        }
        if self.assignment.raw_chunk_size == 0 {
            return Err(Error::Configuration("raw_chunk_size must be greater than 0".to_string()));
        }
        self.assignment.cdc_sizes()?;

        let encryptors = EncryptorRegistry::builtin();
        let correctors = EccRegistry::builtin();
        for (id, destination) in &self.destinations {
            if destination.max_connections == 0 {
                return Err(Error::Configuration(format!(
                    "destination '{}': max_connections must be greater than 0",
                    id
                )));
            }
            encryptors.resolve(&destination.encryption, self.stable_for(id))?;
            correctors.resolve(&destination.error_correction, self.max_part_size)?;
        }
        Ok(())
    }
}
