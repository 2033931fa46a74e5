//! Error correction: splitting encrypted block bytes into ordered parts and
//! reassembling them from a possibly incomplete, possibly corrupt subset.

use crate::config::ErrorCorrectionConfig;
use crate::types::Metadata;
use crate::{Error, Result};
use bytes::Bytes;
use reed_solomon_erasure::galois_8::ReedSolomon;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

pub const NONE: &str = "none";
pub const REED_SOLOMON: &str = "reed-solomon";

pub const CHECKSUM_SIZE: usize = 8;
/// GF(2^8) limits a codeword to 256 shards.
pub const MAX_TOTAL_SHARDS: usize = 256;

const PARTS_KEY: &str = "parts";
const DATA_SHARDS_KEY: &str = "data_shards";
const PARITY_SHARDS_KEY: &str = "parity_shards";
const LENGTH_KEY: &str = "length";

pub trait ErrorCorrector: Send + Sync {
    fn algorithm(&self) -> &'static str;

    /// Splits `data` into ordered parts. Parameters needed to decode are
    /// written to `metadata`.
    fn encode(&self, metadata: &mut Metadata, data: &[u8]) -> Result<Vec<Bytes>>;

    /// Reassembles the original bytes; `None` entries are missing parts.
    fn decode(&self, metadata: &Metadata, parts: Vec<Option<Bytes>>) -> Result<Vec<u8>>;

    /// Smallest number of parts from which the record can be rebuilt.
    fn minimum_sufficient_parts(&self, metadata: &Metadata, total_parts: usize) -> Result<usize>;

    /// Cheap integrity check on a single fetched part.
    fn verify_part(&self, _metadata: &Metadata, _part: &[u8]) -> bool {
        true
    }
}

fn read_usize(metadata: &Metadata, key: &str) -> Result<Option<usize>> {
    metadata
        .get(key)
        .map(|value| {
            value
                .parse::<usize>()
                .map_err(|_| Error::Other(format!("invalid {} in record metadata: {}", key, value)))
        })
        .transpose()
}

/// No redundancy: one part, or fixed-size slices when the data exceeds the
/// maximum part size.
pub struct NoneCorrector {
    max_part_size: usize,
}

impl NoneCorrector {
    pub fn new(max_part_size: usize) -> Result<Self> {
        if max_part_size == 0 {
            return Err(Error::Configuration(
                "max_part_size must be greater than 0".to_string(),
            ));
        }
        Ok(Self { max_part_size })
    }
}

impl ErrorCorrector for NoneCorrector {
    fn algorithm(&self) -> &'static str {
        NONE
    }

    fn encode(&self, metadata: &mut Metadata, data: &[u8]) -> Result<Vec<Bytes>> {
        let parts: Vec<Bytes> = if data.len() <= self.max_part_size {
            vec![Bytes::copy_from_slice(data)]
        } else {
            data.chunks(self.max_part_size)
                .map(Bytes::copy_from_slice)
                .collect()
        };
        metadata.insert(PARTS_KEY.to_string(), parts.len().to_string());
        Ok(parts)
    }

    fn decode(&self, _metadata: &Metadata, parts: Vec<Option<Bytes>>) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(parts.iter().flatten().map(Bytes::len).sum());
        for (index, part) in parts.into_iter().enumerate() {
            let part = part.ok_or(Error::MissingPart { index })?;
            data.extend_from_slice(&part);
        }
        Ok(data)
    }

    fn minimum_sufficient_parts(&self, metadata: &Metadata, total_parts: usize) -> Result<usize> {
        Ok(read_usize(metadata, PARTS_KEY)?.unwrap_or(total_parts))
    }
}

/// Reed-Solomon over GF(2^8) with an 8-byte blake3 checksum appended to
/// every shard. A shard whose checksum fails is treated as absent.
pub struct ReedSolomonCorrector {
    data_shards: usize,
    parity_shards: usize,
}

impl ReedSolomonCorrector {
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        if data_shards == 0 || parity_shards == 0 {
            return Err(Error::Configuration(
                "data_shards and parity_shards must be greater than 0".to_string(),
            ));
        }
        if data_shards + parity_shards > MAX_TOTAL_SHARDS {
            return Err(Error::Configuration(format!(
                "at most {} total shards are supported, got {}",
                MAX_TOTAL_SHARDS,
                data_shards + parity_shards
            )));
        }
        Ok(Self {
            data_shards,
            parity_shards,
        })
    }

    fn codec(data_shards: usize, parity_shards: usize) -> Result<ReedSolomon> {
        ReedSolomon::new(data_shards, parity_shards)
            .map_err(|e| Error::Configuration(format!("Reed-Solomon setup failed: {e}")))
    }

    fn layout(metadata: &Metadata) -> Result<(usize, usize)> {
        let data = read_usize(metadata, DATA_SHARDS_KEY)?
            .ok_or_else(|| Error::Other("record metadata lacks data_shards".to_string()))?;
        let parity = read_usize(metadata, PARITY_SHARDS_KEY)?
            .ok_or_else(|| Error::Other("record metadata lacks parity_shards".to_string()))?;
        Ok((data, parity))
    }
}

fn checksum(shard: &[u8]) -> [u8; CHECKSUM_SIZE] {
    let mut sum = [0u8; CHECKSUM_SIZE];
    sum.copy_from_slice(&blake3::hash(shard).as_bytes()[..CHECKSUM_SIZE]);
    sum
}

/// Returns the shard body if its trailing checksum matches.
fn verified_body(part: &[u8]) -> Option<&[u8]> {
    if part.len() <= CHECKSUM_SIZE {
        return None;
    }
    let (body, sum) = part.split_at(part.len() - CHECKSUM_SIZE);
    (checksum(body) == sum).then_some(body)
}

impl ErrorCorrector for ReedSolomonCorrector {
    fn algorithm(&self) -> &'static str {
        REED_SOLOMON
    }

    fn encode(&self, metadata: &mut Metadata, data: &[u8]) -> Result<Vec<Bytes>> {
        let codec = Self::codec(self.data_shards, self.parity_shards)?;
        let shard_size = data.len().div_ceil(self.data_shards).max(1);

        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(self.data_shards + self.parity_shards);
        for index in 0..self.data_shards {
            let start = (index * shard_size).min(data.len());
            let end = (start + shard_size).min(data.len());
            let mut shard = data[start..end].to_vec();
            shard.resize(shard_size, 0);
            shards.push(shard);
        }
        shards.extend((0..self.parity_shards).map(|_| vec![0u8; shard_size]));

        codec
            .encode(&mut shards)
            .map_err(|e| Error::Other(format!("Reed-Solomon encode failed: {e}")))?;

        metadata.insert(DATA_SHARDS_KEY.to_string(), self.data_shards.to_string());
        metadata.insert(PARITY_SHARDS_KEY.to_string(), self.parity_shards.to_string());
        if shard_size * self.data_shards != data.len() {
            metadata.insert(LENGTH_KEY.to_string(), data.len().to_string());
        }

        Ok(shards
            .into_iter()
            .map(|mut shard| {
                let sum = checksum(&shard);
                shard.extend_from_slice(&sum);
                Bytes::from(shard)
            })
            .collect())
    }

    fn decode(&self, metadata: &Metadata, parts: Vec<Option<Bytes>>) -> Result<Vec<u8>> {
        let (data_shards, parity_shards) = Self::layout(metadata)?;
        if parts.len() != data_shards + parity_shards {
            return Err(Error::Other(format!(
                "expected {} shards, got {}",
                data_shards + parity_shards,
                parts.len()
            )));
        }

        let mut shard_size = None;
        let mut shards: Vec<Option<Vec<u8>>> = Vec::with_capacity(parts.len());
        for (index, part) in parts.iter().enumerate() {
            let body = match part.as_deref() {
                Some(part) => match verified_body(part) {
                    Some(body) if shard_size.is_none_or(|size| size == body.len()) => {
                        shard_size = Some(body.len());
                        Some(body.to_vec())
                    }
                    _ => {
                        warn!(part = index, "Shard failed checksum verification, treating as absent");
                        None
                    }
                },
                None => None,
            };
            shards.push(body);
        }

        let available = shards.iter().filter(|s| s.is_some()).count();
        if available < data_shards {
            return Err(Error::InsufficientShards {
                available,
                required: data_shards,
            });
        }

        let codec = Self::codec(data_shards, parity_shards)?;
        codec
            .reconstruct_data(&mut shards)
            .map_err(|e| Error::Other(format!("Reed-Solomon reconstruction failed: {e}")))?;

        let mut data = Vec::with_capacity(data_shards * shard_size.unwrap_or(0));
        for shard in shards.into_iter().take(data_shards) {
            let shard = shard.ok_or_else(|| {
                Error::Other("Reed-Solomon reconstruction left a data shard empty".to_string())
            })?;
            data.extend_from_slice(&shard);
        }
        if let Some(length) = read_usize(metadata, LENGTH_KEY)? {
            if length > data.len() {
                return Err(Error::Other(format!(
                    "recorded length {} exceeds decoded length {}",
                    length,
                    data.len()
                )));
            }
            data.truncate(length);
        }
        Ok(data)
    }

    fn minimum_sufficient_parts(&self, metadata: &Metadata, _total_parts: usize) -> Result<usize> {
        Ok(Self::layout(metadata)?.0)
    }

    fn verify_part(&self, _metadata: &Metadata, part: &[u8]) -> bool {
        verified_body(part).is_some()
    }
}

pub type CorrectorFactory =
    fn(config: &ErrorCorrectionConfig, max_part_size: usize) -> Result<Arc<dyn ErrorCorrector>>;

/// Maps error-correction identifiers to constructors.
#[derive(Clone)]
pub struct EccRegistry {
    factories: BTreeMap<&'static str, CorrectorFactory>,
}

impl EccRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(NONE, |_, max_part_size| {
            Ok(Arc::new(NoneCorrector::new(max_part_size)?))
        });
        registry.register(REED_SOLOMON, |config, _| {
            Ok(Arc::new(ReedSolomonCorrector::new(
                config.data_shards,
                config.parity_shards,
            )?))
        });
        registry
    }

    pub fn register(&mut self, name: &'static str, factory: CorrectorFactory) {
        self.factories.insert(name, factory);
    }

    pub fn resolve(
        &self,
        config: &ErrorCorrectionConfig,
        max_part_size: usize,
    ) -> Result<Arc<dyn ErrorCorrector>> {
        let factory = self.factories.get(config.algorithm.as_str()).ok_or_else(|| {
            Error::Configuration(format!(
                "unknown error correction algorithm '{}'",
                config.algorithm
            ))
        })?;
        factory(config, max_part_size)
    }

    /// Decoder for an existing record. Decoding reads its parameters from the
    /// record metadata, so default encode parameters are used here.
    pub fn for_record(&self, algorithm: &str) -> Result<Arc<dyn ErrorCorrector>> {
        let config = ErrorCorrectionConfig {
            algorithm: algorithm.to_string(),
            ..ErrorCorrectionConfig::default()
        };
        self.resolve(&config, crate::config::DEFAULT_MAX_PART_SIZE)
    }
}

impl Default for EccRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
