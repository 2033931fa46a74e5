//! Token bucket bandwidth limiting.

use shardvault_core::{Error, Result, Shutdown};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

/// Byte-granular token bucket. Callers reserve tokens before (or after) a
/// transfer and sleep off any debt; the bucket holds at most one second of
/// budget.
#[derive(Debug)]
pub struct TokenBucket {
    bytes_per_second: u64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    /// Negative while the bucket is in debt.
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    pub fn new(bytes_per_second: u64) -> Result<Self> {
        if bytes_per_second == 0 {
            return Err(Error::Configuration(
                "bandwidth limit must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            bytes_per_second,
            state: Mutex::new(BucketState {
                tokens: bytes_per_second as f64,
                last_update: Instant::now(),
            }),
        })
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.bytes_per_second
    }

    /// Takes `bytes` tokens and returns how long the caller must wait for the
    /// bucket to climb back out of debt.
    pub fn reserve(&self, bytes: u64) -> Duration {
        let rate = self.bytes_per_second as f64;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let now = Instant::now();
        let elapsed = now.duration_since(state.last_update).as_secs_f64();
        state.tokens = (state.tokens + elapsed * rate).min(rate);
        state.last_update = now;
        state.tokens -= bytes as f64;

        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / rate)
        }
    }

    pub async fn acquire(&self, bytes: u64, shutdown: &Shutdown) -> Result<()> {
        let wait = self.reserve(bytes);
        if wait.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(wait) => Ok(()),
            _ = shutdown.cancelled() => Err(Error::ShutdownRequested),
        }
    }
}

/// Optional upload and download budgets, either process-wide or for a single
/// destination.
#[derive(Debug, Clone, Default)]
pub struct BandwidthLimits {
    upload: Option<Arc<TokenBucket>>,
    download: Option<Arc<TokenBucket>>,
}

impl BandwidthLimits {
    pub fn new(upload: Option<u64>, download: Option<u64>) -> Result<Self> {
        Ok(Self {
            upload: upload.map(TokenBucket::new).transpose()?.map(Arc::new),
            download: download.map(TokenBucket::new).transpose()?.map(Arc::new),
        })
    }

    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn bucket(&self, direction: Direction) -> Option<&TokenBucket> {
        match direction {
            Direction::Upload => self.upload.as_deref(),
            Direction::Download => self.download.as_deref(),
        }
    }

    pub async fn acquire(&self, direction: Direction, bytes: u64, shutdown: &Shutdown) -> Result<()> {
        match self.bucket(direction) {
            Some(bucket) => bucket.acquire(bytes, shutdown).await,
            None => Ok(()),
        }
    }
}
