use crate::destination::Destination;
use crate::limiter::{BandwidthLimits, Direction};
use bytes::Bytes;
use shardvault_backends::{ConnectivityGuard, RetryConfig, retry_with_backoff};
use shardvault_core::{Error, Result, Shutdown};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Worker pool and transfer policy shared by every part transfer of one
/// pipeline.
///
/// A transfer holds a worker slot and one of the destination's connection
/// slots for its whole duration, runs under the connectivity guard and the
/// retry budget, and is charged against the global and then the destination's
/// bandwidth budget.
#[derive(Clone)]
pub struct TransferContext {
    workers: Arc<Semaphore>,
    retry: RetryConfig,
    guard: ConnectivityGuard,
    limits: BandwidthLimits,
    shutdown: Shutdown,
}

impl TransferContext {
    pub fn new(
        workers: usize,
        retry: RetryConfig,
        guard: ConnectivityGuard,
        limits: BandwidthLimits,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            workers: Arc::new(Semaphore::new(workers.max(1))),
            retry,
            guard,
            limits,
            shutdown,
        }
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    async fn permit(&self, semaphore: &Arc<Semaphore>) -> Result<OwnedSemaphorePermit> {
        tokio::select! {
            permit = semaphore.clone().acquire_owned() => {
                permit.map_err(|_| Error::ShutdownRequested)
            }
            _ = self.shutdown.cancelled() => Err(Error::ShutdownRequested),
        }
    }

    async fn throttle(&self, destination: &Destination, direction: Direction, bytes: u64) -> Result<()> {
        self.limits.acquire(direction, bytes, &self.shutdown).await?;
        destination.limits().acquire(direction, bytes, &self.shutdown).await
    }

    pub async fn upload(&self, destination: &Destination, suggested_key: &str, data: Bytes) -> Result<String> {
        self.shutdown.check()?;
        let _worker = self.permit(&self.workers).await?;
        let _connection = self.permit(destination.connections()).await?;
        self.throttle(destination, Direction::Upload, data.len() as u64).await?;

        let backend = destination.backend();
        retry_with_backoff(&self.retry, &self.shutdown, "upload_part", || {
            let data = data.clone();
            self.guard
                .run("upload_part", move || backend.upload(suggested_key, data.clone()))
        })
        .await
    }

    pub async fn download(&self, destination: &Destination, key: &str) -> Result<Bytes> {
        self.shutdown.check()?;
        let _worker = self.permit(&self.workers).await?;
        let _connection = self.permit(destination.connections()).await?;

        let backend = destination.backend();
        let data = retry_with_backoff(&self.retry, &self.shutdown, "download_part", || {
            self.guard.run("download_part", || backend.download(key))
        })
        .await?;
        self.throttle(destination, Direction::Download, data.len() as u64).await?;
        Ok(data)
    }
}
