use crate::retry::Retryable;
use async_trait::async_trait;
use shardvault_core::{Error, Result, Shutdown};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// Answers whether the network is currently usable.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_online(&self) -> bool;
}

pub struct AlwaysOnline;

#[async_trait]
impl ConnectivityProbe for AlwaysOnline {
    async fn is_online(&self) -> bool {
        true
    }
}

/// Considers the network up when a TCP connection to any target succeeds.
pub struct TcpProbe {
    targets: Vec<SocketAddr>,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(targets: Vec<SocketAddr>, timeout: Duration) -> Self {
        Self { targets, timeout }
    }
}

#[async_trait]
impl ConnectivityProbe for TcpProbe {
    async fn is_online(&self) -> bool {
        for target in &self.targets {
            let attempt = tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect(target));
            if matches!(attempt.await, Ok(Ok(_))) {
                return true;
            }
        }
        false
    }
}

/// Holds transient operations back while the network is down.
///
/// A failed operation whose error is retryable triggers a probe; if the
/// network is down the guard polls until it returns and then runs the
/// operation again. Each outage is logged once when detected and once when it
/// ends, however many operations are waiting.
#[derive(Clone)]
pub struct ConnectivityGuard {
    probe: Arc<dyn ConnectivityProbe>,
    poll_interval: Duration,
    shutdown: Shutdown,
    offline: Arc<AtomicBool>,
}

impl ConnectivityGuard {
    pub fn new(probe: Arc<dyn ConnectivityProbe>, poll_interval: Duration, shutdown: Shutdown) -> Self {
        Self {
            probe,
            poll_interval,
            shutdown,
            offline: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    pub async fn run<F, Fut, T>(&self, operation_name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        loop {
            self.shutdown.check()?;
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            if !error.is_retryable() || self.probe.is_online().await {
                return Err(error);
            }
            self.wait_for_connectivity(operation_name).await?;
        }
    }

    async fn wait_for_connectivity(&self, operation_name: &str) -> Result<()> {
        if self
            .offline
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            warn!(operation = operation_name, "Internet connectivity lost, waiting for it to return");
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.shutdown.cancelled() => return Err(Error::ShutdownRequested),
            }
            if self.probe.is_online().await {
                break;
            }
        }

        if self
            .offline
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!(operation = operation_name, "Internet connectivity restored");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct FlagProbe(Arc<AtomicBool>);

    #[async_trait]
    impl ConnectivityProbe for FlagProbe {
        async fn is_online(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn offline_error() -> Error {
        Error::Backend("connection refused".to_string())
    }

    #[tokio::test]
    async fn test_waits_for_connectivity_then_retries() {
        let online = Arc::new(AtomicBool::new(false));
        let guard = ConnectivityGuard::new(
            Arc::new(FlagProbe(online.clone())),
            Duration::from_millis(5),
            Shutdown::new(),
        );
        let calls = Arc::new(AtomicU32::new(0));

        let restore = online.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            restore.store(true, Ordering::SeqCst);
        });

        let counter = calls.clone();
        let flag = online.clone();
        let result = guard
            .run("upload", || {
                let counter = counter.clone();
                let flag = flag.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if flag.load(Ordering::SeqCst) { Ok(7) } else { Err(offline_error()) }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!guard.is_offline());
    }

    #[tokio::test]
    async fn test_failure_while_online_is_returned() {
        let guard = ConnectivityGuard::new(Arc::new(AlwaysOnline), Duration::from_millis(5), Shutdown::new());
        let result: Result<()> = guard.run("download", || async { Err(offline_error()) }).await;
        assert!(matches!(result, Err(Error::Backend(_))));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_wait() {
        let shutdown = Shutdown::new();
        let guard = ConnectivityGuard::new(
            Arc::new(FlagProbe(Arc::new(AtomicBool::new(false)))),
            Duration::from_secs(60),
            shutdown.clone(),
        );
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.request();
        });

        let result: Result<()> = tokio::time::timeout(
            Duration::from_secs(2),
            guard.run("download", || async { Err(offline_error()) }),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(Error::ShutdownRequested)));
        assert!(guard.is_offline());
    }
}
