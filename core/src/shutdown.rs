use crate::{Error, Result};
use tokio_util::sync::CancellationToken;

/// Process-wide cooperative cancellation.
///
/// Clones share the same token. Blocking waits race their work against
/// [`Shutdown::cancelled`]; retry loops call [`Shutdown::check`] between attempts.
#[derive(Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.token.cancel();
    }

    pub fn is_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn check(&self) -> Result<()> {
        if self.is_requested() {
            Err(Error::ShutdownRequested)
        } else {
            Ok(())
        }
    }

    /// Resolves once shutdown has been requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

impl std::fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shutdown")
            .field("requested", &self.is_requested())
            .finish()
    }
}
