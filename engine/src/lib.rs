pub mod destination;
pub mod download;
pub mod limiter;
pub mod progress;
pub mod restore;
pub mod transfer;
pub mod upload;
pub mod vault;

pub use destination::Destination;
pub use download::{DownloadStats, DownloadStatsSnapshot, DownloadedBlock, Downloader};
pub use limiter::{BandwidthLimits, Direction, TokenBucket};
pub use progress::{FileProgress, ProgressTracker};
pub use restore::{FileRestorer, RestoreTarget};
pub use transfer::TransferContext;
pub use upload::{CompletionGate, UploadCallback, UploadOutcome, UploadRequest, Uploader};
pub use vault::BlockVault;
