use crate::download::Downloader;
use crate::progress::{ProgressHandle, ProgressTracker};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use shardvault_core::format;
use shardvault_core::{BackupFile, BlockHash, Error, FileLocation, FileRange, FormatTag, Result, Shutdown};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Where reconstructed bytes go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreTarget {
    /// Write a file at this path, replacing any existing content.
    File(PathBuf),
    /// Reconstruct and verify without writing anything.
    Null,
    /// Compare byte for byte against the file at this path.
    Compare(PathBuf),
}

enum Sink {
    File(File),
    Null,
    Compare {
        path: PathBuf,
        file: File,
        recorded_modified: i64,
    },
}

enum Progress {
    Continue,
    /// The local file changed since the backup; comparison stopped.
    Diverged,
}

/// Rebuilds whole files from their block ranges.
pub struct FileRestorer {
    downloader: Arc<Downloader>,
    progress: Arc<ProgressTracker>,
    shutdown: Shutdown,
}

impl FileRestorer {
    pub fn new(downloader: Arc<Downloader>, progress: Arc<ProgressTracker>, shutdown: Shutdown) -> Self {
        Self {
            downloader,
            progress,
            shutdown,
        }
    }

    /// Restores `file` from the first of its locations that fully succeeds.
    pub async fn restore(&self, file: &BackupFile, target: &RestoreTarget) -> Result<()> {
        let path = file.path.display().to_string();
        let empty = [FileLocation::default()];
        let locations: &[FileLocation] = if file.locations.is_empty() && file.length == 0 {
            &empty
        } else {
            &file.locations
        };
        if locations.is_empty() {
            return Err(Error::RestoreFailed {
                path,
                reason: "file has no storage locations".to_string(),
            });
        }

        let handle = self.progress.start(&file.path, file.length);
        for (position, location) in locations.iter().enumerate() {
            self.shutdown.check()?;
            handle.reset();

            let error = match self.restore_location(file, location, target, &handle).await {
                Ok(()) => {
                    debug!(path = %path, bytes = file.length, "File restored");
                    return Ok(());
                }
                Err(e) => e,
            };
            match error {
                Error::ShutdownRequested
                | Error::CompareMismatch { .. }
                | Error::LengthMismatch { .. }
                | Error::Io(_) => return Err(error),
                _ if position + 1 == locations.len() => {
                    return Err(Error::RestoreFailed {
                        path,
                        reason: error.to_string(),
                    });
                }
                _ => warn!(
                    path = %path,
                    location = position,
                    error = %error,
                    "Storage location failed, trying the next one"
                ),
            }
        }
        Err(Error::RestoreFailed {
            path,
            reason: "no storage location succeeded".to_string(),
        })
    }

    async fn restore_location(
        &self,
        file: &BackupFile,
        location: &FileLocation,
        target: &RestoreTarget,
        handle: &ProgressHandle,
    ) -> Result<()> {
        let path = file.path.display().to_string();
        let covered: u64 = location.ranges.iter().map(|r| r.length).sum();
        let end = location.ranges.iter().map(FileRange::end).max().unwrap_or(0);
        if covered != file.length || end != file.length {
            return Err(Error::LengthMismatch {
                path,
                expected: file.length,
                actual: covered.max(end),
            });
        }

        let mut sink = Sink::open(target, file).await?;
        for range in &location.ranges {
            self.shutdown.check()?;
            match self.restore_range(range, &mut sink, handle).await? {
                Progress::Continue => {}
                Progress::Diverged => return Ok(()),
            }
        }
        sink.finish(&path, file.length).await
    }

    async fn restore_range(
        &self,
        range: &FileRange,
        sink: &mut Sink,
        handle: &ProgressHandle,
    ) -> Result<Progress> {
        let block = self.downloader.download(&range.part.block_hash).await?;
        let mut offset = range.offset;

        if block.format == FormatTag::Chain {
            // Depth-first over nested chains, preserving order.
            let mut pending: Vec<BlockHash> = format::decode_chain(&block.payload)?;
            pending.reverse();
            while let Some(hash) = pending.pop() {
                self.shutdown.check()?;
                let sub = self.downloader.download(&hash).await?;
                if sub.format == FormatTag::Chain {
                    pending.extend(format::decode_chain(&sub.payload)?.into_iter().rev());
                    continue;
                }
                let data = format::extract(sub.format, sub.payload, 0)?;
                let len = data.len() as u64;
                if offset + len > range.end() {
                    return Err(slice_error(&range.part.block_hash, "chain is longer than its range"));
                }
                if let Progress::Diverged = sink.write_at(offset, data).await? {
                    return Ok(Progress::Diverged);
                }
                offset += len;
                handle.advance(len);
            }
        } else {
            let data = format::extract(block.format, block.payload, range.part.index)
                .map_err(|e| slice_error(&range.part.block_hash, &e.to_string()))?;
            let len = data.len() as u64;
            if len != range.length {
                return Err(slice_error(&range.part.block_hash, "slice length differs from range"));
            }
            if let Progress::Diverged = sink.write_at(offset, data).await? {
                return Ok(Progress::Diverged);
            }
            offset += len;
            handle.advance(len);
        }

        if offset != range.end() {
            return Err(slice_error(&range.part.block_hash, "content ends before its range"));
        }
        Ok(Progress::Continue)
    }
}

fn slice_error(hash: &BlockHash, reason: &str) -> Error {
    Error::CorruptBlockStorage {
        hash: hash.to_hex(),
        reason: reason.to_string(),
    }
}

async fn modified_millis(path: &Path) -> Result<i64> {
    let modified = fs::metadata(path).await?.modified()?;
    Ok(DateTime::<Utc>::from(modified).timestamp_millis())
}

impl Sink {
    async fn open(target: &RestoreTarget, file: &BackupFile) -> Result<Self> {
        match target {
            RestoreTarget::File(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).await?;
                }
                let out = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .await?;
                Ok(Sink::File(out))
            }
            RestoreTarget::Null => Ok(Sink::Null),
            RestoreTarget::Compare(path) => Ok(Sink::Compare {
                path: path.clone(),
                file: File::open(path).await?,
                recorded_modified: file.modified,
            }),
        }
    }

    async fn write_at(&mut self, offset: u64, data: Bytes) -> Result<Progress> {
        match self {
            Sink::File(out) => {
                out.seek(SeekFrom::Start(offset)).await?;
                out.write_all(&data).await?;
                Ok(Progress::Continue)
            }
            Sink::Null => Ok(Progress::Continue),
            Sink::Compare {
                path,
                file,
                recorded_modified,
            } => {
                file.seek(SeekFrom::Start(offset)).await?;
                let mut local = Vec::with_capacity(data.len());
                (&mut *file).take(data.len() as u64).read_to_end(&mut local).await?;

                let mismatch = local
                    .iter()
                    .zip(data.iter())
                    .position(|(a, b)| a != b)
                    .or((local.len() < data.len()).then_some(local.len()));
                let Some(position) = mismatch else {
                    return Ok(Progress::Continue);
                };
                let at = offset + position as u64;
                divergence(path, *recorded_modified, at).await
            }
        }
    }

    async fn finish(self, path: &str, length: u64) -> Result<()> {
        match self {
            Sink::File(mut out) => {
                out.flush().await?;
                out.set_len(length).await?;
                let actual = out.metadata().await?.len();
                if actual != length {
                    return Err(Error::LengthMismatch {
                        path: path.to_string(),
                        expected: length,
                        actual,
                    });
                }
                Ok(())
            }
            Sink::Null => Ok(()),
            Sink::Compare {
                path: local,
                file,
                recorded_modified,
            } => {
                let actual = file.metadata().await?.len();
                if actual == length {
                    return Ok(());
                }
                if changed_since_backup(&local, recorded_modified).await? {
                    warn!(
                        path = %local.display(),
                        expected = length,
                        actual,
                        "Local file changed since backup, length differs"
                    );
                    return Ok(());
                }
                Err(Error::LengthMismatch {
                    path: path.to_string(),
                    expected: length,
                    actual,
                })
            }
        }
    }
}

async fn changed_since_backup(path: &Path, recorded_modified: i64) -> Result<bool> {
    Ok(modified_millis(path).await? != recorded_modified)
}

/// A difference at `offset` is expected when the local file was modified
/// after the backup; otherwise it is a mismatch.
async fn divergence(path: &Path, recorded_modified: i64, offset: u64) -> Result<Progress> {
    if changed_since_backup(path, recorded_modified).await? {
        warn!(
            path = %path.display(),
            offset,
            "Local file changed since backup, stopping comparison"
        );
        return Ok(Progress::Diverged);
    }
    info!(path = %path.display(), offset, "Local file differs from backup");
    Err(Error::CompareMismatch {
        path: path.display().to_string(),
        offset,
    })
}
