//! Rotation-resilient log file tail.

use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;

use anyhow::{Context, Result};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::export::health::HealthMetrics;
use crate::sink::dispatch::Dispatcher;

use super::handle_line;

/// Follows a file from its current end, surviving truncation and rotation.
///
/// Whenever the file is (re)opened the reader seeks to the end, so nothing
/// written before that point is ever replayed.
pub struct TailReader {
    path: PathBuf,
    reader: BufReader<File>,
    /// Position in the current file, starting at the seek offset.
    offset: u64,
    inode: Option<u64>,
    /// Bytes of a line whose newline has not been written yet.
    pending: Vec<u8>,
    poll_interval: Duration,
}

impl TailReader {
    /// Opens `path` and positions the reader at its end.
    pub async fn open(path: impl Into<PathBuf>, poll_interval: Duration) -> Result<Self> {
        let path = path.into();
        let (reader, offset, inode) = open_at_end(&path)
            .await
            .with_context(|| format!("opening log file {}", path.display()))?;

        Ok(Self {
            path,
            reader,
            offset,
            inode,
            pending: Vec::new(),
            poll_interval,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads whatever is available and returns the next complete line without
    /// its terminator, or `None` once the end of the file is reached.
    ///
    /// An unterminated tail is kept until its newline arrives. Bytes that are
    /// not UTF-8 are replaced rather than failing the source.
    pub async fn read_available(&mut self) -> Result<Option<String>> {
        let read = self
            .reader
            .read_until(b'\n', &mut self.pending)
            .await
            .context("reading log file")?;
        self.offset += read as u64;

        if !self.pending.ends_with(b"\n") {
            return Ok(None);
        }

        let bytes = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&bytes);
        Ok(Some(line.trim_end_matches(['\n', '\r']).to_string()))
    }

    /// Checks whether the path now refers to a different or shorter file and
    /// reopens it at its end if so. Returns whether a reopen happened.
    ///
    /// Failures are logged and left for the next poll to retry.
    pub async fn check_rotation(&mut self) -> bool {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "log file missing, waiting for it to reappear");
                return false;
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to stat log file");
                return false;
            }
        };

        #[cfg(unix)]
        let replaced = self.inode.is_some_and(|inode| inode != metadata.ino());
        #[cfg(not(unix))]
        let replaced = false;
        let truncated = metadata.len() < self.offset;

        if !replaced && !truncated {
            return false;
        }

        match self.reopen().await {
            Ok(()) => {
                info!(
                    path = %self.path.display(),
                    replaced,
                    truncated,
                    "log file rotated, reopened at end",
                );
                true
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to reopen log file");
                false
            }
        }
    }

    /// Reopens the path at its end regardless of what it refers to now.
    async fn reopen(&mut self) -> std::io::Result<()> {
        let (reader, offset, inode) = open_at_end(&self.path).await?;
        self.reader = reader;
        self.offset = offset;
        self.inode = inode;
        self.pending.clear();
        Ok(())
    }

    /// Waits for the next complete line, checking for rotation and sleeping
    /// for the poll interval each time the end of the file is reached.
    ///
    /// Never gives up: a failed read is reported through `on_event`, then the
    /// file is reopened at its end after one poll interval.
    pub async fn follow(&mut self, mut on_event: impl FnMut(TailEvent)) -> String {
        loop {
            match self.read_available().await {
                Ok(Some(line)) => return line,
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "log file read failed, reopening");
                    on_event(TailEvent::ReadError);
                    tokio::time::sleep(self.poll_interval).await;
                    match self.reopen().await {
                        Ok(()) => on_event(TailEvent::Reopened),
                        Err(e) => {
                            warn!(path = %self.path.display(), error = %e, "failed to reopen log file");
                        }
                    }
                    continue;
                }
            }
            if self.check_rotation().await {
                on_event(TailEvent::Reopened);
                continue;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Notable things that happen while following a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailEvent {
    /// The file was reopened at its end after rotation, truncation or an error.
    Reopened,
    /// Reading from the file failed.
    ReadError,
}

async fn open_at_end(path: &Path) -> std::io::Result<(BufReader<File>, u64, Option<u64>)> {
    let file = File::open(path).await?;
    let metadata = file.metadata().await?;

    #[cfg(unix)]
    let inode = Some(metadata.ino());
    #[cfg(not(unix))]
    let inode = {
        let _ = &metadata;
        None
    };

    let mut reader = BufReader::new(file);
    let offset = reader.seek(SeekFrom::End(0)).await?;

    Ok((reader, offset, inode))
}

/// Line source tailing one log file.
pub struct FileSource {
    name: String,
    reader: TailReader,
}

impl FileSource {
    /// Opens the file so failures surface before any task is spawned.
    pub async fn open(path: &Path, poll_interval: Duration) -> Result<Self> {
        let reader = TailReader::open(path, poll_interval).await?;
        Ok(Self {
            name: path.display().to_string(),
            reader,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Feeds every telemetry line to `dispatcher` until cancelled or until
    /// the aggregation worker goes away.
    pub async fn run(
        mut self,
        dispatcher: Dispatcher,
        health: Arc<HealthMetrics>,
        ctx: CancellationToken,
    ) -> Result<()> {
        info!(path = %self.reader.path().display(), "tailing log file");

        let lines_read = health.lines_read.with_label_values(&[self.name.as_str()]);
        let reopens = health.source_reopens.with_label_values(&[self.name.as_str()]);
        let read_errors = health.source_read_errors.with_label_values(&[self.name.as_str()]);
        let on_event = |event: TailEvent| match event {
            TailEvent::Reopened => reopens.inc(),
            TailEvent::ReadError => read_errors.inc(),
        };

        loop {
            let line = tokio::select! {
                _ = ctx.cancelled() => break,
                line = self.reader.follow(on_event) => line,
            };
            lines_read.inc();

            if !handle_line(&line, &dispatcher, &health).await {
                debug!(source = %self.name, "dispatcher closed");
                break;
            }
        }

        info!(source = %self.name, "log file source stopped");
        Ok(())
    }
}
