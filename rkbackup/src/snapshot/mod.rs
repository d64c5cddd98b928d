use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use log::warn;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

pub mod xline;

pub use xline::XlineSnapshotter;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot target {0} already exists")]
    TargetExists(PathBuf),
    #[error("snapshot requires exactly one endpoint, got {0}")]
    MultipleEndpoints(usize),
    #[error("store returned an empty snapshot")]
    Empty,
    #[error("deadline exceeded while saving snapshot")]
    DeadlineExceeded,
    #[error(transparent)]
    Xline(#[from] Box<etcd_client::Error>),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<etcd_client::Error> for SnapshotError {
    fn from(e: etcd_client::Error) -> Self {
        SnapshotError::Xline(Box::new(e))
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub path: PathBuf,
    pub size: u64,
    pub took: Duration,
    pub server_version: Option<String>,
}

/// Produces a consistent point-in-time copy of the whole store at a path.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn save(&self, dest: &Path) -> Result<SnapshotInfo, SnapshotError>;
}

pub fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// A `<dest>.part` file that is deleted unless it was persisted.
pub struct PartFile {
    path: PathBuf,
    file: File,
    persisted: bool,
}

impl PartFile {
    pub async fn create(dest: &Path) -> Result<Self, SnapshotError> {
        let path = part_path(dest);
        let mut opts = OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        opts.mode(0o600);
        let file = opts.open(&path).await?;
        Ok(Self {
            path,
            file,
            persisted: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&mut self) -> &mut File {
        &mut self.file
    }

    /// Flushes to disk and renames onto `dest`.
    pub async fn persist(mut self, dest: &Path) -> Result<(), SnapshotError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        if tokio::fs::try_exists(dest).await? {
            return Err(SnapshotError::TargetExists(dest.to_path_buf()));
        }
        tokio::fs::rename(&self.path, dest).await?;
        self.persisted = true;
        Ok(())
    }
}

impl Drop for PartFile {
    fn drop(&mut self) {
        if self.persisted {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove partial snapshot {}: {e}", self.path.display());
            }
        }
    }
}

/// Writes every chunk into `part` and renames it onto `dest`. An error in
/// the middle of the stream or an empty stream leaves nothing behind.
pub async fn write_chunks<S>(
    mut part: PartFile,
    chunks: S,
    dest: &Path,
) -> Result<u64, SnapshotError>
where
    S: Stream<Item = Result<Vec<u8>, SnapshotError>>,
{
    tokio::pin!(chunks);
    let mut size: u64 = 0;
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        part.file().write_all(&chunk).await?;
        size += chunk.len() as u64;
    }
    if size == 0 {
        return Err(SnapshotError::Empty);
    }
    part.persist(dest).await?;
    Ok(size)
}
