use std::path::Path;

use async_trait::async_trait;
use etcd_client::{Client, SnapshotStreaming};
use futures::Stream;
use log::{info, warn};
use tokio::time::Instant;

use super::{PartFile, SnapshotError, SnapshotInfo, SnapshotSource, write_chunks};
use crate::config::XlineConfig;
use crate::coordination::xline::connect_options;

/// Streams the maintenance snapshot of a single Xline member to disk.
#[derive(Debug, Clone)]
pub struct XlineSnapshotter {
    config: XlineConfig,
}

impl XlineSnapshotter {
    pub fn new(config: XlineConfig) -> Self {
        Self { config }
    }

    fn endpoint(&self) -> Result<&str, SnapshotError> {
        // a snapshot is taken from one member, never load-balanced
        match self.config.endpoints.as_slice() {
            [endpoint] => Ok(endpoint),
            endpoints => Err(SnapshotError::MultipleEndpoints(endpoints.len())),
        }
    }
}

#[async_trait]
impl SnapshotSource for XlineSnapshotter {
    async fn save(&self, dest: &Path) -> Result<SnapshotInfo, SnapshotError> {
        let endpoint = self.endpoint()?;
        if tokio::fs::try_exists(dest).await? {
            return Err(SnapshotError::TargetExists(dest.to_path_buf()));
        }

        let mut client = Client::connect([endpoint], Some(connect_options(&self.config))).await?;
        let server_version = match client.status().await {
            Ok(status) => Some(status.version().to_string()),
            Err(e) => {
                warn!("Could not read server version from {endpoint}: {e}");
                None
            }
        };

        let part = PartFile::create(dest).await?;
        info!("Fetching snapshot from {endpoint} into {}", part.path().display());
        let started = Instant::now();
        let stream = client.snapshot().await?;
        let size = write_chunks(part, snapshot_chunks(stream), dest).await?;
        let took = started.elapsed();
        info!("Saved snapshot to {}: {size} bytes in {took:?}", dest.display());

        Ok(SnapshotInfo {
            path: dest.to_path_buf(),
            size,
            took,
            server_version,
        })
    }
}

fn snapshot_chunks(
    stream: SnapshotStreaming,
) -> impl Stream<Item = Result<Vec<u8>, SnapshotError>> {
    futures::stream::unfold(stream, |mut stream| async move {
        match stream.message().await {
            Ok(Some(resp)) => Some((Ok(resp.blob().to_vec()), stream)),
            Ok(None) => None,
            Err(e) => Some((Err(SnapshotError::from(e)), stream)),
        }
    })
}
