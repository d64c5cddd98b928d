use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use log::{info, warn};
use tokio::time::{Instant, sleep_until, timeout, timeout_at};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::coordination::{CoordinationError, Coordinator, LockHandle, Session, XlineCoordinator};
use crate::error::{BackupError, CleanupWarning};
use crate::snapshot::{SnapshotError, SnapshotInfo, SnapshotSource, XlineSnapshotter};

pub const SNAPSHOT_TIME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// `<dir>/<prefix>_<YYYY-MM-DD_HH-MM-SS>.db`. Second resolution, so two
/// runs started within the same second get the same path.
pub fn snapshot_path(dir: &Path, prefix: &str, at: NaiveDateTime) -> PathBuf {
    dir.join(format!("{prefix}_{}.db", at.format(SNAPSHOT_TIME_FORMAT)))
}

/// One backup attempt: where the snapshot goes and when the attempt gives up.
#[derive(Debug, Clone)]
pub struct BackupRun {
    pub target: PathBuf,
    pub deadline: Instant,
}

impl BackupRun {
    pub fn new(target: impl Into<PathBuf>, budget: Duration) -> Self {
        Self {
            target: target.into(),
            deadline: Instant::now() + budget,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        let target = snapshot_path(
            &cfg.backup_dir,
            &cfg.file_prefix,
            Local::now().naive_local(),
        );
        Self::new(target, cfg.deadline())
    }
}

#[derive(Debug)]
pub struct BackupReport {
    pub path: PathBuf,
    pub size: u64,
    pub took: Duration,
    pub server_version: Option<String>,
    pub warnings: Vec<CleanupWarning>,
}

/// Runs connect, lock, snapshot, unlock and session close for one backup.
pub struct BackupOrchestrator {
    coordinator: Arc<dyn Coordinator>,
    snapshotter: Arc<dyn SnapshotSource>,
    lock_name: String,
    dial_timeout: Duration,
    cleanup_timeout: Duration,
}

impl BackupOrchestrator {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        snapshotter: Arc<dyn SnapshotSource>,
        lock_name: impl Into<String>,
    ) -> Self {
        Self {
            coordinator,
            snapshotter,
            lock_name: lock_name.into(),
            dial_timeout: Duration::from_secs(5),
            cleanup_timeout: Duration::from_secs(5),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        let xline = &cfg.xline_config;
        Self::new(
            Arc::new(XlineCoordinator::new(xline.clone())),
            Arc::new(XlineSnapshotter::new(xline.clone())),
            cfg.lock_name.clone(),
        )
        .with_dial_timeout(xline.dial_timeout())
        .with_cleanup_timeout(xline.dial_timeout())
    }

    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }

    /// Bound for each of lock release and session close.
    pub fn with_cleanup_timeout(mut self, cleanup_timeout: Duration) -> Self {
        self.cleanup_timeout = cleanup_timeout;
        self
    }

    pub fn lock_name(&self) -> &str {
        &self.lock_name
    }

    pub async fn run(&self, deadline: Instant, target: &Path) -> Result<BackupReport, BackupError> {
        self.run_with_cancel(deadline, target, &CancellationToken::new())
            .await
    }

    pub async fn run_with_cancel(
        &self,
        deadline: Instant,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<BackupReport, BackupError> {
        match tokio::fs::try_exists(target).await {
            Ok(false) => {}
            Ok(true) => return Err(BackupError::TargetExists(target.to_path_buf())),
            Err(e) => return Err(BackupError::Snapshot(SnapshotError::Io(e))),
        }

        let mut session = self.connect(deadline).await?;
        info!("Established coordination session {:#x}", session.id());

        // every path past this point goes through cleanup
        let mut lock = None;
        let result = self
            .locked_snapshot(session.as_mut(), &mut lock, deadline, target, cancel)
            .await;
        let warnings = self.cleanup(session, lock).await;

        let info = result?;
        info!(
            "Snapshot saved successfully at {} ({} bytes)",
            info.path.display(),
            info.size
        );
        Ok(BackupReport {
            path: info.path,
            size: info.size,
            took: info.took,
            server_version: info.server_version,
            warnings,
        })
    }

    async fn connect(&self, deadline: Instant) -> Result<Box<dyn Session>, BackupError> {
        let budget = self
            .dial_timeout
            .min(deadline.saturating_duration_since(Instant::now()));
        match timeout(budget, self.coordinator.connect()).await {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(e)) => Err(BackupError::Connection(e)),
            Err(_) => Err(BackupError::Connection(CoordinationError::DialTimeout(
                budget,
            ))),
        }
    }

    async fn locked_snapshot(
        &self,
        session: &mut dyn Session,
        lock: &mut Option<LockHandle>,
        deadline: Instant,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<SnapshotInfo, BackupError> {
        let session_id = session.id();
        let liveness = session.liveness();

        info!("Waiting for lock {}", self.lock_name);
        let waiting_since = Instant::now();
        let acquired = tokio::select! {
            res = timeout_at(deadline, session.lock(&self.lock_name)) => res,
            _ = cancel.cancelled() => return Err(BackupError::Cancelled),
        };
        let handle = match acquired {
            Ok(Ok(handle)) => handle,
            Ok(Err(source)) => {
                return Err(BackupError::Lock {
                    lock_name: self.lock_name.clone(),
                    source,
                });
            }
            Err(_) => {
                return Err(BackupError::LockTimeout {
                    lock_name: self.lock_name.clone(),
                    waited: waiting_since.elapsed(),
                });
            }
        };
        info!(
            "Acquired lock {} as {}",
            handle.name,
            String::from_utf8_lossy(&handle.key)
        );
        *lock = Some(handle);

        if !liveness.is_alive() {
            return Err(BackupError::SessionLost(session_id));
        }

        info!("Starting snapshot backup into {}", target.display());
        tokio::select! {
            res = self.snapshotter.save(target) => res.map_err(BackupError::Snapshot),
            _ = sleep_until(deadline) => {
                Err(BackupError::Snapshot(SnapshotError::DeadlineExceeded))
            }
            _ = liveness.lost() => Err(BackupError::SessionLost(session_id)),
            _ = cancel.cancelled() => Err(BackupError::Cancelled),
        }
    }

    async fn cleanup(
        &self,
        mut session: Box<dyn Session>,
        lock: Option<LockHandle>,
    ) -> Vec<CleanupWarning> {
        let mut warnings = Vec::new();
        let session_id = session.id();

        if let Some(lock) = lock {
            let lock_name = lock.name.clone();
            match timeout(self.cleanup_timeout, session.unlock(lock)).await {
                Ok(Ok(())) => info!("Released lock {lock_name}"),
                Ok(Err(source)) => warnings.push(CleanupWarning::Release { lock_name, source }),
                Err(_) => warnings.push(CleanupWarning::TimedOut {
                    step: "lock release",
                    after: self.cleanup_timeout,
                }),
            }
        }

        match timeout(self.cleanup_timeout, session.close()).await {
            Ok(Ok(())) => info!("Closed coordination session {session_id:#x}"),
            Ok(Err(source)) => warnings.push(CleanupWarning::Close {
                session: session_id,
                source,
            }),
            Err(_) => warnings.push(CleanupWarning::TimedOut {
                step: "session close",
                after: self.cleanup_timeout,
            }),
        }

        for w in &warnings {
            warn!("{w}; lease expiry will free the lock");
        }
        warnings
    }
}
