use std::path::PathBuf;
use std::time::Duration;

use crate::coordination::CoordinationError;
use crate::snapshot::SnapshotError;

/// Terminal outcome of a failed backup run.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("backup target {0} already exists")]
    TargetExists(PathBuf),
    #[error("failed to connect to coordination service: {0}")]
    Connection(#[source] CoordinationError),
    #[error("timed out after {waited:?} waiting for lock {lock_name}")]
    LockTimeout { lock_name: String, waited: Duration },
    #[error("failed to acquire lock {lock_name}: {source}")]
    Lock {
        lock_name: String,
        #[source]
        source: CoordinationError,
    },
    #[error("session lease {0:#x} lost while holding the backup lock")]
    SessionLost(i64),
    #[error("failed to save snapshot: {0}")]
    Snapshot(#[source] SnapshotError),
    #[error("backup cancelled")]
    Cancelled,
}

/// Teardown failure after the outcome of a run was already decided.
#[derive(Debug, thiserror::Error)]
pub enum CleanupWarning {
    #[error("failed to release lock {lock_name}: {source}")]
    Release {
        lock_name: String,
        #[source]
        source: CoordinationError,
    },
    #[error("failed to close session {session:#x}: {source}")]
    Close {
        session: i64,
        #[source]
        source: CoordinationError,
    },
    #[error("{step} did not finish within {after:?}")]
    TimedOut { step: &'static str, after: Duration },
}
