use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

pub mod xline;

pub use xline::{XlineCoordinator, XlineSession};

#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    #[error("could not reach coordination service within {0:?}")]
    DialTimeout(Duration),
    #[error("session lease {0:#x} expired")]
    LeaseExpired(i64),
    #[error(transparent)]
    Xline(#[from] Box<etcd_client::Error>),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<etcd_client::Error> for CoordinationError {
    fn from(e: etcd_client::Error) -> Self {
        CoordinationError::Xline(Box::new(e))
    }
}

/// Ownership of a named lock, valid only while the session lease that
/// acquired it stays alive.
#[derive(Debug)]
pub struct LockHandle {
    pub name: String,
    /// Key the lock service created for this owner; needed to unlock.
    pub key: Vec<u8>,
    pub lease: i64,
    pub acquired_at: DateTime<Utc>,
}

impl LockHandle {
    pub fn new(name: impl Into<String>, key: Vec<u8>, lease: i64) -> Self {
        Self {
            name: name.into(),
            key,
            lease,
            acquired_at: Utc::now(),
        }
    }
}

/// Observes whether a session's lease is still being kept alive.
#[derive(Debug, Clone)]
pub struct SessionLiveness {
    rx: watch::Receiver<bool>,
}

impl SessionLiveness {
    /// Returns the sender the keepalive side flips to `false` on lease loss.
    /// Dropping the sender counts as losing the lease.
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(true);
        (tx, Self { rx })
    }

    pub fn is_alive(&self) -> bool {
        *self.rx.borrow() && self.rx.has_changed().is_ok()
    }

    /// Resolves once the lease is gone.
    pub async fn lost(mut self) {
        loop {
            if !*self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Dials the service and establishes a lease-backed session.
    async fn connect(&self) -> Result<Box<dyn Session>, CoordinationError>;
}

#[async_trait]
pub trait Session: Send + Sync {
    fn id(&self) -> i64;

    fn liveness(&self) -> SessionLiveness;

    /// Blocks until the named lock is held by this session.
    async fn lock(&mut self, name: &str) -> Result<LockHandle, CoordinationError>;

    async fn unlock(&mut self, lock: LockHandle) -> Result<(), CoordinationError>;

    /// Stops the keepalive and gives the lease back, dropping every lock it owns.
    async fn close(self: Box<Self>) -> Result<(), CoordinationError>;
}
