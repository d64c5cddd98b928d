#![allow(dead_code)]
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use rkbackup::coordination::{
    CoordinationError, Coordinator, LockHandle, Session, SessionLiveness,
};
use rkbackup::snapshot::{SnapshotError, SnapshotInfo, SnapshotSource};
use tokio::sync::{Mutex, OwnedMutexGuard, watch};

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp_secs()
            .is_test(true)
            .try_init();
    });
}

/// Named mutexes shared by every coordinator built on the same table,
/// standing in for the cluster-side lock service.
#[derive(Default)]
pub struct LockTable {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    next_lease: AtomicI64,
}

impl LockTable {
    fn mutex(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks.entry(name.to_string()).or_default().clone()
    }
}

#[derive(Default, Clone)]
pub struct Behavior {
    pub fail_connect: bool,
    pub hang_connect: bool,
    pub hang_lock: bool,
    pub fail_lock: bool,
    pub dead_at_lock: bool,
    pub fail_unlock: bool,
    pub hang_unlock: bool,
    pub fail_close: bool,
    pub expire_after_lock: Option<Duration>,
}

#[derive(Default)]
pub struct Counters {
    pub connects: AtomicUsize,
    pub locks: AtomicUsize,
    pub unlocks: AtomicUsize,
    pub closes: AtomicUsize,
}

impl Counters {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
    pub fn locks(&self) -> usize {
        self.locks.load(Ordering::SeqCst)
    }
    pub fn unlocks(&self) -> usize {
        self.unlocks.load(Ordering::SeqCst)
    }
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

pub struct MockCoordinator {
    table: Arc<LockTable>,
    behavior: Behavior,
    pub counters: Arc<Counters>,
}

impl MockCoordinator {
    pub fn new(table: Arc<LockTable>, behavior: Behavior) -> Self {
        Self {
            table,
            behavior,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn healthy(table: Arc<LockTable>) -> Self {
        Self::new(table, Behavior::default())
    }
}

#[async_trait]
impl Coordinator for MockCoordinator {
    async fn connect(&self) -> Result<Box<dyn Session>, CoordinationError> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        if self.behavior.hang_connect {
            std::future::pending::<()>().await;
        }
        if self.behavior.fail_connect {
            return Err(CoordinationError::Other(anyhow!("connection refused")));
        }
        let (tx, liveness) = SessionLiveness::channel();
        Ok(Box::new(MockSession {
            id: self.table.next_lease.fetch_add(1, Ordering::SeqCst) + 1,
            table: self.table.clone(),
            behavior: self.behavior.clone(),
            counters: self.counters.clone(),
            held: HashMap::new(),
            tx: Arc::new(tx),
            liveness,
        }))
    }
}

pub struct MockSession {
    id: i64,
    table: Arc<LockTable>,
    behavior: Behavior,
    counters: Arc<Counters>,
    held: HashMap<Vec<u8>, OwnedMutexGuard<()>>,
    tx: Arc<watch::Sender<bool>>,
    liveness: SessionLiveness,
}

#[async_trait]
impl Session for MockSession {
    fn id(&self) -> i64 {
        self.id
    }

    fn liveness(&self) -> SessionLiveness {
        self.liveness.clone()
    }

    async fn lock(&mut self, name: &str) -> Result<LockHandle, CoordinationError> {
        if self.behavior.hang_lock {
            std::future::pending::<()>().await;
        }
        if self.behavior.fail_lock {
            return Err(CoordinationError::Other(anyhow!("lock request rejected")));
        }
        let guard = self.table.mutex(name).lock_owned().await;
        let key = format!("{name}/{:x}", self.id).into_bytes();
        self.held.insert(key.clone(), guard);
        self.counters.locks.fetch_add(1, Ordering::SeqCst);

        if self.behavior.dead_at_lock {
            let _ = self.tx.send(false);
        }
        if let Some(after) = self.behavior.expire_after_lock {
            let tx = self.tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                let _ = tx.send(false);
            });
        }
        Ok(LockHandle::new(name, key, self.id))
    }

    async fn unlock(&mut self, lock: LockHandle) -> Result<(), CoordinationError> {
        self.counters.unlocks.fetch_add(1, Ordering::SeqCst);
        if self.behavior.hang_unlock {
            std::future::pending::<()>().await;
        }
        if self.behavior.fail_unlock {
            return Err(CoordinationError::Other(anyhow!("unlock rejected")));
        }
        self.held.remove(&lock.key);
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<(), CoordinationError> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        // revoking the lease drops every lock of the session
        self.held.clear();
        if self.behavior.fail_close {
            return Err(CoordinationError::Other(anyhow!("lease revoke failed")));
        }
        Ok(())
    }
}

/// Writes a fixed payload after an optional delay and records overlap.
pub struct MockSnapshot {
    payload: Vec<u8>,
    delay: Duration,
    failure: Option<String>,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MockSnapshot {
    pub fn writing(payload: &[u8]) -> Self {
        Self {
            payload: payload.to_vec(),
            delay: Duration::ZERO,
            failure: None,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::writing(b"")
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SnapshotSource for MockSnapshot {
    async fn save(&self, dest: &Path) -> Result<SnapshotInfo, SnapshotError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _active = ActiveGuard(&self.active);
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        let started = tokio::time::Instant::now();
        tokio::time::sleep(self.delay).await;
        if let Some(message) = &self.failure {
            return Err(SnapshotError::Io(std::io::Error::other(message.clone())));
        }
        tokio::fs::write(dest, &self.payload).await?;
        Ok(SnapshotInfo {
            path: dest.to_path_buf(),
            size: self.payload.len() as u64,
            took: started.elapsed(),
            server_version: Some("3.5.0".to_string()),
        })
    }
}
