use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, LeaseKeepAliveStream, LeaseKeeper, LockOptions};
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep, timeout};

use super::{CoordinationError, Coordinator, LockHandle, Session, SessionLiveness};
use crate::config::XlineConfig;

pub(crate) fn connect_options(config: &XlineConfig) -> ConnectOptions {
    let opts = ConnectOptions::new().with_connect_timeout(config.dial_timeout());
    if let (Some(user), Some(pass)) = (&config.username, &config.password) {
        opts.with_user(user.clone(), pass.clone())
    } else {
        opts
    }
}

/// Dials Xline (or any etcd v3 endpoint) and opens lease-backed sessions.
#[derive(Debug, Clone)]
pub struct XlineCoordinator {
    config: XlineConfig,
}

impl XlineCoordinator {
    pub fn new(config: XlineConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Coordinator for XlineCoordinator {
    async fn connect(&self) -> Result<Box<dyn Session>, CoordinationError> {
        let dial_timeout = self.config.dial_timeout();
        let establish = async {
            let client = Client::connect(
                self.config.endpoints.clone(),
                Some(connect_options(&self.config)),
            )
            .await?;
            XlineSession::establish(client, self.config.session_ttl_secs).await
        };
        // a lease granted just before the timeout fires is not revoked; it owns
        // no lock yet and the server drops it after ttl
        let session = timeout(dial_timeout, establish)
            .await
            .map_err(|_| CoordinationError::DialTimeout(dial_timeout))??;
        Ok(Box::new(session))
    }
}

pub struct XlineSession {
    client: Client,
    lease_id: i64,
    liveness: SessionLiveness,
    keepalive: JoinHandle<()>,
}

impl XlineSession {
    /// Grants a lease with `ttl` seconds and keeps it alive in the background.
    pub async fn establish(mut client: Client, ttl: i64) -> Result<Self, CoordinationError> {
        let grant = client.lease_grant(ttl, None).await?;
        let lease_id = grant.id();
        let (keeper, stream) = client.lease_keep_alive(lease_id).await?;
        let (tx, liveness) = SessionLiveness::channel();
        let keepalive = spawn_keepalive(keeper, stream, lease_id, grant.ttl(), tx);
        info!("Granted session lease {lease_id:#x} with ttl {}s", grant.ttl());
        Ok(Self {
            client,
            lease_id,
            liveness,
            keepalive,
        })
    }
}

fn spawn_keepalive(
    mut keeper: LeaseKeeper,
    mut stream: LeaseKeepAliveStream,
    lease_id: i64,
    ttl: i64,
    tx: watch::Sender<bool>,
) -> JoinHandle<()> {
    let interval = Duration::from_millis((ttl.max(1) as u64 * 1000) / 3);
    tokio::spawn(async move {
        loop {
            if let Err(e) = keeper.keep_alive().await {
                warn!("Failed to send keepalive for lease {lease_id:#x}: {e}");
                break;
            }
            match stream.message().await {
                Ok(Some(resp)) if resp.ttl() > 0 => {
                    debug!("Lease {lease_id:#x} renewed, ttl {}s", resp.ttl());
                }
                Ok(Some(_)) => {
                    warn!("Lease {lease_id:#x} expired on the server");
                    break;
                }
                Ok(None) => {
                    warn!("Keepalive stream for lease {lease_id:#x} closed");
                    break;
                }
                Err(e) => {
                    warn!("Keepalive for lease {lease_id:#x} failed: {e}");
                    break;
                }
            }
            sleep(interval).await;
        }
        let _ = tx.send(false);
    })
}

#[async_trait]
impl Session for XlineSession {
    fn id(&self) -> i64 {
        self.lease_id
    }

    fn liveness(&self) -> SessionLiveness {
        self.liveness.clone()
    }

    async fn lock(&mut self, name: &str) -> Result<LockHandle, CoordinationError> {
        if !self.liveness.is_alive() {
            return Err(CoordinationError::LeaseExpired(self.lease_id));
        }
        let opts = LockOptions::new().with_lease(self.lease_id);
        let resp = self.client.lock(name, Some(opts)).await?;
        Ok(LockHandle::new(name, resp.key().to_vec(), self.lease_id))
    }

    async fn unlock(&mut self, lock: LockHandle) -> Result<(), CoordinationError> {
        self.client.unlock(lock.key).await?;
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<(), CoordinationError> {
        self.keepalive.abort();
        self.client.lease_revoke(self.lease_id).await?;
        info!("Revoked session lease {:#x}", self.lease_id);
        Ok(())
    }
}

impl Drop for XlineSession {
    fn drop(&mut self) {
        // the lease still expires on its own after ttl
        self.keepalive.abort();
    }
}
