//! Client supervision with at-most-one concurrent restart.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use {
    async_trait::async_trait,
    tokio::sync::{Mutex, RwLock},
    tracing::{debug, warn},
};

#[cfg(feature = "metrics")]
use botbox_metrics::{counter, runtime as runtime_metrics};

use crate::error::{Error, Result};

/// Knows how to check a client and bring up a fresh one.
#[async_trait]
pub trait Relaunch<C>: Send + Sync {
    /// Whether `client` currently answers.
    async fn is_healthy(&self, client: &C) -> bool;

    /// Restart whatever serves the client and return a new handle.
    async fn relaunch(&self) -> Result<C>;
}

/// Hands out a healthy client, restarting the backing service when it stops
/// responding.
///
/// Callers racing on an unhealthy client serialize on the restart lock; the
/// first one restarts, the rest recheck and reuse its client. The restart
/// runs on its own task holding the lock, so a caller that gives up midway
/// neither aborts it nor lets a second restart start.
pub struct Supervisor<C> {
    current: Arc<RwLock<C>>,
    restart: Arc<Mutex<()>>,
    launcher: Arc<dyn Relaunch<C>>,
    restarts: Arc<AtomicU64>,
}

impl<C> Supervisor<C>
where
    C: Clone + Send + Sync + 'static,
{
    pub fn new(client: C, launcher: Arc<dyn Relaunch<C>>) -> Self {
        Self {
            current: Arc::new(RwLock::new(client)),
            restart: Arc::new(Mutex::new(())),
            launcher,
            restarts: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of restarts performed so far.
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    pub async fn client(&self) -> Result<C> {
        let client = self.current.read().await.clone();
        if self.launcher.is_healthy(&client).await {
            return Ok(client);
        }

        let guard = Arc::clone(&self.restart).lock_owned().await;
        let client = self.current.read().await.clone();
        if self.launcher.is_healthy(&client).await {
            debug!("client recovered by a concurrent restart");
            return Ok(client);
        }

        warn!("backend unresponsive, restarting");
        let current = Arc::clone(&self.current);
        let launcher = Arc::clone(&self.launcher);
        let restarts = Arc::clone(&self.restarts);
        let task = tokio::spawn(async move {
            let _guard = guard;
            match launcher.relaunch().await {
                Ok(fresh) => {
                    *current.write().await = fresh.clone();
                    restarts.fetch_add(1, Ordering::Relaxed);
                    #[cfg(feature = "metrics")]
                    counter!(runtime_metrics::PROXY_RESTARTS_TOTAL).increment(1);
                    Ok(fresh)
                },
                Err(e) => {
                    #[cfg(feature = "metrics")]
                    counter!(runtime_metrics::PROXY_RESTART_FAILURES_TOTAL).increment(1);
                    Err(e)
                },
            }
        });
        task.await
            .map_err(|e| Error::external("restart task failed", e))?
    }
}
