// src/connection_manager.rs
//
// One cached database handle per (worker, role). Handles are validated on every
// acquire and transparently re-opened with bounded exponential backoff.

use crate::error::{StoreError, SyncError};
use crate::settings::Connection as ConnectionSettings;
use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, info, warn};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMappedMutexGuard, OwnedMutexGuard};
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;

/// Which database a handle points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbRole {
    Source,
    Sink,
}

impl fmt::Display for DbRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbRole::Source => write!(f, "source"),
            DbRole::Sink => write!(f, "sink"),
        }
    }
}

/// Logical worker identity. Callers pick it explicitly; it is not tied to a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub u32);

impl WorkerId {
    pub const MAIN: WorkerId = WorkerId(0);
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Opens and validates handles for a role.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Handle: Send + 'static;

    async fn connect(&self, role: DbRole) -> Result<Self::Handle, StoreError>;

    /// Cheap liveness check (e.g. `SELECT 1`).
    async fn ping(&self, handle: &mut Self::Handle) -> bool;
}

/// Exclusive access to a cached handle. Dropping the lease returns it to the cache.
pub type Lease<H> = OwnedMappedMutexGuard<Option<H>, H>;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl From<&ConnectionSettings> for RetryPolicy {
    fn from(s: &ConnectionSettings) -> Self {
        Self {
            max_retries: s.max_retries,
            base_delay: Duration::from_millis(s.retry_base_delay_ms),
            max_delay: Duration::from_millis(s.retry_max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Delays 2x, 4x, 8x ... the base delay, capped.
    fn strategy(&self) -> impl Iterator<Item = Duration> {
        let factor = self.base_delay.as_millis().min(u64::MAX as u128) as u64;
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.max_delay)
            .take(self.max_retries)
    }
}

type Slot<H> = Arc<Mutex<Option<H>>>;

pub struct ConnectionManager<C: Connector> {
    connector: C,
    slots: DashMap<(WorkerId, DbRole), Slot<C::Handle>>,
    retry: RetryPolicy,
    opened: AtomicUsize,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, retry: RetryPolicy) -> Self {
        Self {
            connector,
            slots: DashMap::new(),
            retry,
            opened: AtomicUsize::new(0),
        }
    }

    /// Returns a live handle for `role`, owned by `worker`.
    ///
    /// The cached handle is pinged first; a dead one is dropped and re-opened.
    /// Fails with [`SyncError::Connectivity`] once every retry is spent.
    pub async fn acquire(&self, worker: WorkerId, role: DbRole) -> Result<Lease<C::Handle>, SyncError> {
        // Clone the slot out so the map shard lock is not held across awaits
        let slot = self
            .slots
            .entry((worker, role))
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone();

        let mut guard = slot.lock_owned().await;

        if let Some(handle) = guard.as_mut() {
            if self.connector.ping(handle).await {
                debug!("Reusing {} connection for {}", role, worker);
            } else {
                warn!("⚠️ Cached {} connection for {} is dead, reconnecting", role, worker);
                *guard = None;
            }
        }

        if guard.is_none() {
            let handle = self.open_with_retry(role).await?;
            *guard = Some(handle);
            self.opened.fetch_add(1, Ordering::Relaxed);
            info!("✅ Opened {} connection for {}", role, worker);
        }

        OwnedMutexGuard::try_map(guard, |h| h.as_mut()).map_err(|_| SyncError::Connectivity {
            role,
            attempts: 0,
            reason: "connection slot emptied while held".to_string(),
        })
    }

    /// Drops the cached handle for (worker, role), if any.
    pub async fn release(&self, worker: WorkerId, role: DbRole) {
        let slot = self.slots.get(&(worker, role)).map(|s| s.value().clone());
        if let Some(slot) = slot {
            slot.lock().await.take();
        }
    }

    /// Total number of handles opened so far (first opens and reconnects).
    pub fn opened_count(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }

    async fn open_with_retry(&self, role: DbRole) -> Result<C::Handle, SyncError> {
        let attempts = AtomicUsize::new(0);
        let result = Retry::spawn(self.retry.strategy(), || {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
            async move {
                let res = self.connector.connect(role).await;
                if let Err(e) = &res {
                    warn!(
                        "{} connect attempt {}/{} failed: {}",
                        role,
                        attempt,
                        self.retry.max_retries + 1,
                        e
                    );
                }
                res
            }
        })
        .await;

        result.map_err(|e| SyncError::Connectivity {
            role,
            attempts: attempts.load(Ordering::Relaxed),
            reason: e.to_string(),
        })
    }
}
