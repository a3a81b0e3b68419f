//! Connection pool management.
//!
//! The pool owns a fixed set of sessions opened up front and lends one at a time through a
//! [`Lease`]. Two modes exist:
//!
//! - [`PoolMode::Serialized`]: a single pool-wide mutex is held for the whole lease, so at
//!   most one lease is outstanding regardless of pool size and every operation of the
//!   provider is totally ordered. The round-robin cursor only decides which physical
//!   session is used next.
//! - [`PoolMode::Independent`]: every session has its own lock and a semaphore with one
//!   permit per session hands out genuinely independent leases.
//!
//! There is no health checking, reconnection or resizing. Errors from sessions propagate
//! unchanged.

use crate::db::connection::{Connector, Row, SqlConnection};
use crate::error::{ProviderError, ProviderResult};
use clap::ValueEnum;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

type Slot = Arc<Mutex<Box<dyn SqlConnection>>>;

/// How leases are handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolMode {
    /// One lease at a time across the whole pool.
    Serialized,
    /// One lease per session, up to the pool size concurrently.
    #[default]
    Independent,
}

impl std::fmt::Display for PoolMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialized => write!(f, "serialized"),
            Self::Independent => write!(f, "independent"),
        }
    }
}

pub struct ConnectionPool {
    slots: Vec<Slot>,
    /// Index of the next slot to hand out.
    cursor: std::sync::Mutex<usize>,
    mode: PoolMode,
    /// Pool-wide lock used in serialized mode.
    global: Arc<Mutex<()>>,
    /// One permit per slot, used in independent mode.
    permits: Arc<Semaphore>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("size", &self.slots.len())
            .field("mode", &self.mode)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl ConnectionPool {
    /// Open `size` sessions through `connector`.
    ///
    /// If any session fails to open, the ones already opened are closed and the error is
    /// returned.
    pub async fn connect(
        connector: &dyn Connector,
        size: usize,
        mode: PoolMode,
    ) -> ProviderResult<Self> {
        if size == 0 {
            return Err(ProviderError::invalid_argument(
                "Pool size must be greater than 0",
            ));
        }

        info!(backend = connector.name(), size, mode = %mode, "Opening connection pool");

        let mut connections = Vec::with_capacity(size);
        for index in 0..size {
            match connector.connect().await {
                Ok(conn) => connections.push(conn),
                Err(e) => {
                    warn!(slot = index, error = %e, "Failed to open pooled session");
                    for mut conn in connections {
                        let _ = conn.close().await;
                    }
                    return Err(e);
                }
            }
        }

        Self::from_connections(connections, mode)
    }

    /// Build a pool from sessions that are already open. Order is kept as the
    /// round-robin order.
    pub fn from_connections(
        connections: Vec<Box<dyn SqlConnection>>,
        mode: PoolMode,
    ) -> ProviderResult<Self> {
        if connections.is_empty() {
            return Err(ProviderError::invalid_argument(
                "Pool size must be greater than 0",
            ));
        }
        let size = connections.len();
        Ok(Self {
            slots: connections
                .into_iter()
                .map(|conn| Arc::new(Mutex::new(conn)))
                .collect(),
            cursor: std::sync::Mutex::new(0),
            mode,
            global: Arc::new(Mutex::new(())),
            permits: Arc::new(Semaphore::new(size)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn mode(&self) -> PoolMode {
        self.mode
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Take the cursor's slot index and advance the cursor.
    fn next_index(&self) -> usize {
        let mut cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
        let index = *cursor;
        *cursor = (*cursor + 1) % self.slots.len();
        index
    }

    /// Wait for exclusive use of one session.
    ///
    /// The lease must be released (via [`Lease::unlock`] or by dropping it) before any
    /// other caller can obtain the same session; in serialized mode, before any caller can
    /// obtain any session. There is no timeout.
    pub async fn lock(&self) -> ProviderResult<Lease> {
        if self.is_closed() {
            return Err(ProviderError::PoolClosed);
        }

        match self.mode {
            PoolMode::Serialized => {
                let global = self.global.clone().lock_owned().await;
                if self.is_closed() {
                    return Err(ProviderError::PoolClosed);
                }
                let index = self.next_index();
                let conn = self.slots[index].clone().lock_owned().await;
                debug!(slot = index, "Lease acquired (serialized)");
                Ok(Lease {
                    conn,
                    index,
                    _hold: Hold::Global(global),
                })
            }
            PoolMode::Independent => {
                let permit = self
                    .permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| ProviderError::PoolClosed)?;
                if self.is_closed() {
                    return Err(ProviderError::PoolClosed);
                }
                let start = self.next_index();
                // A permit guarantees at least one slot is free
                for offset in 0..self.slots.len() {
                    let index = (start + offset) % self.slots.len();
                    if let Ok(conn) = self.slots[index].clone().try_lock_owned() {
                        // close() may have taken and closed this session since the check above
                        if self.is_closed() {
                            return Err(ProviderError::PoolClosed);
                        }
                        debug!(slot = index, "Lease acquired (independent)");
                        return Ok(Lease {
                            conn,
                            index,
                            _hold: Hold::Permit(permit),
                        });
                    }
                }
                Err(ProviderError::internal(
                    "No free session although a permit was granted",
                ))
            }
        }
    }

    /// Execute one statement on the next session: lock, delegate, unlock.
    pub async fn execute(&self, sql: &str, args: &[String]) -> ProviderResult<u64> {
        let mut lease = self.lock().await?;
        let result = lease.execute(sql, args).await;
        lease.unlock();
        result
    }

    /// Run one query on the next session: lock, delegate, unlock.
    pub async fn fetch(&self, sql: &str, args: &[String]) -> ProviderResult<Vec<Row>> {
        let mut lease = self.lock().await?;
        let result = lease.fetch(sql, args).await;
        lease.unlock();
        result
    }

    /// Close every session once no lease is outstanding. Later `lock` calls fail with
    /// [`ProviderError::PoolClosed`]. Closing twice is a no-op.
    pub async fn close(&self) -> ProviderResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let _global = self.global.lock().await;
        let mut first_error = None;
        for (index, slot) in self.slots.iter().enumerate() {
            let mut conn = slot.lock().await;
            if let Err(e) = conn.close().await {
                warn!(slot = index, error = %e, "Failed to close pooled session");
                first_error.get_or_insert(e);
            }
        }
        self.permits.close();
        info!(size = self.slots.len(), "Connection pool closed");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// What keeps other callers out while a lease lives.
enum Hold {
    Global(#[allow(dead_code)] OwnedMutexGuard<()>),
    Permit(#[allow(dead_code)] OwnedSemaphorePermit),
}

/// Exclusive use of one pooled session, including its transaction state.
///
/// Field order matters: the session guard drops before the pool-wide hold, so a slot is
/// always free by the time its permit returns.
pub struct Lease {
    conn: OwnedMutexGuard<Box<dyn SqlConnection>>,
    index: usize,
    _hold: Hold,
}

impl Lease {
    /// Index of the leased session in creation order.
    pub fn slot(&self) -> usize {
        self.index
    }

    /// Release the lease. Equivalent to dropping it.
    pub fn unlock(self) {
        debug!(slot = self.index, "Lease released");
    }
}

impl Deref for Lease {
    type Target = dyn SqlConnection;

    fn deref(&self) -> &Self::Target {
        &**self.conn
    }
}

impl DerefMut for Lease {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.conn
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("slot", &self.index).finish()
    }
}
