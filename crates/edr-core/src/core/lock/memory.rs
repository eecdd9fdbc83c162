use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::{
    db::edr::{EdrStoreRef, StoreError},
    model::edr::{EdrCredential, EdrEntry},
};

use super::{is_expired, EdrLock, LockError, LockHandle, LockOutcome};

type KeyLock = Arc<Mutex<()>>;

struct Holder {
    owner: Uuid,
    _guard: OwnedMutexGuard<()>,
}

/// Per-key locks of one process.
///
/// `locks` maps a key to its mutex and `holders` keeps the guard of every key
/// that was handed out as [`LockOutcome::Acquired`]. Both maps are sharded, so
/// their internal locks are only taken for a lookup, an insert or a removal and
/// never while waiting on a key.
///
/// A key mutex is referenced by the table, by every task waiting on it and by
/// the guard of its holder. It is dropped from the table once the table holds
/// the last reference, checked under the shard lock so that no waiter can
/// slip in between the check and the removal.
#[derive(Default)]
pub struct LockTable {
    locks: DashMap<String, KeyLock>,
    holders: DashMap<String, Holder>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with a live mutex.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.holders.contains_key(key)
    }

    fn checkout<'a>(&'a self, key: &str) -> Checkout<'a> {
        let lock = self.locks.entry(key.to_string()).or_default().clone();
        Checkout {
            table: self,
            key: key.to_string(),
            lock: Some(lock),
        }
    }

    fn hold(&self, handle: &LockHandle, guard: OwnedMutexGuard<()>) {
        self.holders.insert(
            handle.key().to_string(),
            Holder {
                owner: handle.owner(),
                _guard: guard,
            },
        );
    }

    fn release(&self, handle: &LockHandle) -> bool {
        let released = self
            .holders
            .remove_if(handle.key(), |_, holder| holder.owner == handle.owner())
            .is_some();

        self.reclaim(handle.key());
        released
    }

    fn reclaim(&self, key: &str) {
        if self
            .locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1)
            .is_some()
        {
            debug!("Dropped idle refresh lock of EDR {}", key);
        }
    }
}

/// A reference to a key mutex that gives the key back to the table when
/// dropped, whether the wait succeeded, timed out or was cancelled.
struct Checkout<'a> {
    table: &'a LockTable,
    key: String,
    lock: Option<KeyLock>,
}

impl Checkout<'_> {
    async fn lock(&self) -> Option<OwnedMutexGuard<()>> {
        match &self.lock {
            Some(lock) => Some(lock.clone().lock_owned().await),
            None => None,
        }
    }
}

impl Drop for Checkout<'_> {
    fn drop(&mut self) {
        self.lock.take();
        self.table.reclaim(&self.key);
    }
}

/// Single process [`EdrLock`] backed by a [`LockTable`].
#[derive(Clone)]
pub struct InMemoryEdrLock {
    table: Arc<LockTable>,
    store: EdrStoreRef,
    timeout: Duration,
}

impl InMemoryEdrLock {
    pub fn new(table: Arc<LockTable>, store: EdrStoreRef, timeout: Duration) -> Self {
        Self {
            table,
            store,
            timeout,
        }
    }

    pub fn table(&self) -> &LockTable {
        &self.table
    }
}

#[async_trait]
impl EdrLock for InMemoryEdrLock {
    async fn acquire_lock(
        &self,
        transfer_process_id: &str,
        credential: &EdrCredential,
    ) -> Result<LockOutcome, LockError> {
        let checkout = self.table.checkout(transfer_process_id);

        let guard = tokio::time::timeout(self.timeout, checkout.lock())
            .await
            .ok()
            .flatten()
            .ok_or_else(|| LockError::Timeout(transfer_process_id.to_string(), self.timeout))?;

        let cached = self
            .store
            .find_by_id(transfer_process_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(transfer_process_id.to_string()))?;

        if !self.is_expired(&cached.credential, &cached.entry) {
            debug!(
                "EDR {} was refreshed while waiting (token changed: {})",
                transfer_process_id,
                cached.credential.auth_token != credential.auth_token
            );
            return Ok(LockOutcome::Fresh);
        }

        debug!("EDR {} is expired, lock acquired for refresh", transfer_process_id);
        let handle = LockHandle::new(transfer_process_id);
        self.table.hold(&handle, guard);
        Ok(LockOutcome::Acquired(handle))
    }

    async fn release_lock(&self, handle: &LockHandle) -> Result<(), LockError> {
        if !self.table.release(handle) {
            warn!(
                "Ignoring release of EDR {} lock by {}, not the current holder",
                handle.key(),
                handle.owner()
            );
        }
        Ok(())
    }

    fn is_expired(&self, credential: &EdrCredential, entry: &EdrEntry) -> bool {
        is_expired(credential, entry)
    }
}
