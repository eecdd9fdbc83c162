use futures::TryStreamExt;
use miwa::derive::Injectable;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::core::{
    db::edr::{EdrStoreRef, QuerySpec, StoreError},
    lock::{EdrLockRef, LockError, LockHandle, LockOutcome},
    model::edr::{CachedEdr, EdrCredential, EdrEntry, StateError},
};

use super::refresh::TokenRefresherRef;

const RESTORE_ATTEMPTS: usize = 3;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResolveMode {
    /// Return whatever is cached.
    #[default]
    Plain,
    /// Refresh the credential first when it is expired.
    RefreshIfExpired,
}

/// Read path of the EDR cache. Coordinates refreshes so that at most one
/// caller per transfer process talks to the provider at a time.
#[derive(Clone, Injectable)]
pub struct EdrService {
    store: EdrStoreRef,
    lock: EdrLockRef,
    refresher: TokenRefresherRef,
}

impl EdrService {
    pub fn new(store: EdrStoreRef, lock: EdrLockRef, refresher: TokenRefresherRef) -> Self {
        Self {
            store,
            lock,
            refresher,
        }
    }

    /// Returns the credential of `transfer_process_id`. Once an entry has been
    /// read, every failure carries its credential as the stale fallback, only a
    /// missing entry fails outright.
    pub async fn resolve(
        &self,
        transfer_process_id: &str,
        mode: ResolveMode,
    ) -> Result<EdrCredential, EdrServiceError> {
        let cached = self.find_by_id(transfer_process_id).await?;

        if mode == ResolveMode::Plain || !self.lock.is_expired(&cached.credential, &cached.entry) {
            return Ok(cached.credential);
        }

        let stale = cached.credential;
        let refreshed = self.refresh_expired(transfer_process_id, &stale).await;
        refreshed.map_err(|err| err.with_stale(transfer_process_id, stale))
    }

    async fn refresh_expired(
        &self,
        transfer_process_id: &str,
        credential: &EdrCredential,
    ) -> Result<EdrCredential, EdrServiceError> {
        debug!("EDR {} is expired, acquiring refresh lock", transfer_process_id);

        match self.lock.acquire_lock(transfer_process_id, credential).await? {
            LockOutcome::Fresh => self
                .store
                .resolve_reference(transfer_process_id)
                .await?
                .ok_or_else(|| EdrServiceError::NotFound(transfer_process_id.to_string())),
            LockOutcome::Acquired(handle) => {
                let guard = LockGuard::new(self.lock.clone(), handle);

                let refreshed = self.refresh_locked(transfer_process_id).await;

                match (refreshed, guard.release().await) {
                    (Ok(credential), Ok(())) => Ok(credential),
                    (Ok(_), Err(err)) => Err(err.into()),
                    (Err(err), Ok(())) => Err(err),
                    (Err(err), Err(release)) => {
                        error!(
                            "Failed to release refresh lock of EDR {}: {}",
                            transfer_process_id, release
                        );
                        Err(err)
                    }
                }
            }
        }
    }

    /// Runs a refresh while holding the lock of `transfer_process_id`. Once the
    /// entry is `REFRESHING`, every failure puts it back to `NEGOTIATED`.
    async fn refresh_locked(
        &self,
        transfer_process_id: &str,
    ) -> Result<EdrCredential, EdrServiceError> {
        let leased = self.store.find_by_id_and_lease(transfer_process_id).await?;

        let mut entry = leased.edr.entry;
        if let Err(err) = entry.transition_to_refreshing() {
            self.store.break_lease(&leased.lease).await?;
            return Err(err.into());
        }
        let entry = match self.store.update(entry).await {
            Ok(entry) => entry,
            Err(err) => {
                if let Err(release) = self.store.break_lease(&leased.lease).await {
                    warn!(
                        "Failed to break lease of EDR {}: {}",
                        transfer_process_id, release
                    );
                }
                return Err(err.into());
            }
        };
        let edr = CachedEdr::new(entry, leased.edr.credential);

        info!("Refreshing EDR {}", transfer_process_id);

        let refreshed = match self.refresher.refresh(&edr).await {
            Ok(credential) => self.commit_refreshed(transfer_process_id, credential).await,
            Err(source) => Err(EdrServiceError::RefreshFailed {
                id: transfer_process_id.to_string(),
                stale: Box::new(edr.credential),
                source,
            }),
        };

        match refreshed {
            Ok(credential) => {
                info!("Refreshed EDR {}", transfer_process_id);
                Ok(credential)
            }
            Err(EdrServiceError::NotFound(id)) => {
                debug!("EDR {} was deleted while refreshing", id);
                Err(EdrServiceError::NotFound(id))
            }
            Err(err) => {
                let detail = failure_detail(&err);
                warn!("Failed to refresh EDR {}: {}", transfer_process_id, detail);

                if let Err(reset) = self.restore_negotiated(transfer_process_id, detail).await {
                    error!(
                        "Failed to reset EDR {} after a failed refresh: {}",
                        transfer_process_id, reset
                    );
                }
                Err(err)
            }
        }
    }

    /// Stores a refreshed credential. The refresh lock is held, so no lease is
    /// taken. A delete that happened during the refresh wins.
    async fn commit_refreshed(
        &self,
        transfer_process_id: &str,
        credential: EdrCredential,
    ) -> Result<EdrCredential, EdrServiceError> {
        let mut entry = self.find_by_id(transfer_process_id).await?.entry;
        entry.error_detail = None;

        self.store.save(entry, credential.clone()).await?;
        Ok(credential)
    }

    async fn restore_negotiated(
        &self,
        transfer_process_id: &str,
        error_detail: String,
    ) -> Result<(), EdrServiceError> {
        for _ in 0..RESTORE_ATTEMPTS {
            let Some(cached) = self.store.find_by_id(transfer_process_id).await? else {
                return Ok(());
            };

            let mut entry = cached.entry;
            entry.transition_to_negotiated()?;
            entry.error_detail = Some(error_detail.clone());

            match self.store.update(entry).await {
                Ok(_) => return Ok(()),
                Err(StoreError::Conflict(_)) => continue,
                Err(StoreError::NotFound(_)) => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        }

        Err(StoreError::Conflict(transfer_process_id.to_string()).into())
    }

    pub async fn save(
        &self,
        entry: EdrEntry,
        credential: EdrCredential,
    ) -> Result<(), EdrServiceError> {
        debug!("Caching EDR {}", entry.transfer_process_id);
        Ok(self.store.save(entry, credential).await?)
    }

    pub async fn find_by_id(&self, transfer_process_id: &str) -> Result<CachedEdr, EdrServiceError> {
        self.store
            .find_by_id(transfer_process_id)
            .await?
            .ok_or_else(|| EdrServiceError::NotFound(transfer_process_id.to_string()))
    }

    pub async fn query(&self, spec: QuerySpec) -> Result<Vec<EdrEntry>, EdrServiceError> {
        Ok(self
            .store
            .query_for_entries(spec)
            .try_collect::<Vec<_>>()
            .await?)
    }

    pub async fn references_for_asset(
        &self,
        asset_id: &str,
        provider_id: Option<String>,
    ) -> Result<Vec<EdrCredential>, EdrServiceError> {
        Ok(self
            .store
            .references_for_asset(asset_id, provider_id)
            .await?)
    }

    pub async fn delete_by_transfer_process_id(
        &self,
        transfer_process_id: &str,
    ) -> Result<EdrEntry, EdrServiceError> {
        debug!("Deleting EDR {}", transfer_process_id);
        Ok(self
            .store
            .delete_by_transfer_process_id(transfer_process_id)
            .await?)
    }
}

/// Releases a held refresh lock when dropped without an explicit release,
/// e.g. when the resolving future is cancelled.
struct LockGuard {
    lock: EdrLockRef,
    handle: Option<LockHandle>,
}

impl LockGuard {
    fn new(lock: EdrLockRef, handle: LockHandle) -> Self {
        Self {
            lock,
            handle: Some(handle),
        }
    }

    async fn release(mut self) -> Result<(), LockError> {
        match self.handle.take() {
            Some(handle) => self.lock.release_lock(&handle).await,
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        let lock = self.lock.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    debug!("Releasing abandoned refresh lock of EDR {}", handle.key());
                    if let Err(err) = lock.release_lock(&handle).await {
                        error!(
                            "Failed to release refresh lock of EDR {}: {}",
                            handle.key(),
                            err
                        );
                    }
                });
            }
            Err(_) => error!(
                "No runtime available to release refresh lock of EDR {}",
                handle.key()
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum EdrServiceError {
    #[error("EDR {0} not found")]
    NotFound(String),
    #[error("Failed to refresh EDR {id}")]
    RefreshFailed {
        id: String,
        stale: Box<EdrCredential>,
        #[source]
        source: anyhow::Error,
    },
    #[error("Timed out waiting for the refresh of EDR {id}")]
    LockTimeout {
        id: String,
        stale: Box<EdrCredential>,
        #[source]
        source: LockError,
    },
    #[error("No fresh credential available for EDR {id}")]
    Unavailable {
        id: String,
        stale: Box<EdrCredential>,
        #[source]
        source: Box<EdrServiceError>,
    },
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Lock(LockError),
    #[error(transparent)]
    State(#[from] StateError),
}

impl EdrServiceError {
    /// The last known credential, when the failure happened after one was read.
    pub fn stale_credential(&self) -> Option<&EdrCredential> {
        match self {
            EdrServiceError::RefreshFailed { stale, .. }
            | EdrServiceError::LockTimeout { stale, .. }
            | EdrServiceError::Unavailable { stale, .. } => Some(stale),
            _ => None,
        }
    }

    fn with_stale(self, id: &str, stale: EdrCredential) -> Self {
        match self {
            err @ (EdrServiceError::NotFound(_)
            | EdrServiceError::RefreshFailed { .. }
            | EdrServiceError::LockTimeout { .. }
            | EdrServiceError::Unavailable { .. }) => err,
            EdrServiceError::Lock(source @ LockError::Timeout(..)) => EdrServiceError::LockTimeout {
                id: id.to_string(),
                stale: Box::new(stale),
                source,
            },
            source => EdrServiceError::Unavailable {
                id: id.to_string(),
                stale: Box::new(stale),
                source: Box::new(source),
            },
        }
    }
}

fn failure_detail(err: &EdrServiceError) -> String {
    match err {
        EdrServiceError::RefreshFailed { source, .. } => format!("{source:#}"),
        err => err.to_string(),
    }
}

impl From<StoreError> for EdrServiceError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(id) => EdrServiceError::NotFound(id),
            err => EdrServiceError::Store(err),
        }
    }
}

impl From<LockError> for EdrServiceError {
    fn from(value: LockError) -> Self {
        match value {
            LockError::Store(err) => err.into(),
            err => EdrServiceError::Lock(err),
        }
    }
}
