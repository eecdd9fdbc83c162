use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miwa::derive::interface;
use thiserror::Error;
use uuid::Uuid;

#[cfg(test)]
use mockall::{automock, predicate::*};

use crate::core::{
    db::edr::StoreError,
    model::edr::{EdrCredential, EdrEntry},
};

pub mod memory;

/// Serializes refreshes of the same EDR.
///
/// `acquire_lock` blocks until the caller is the only one holding the key, then
/// checks again whether the stored credential is still expired. Only an
/// [`LockOutcome::Acquired`] result leaves the key locked, and the returned
/// handle must be passed to `release_lock` on every exit path.
#[async_trait]
#[interface]
#[cfg_attr(test, automock)]
pub trait EdrLock {
    async fn acquire_lock(
        &self,
        transfer_process_id: &str,
        credential: &EdrCredential,
    ) -> Result<LockOutcome, LockError>;

    /// Idempotent. Releasing with a handle that does not own the key is a no-op.
    async fn release_lock(&self, handle: &LockHandle) -> Result<(), LockError>;

    fn is_expired(&self, credential: &EdrCredential, entry: &EdrEntry) -> bool;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockHandle {
    key: String,
    owner: Uuid,
}

impl LockHandle {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            owner: Uuid::new_v4(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum LockOutcome {
    /// The credential is still expired and the caller now owns its refresh.
    Acquired(LockHandle),
    /// Somebody refreshed the credential while the caller was waiting.
    Fresh,
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Timed out after {1:?} waiting for the refresh lock of EDR {0}")]
    Timeout(String, Duration),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Generic(#[from] anyhow::Error),
}

/// `true` once `now` has reached the credential expiry. Credentials without
/// expiry never expire.
pub fn is_expired(credential: &EdrCredential, entry: &EdrEntry) -> bool {
    is_expired_at(credential, entry, Utc::now())
}

pub fn is_expired_at(credential: &EdrCredential, entry: &EdrEntry, now: DateTime<Utc>) -> bool {
    credential
        .expiry(entry)
        .map(|expiry| now >= expiry)
        .unwrap_or(false)
}
