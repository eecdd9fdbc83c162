use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use edc_edr_core::core::{
    db::edr::StoreError,
    lock::{is_expired, EdrLock, LockError, LockHandle, LockOutcome},
    model::edr::{EdrCredential, EdrEntry},
};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::edr::EdrRow;

const LOCK_NOT_AVAILABLE: &str = "55P03";

struct HeldLock {
    owner: Uuid,
    tx: Transaction<'static, Postgres>,
}

/// [`EdrLock`] shared by every process connected to the same database.
///
/// A lock is a transaction scoped advisory lock on a hash of the transfer
/// process id. The transaction stays open between `acquire_lock` and
/// `release_lock`, so a crashed holder frees the key when its connection is
/// dropped. The pool should not be the one of the store, a held lock pins its
/// connection.
#[derive(Clone)]
pub struct PostgresEdrLock {
    pool: PgPool,
    timeout: Duration,
    held: Arc<DashMap<String, HeldLock>>,
}

impl PostgresEdrLock {
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self {
            pool,
            timeout,
            held: Arc::default(),
        }
    }

    pub async fn connect(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let pool = PgPool::connect(url).await?;
        Ok(Self::new(pool, timeout))
    }

    async fn lock_key(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        transfer_process_id: &str,
    ) -> Result<(), LockError> {
        // SET does not take bind parameters.
        sqlx::query(&format!(
            "SET LOCAL lock_timeout = '{}ms'",
            self.timeout.as_millis().max(1)
        ))
        .execute(&mut **tx)
        .await
        .map_err(StoreError::from)?;

        let locked = sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(transfer_process_id)
            .execute(&mut **tx)
            .await;

        match locked {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(err)) if err.code().as_deref() == Some(LOCK_NOT_AVAILABLE) => {
                Err(LockError::Timeout(transfer_process_id.to_string(), self.timeout))
            }
            Err(err) => Err(StoreError::from(err).into()),
        }
    }
}

#[async_trait]
impl EdrLock for PostgresEdrLock {
    async fn acquire_lock(
        &self,
        transfer_process_id: &str,
        _credential: &EdrCredential,
    ) -> Result<LockOutcome, LockError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;

        self.lock_key(&mut tx, transfer_process_id).await?;

        let row = sqlx::query_as::<_, EdrRow>(
            r#"
            SELECT * FROM edr_entries WHERE transfer_process_id = $1
            "#,
        )
        .bind(transfer_process_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        let Some(row) = row else {
            tx.rollback().await.map_err(StoreError::from)?;
            return Err(StoreError::NotFound(transfer_process_id.to_string()).into());
        };

        let cached = row.into_cached()?;
        if !self.is_expired(&cached.credential, &cached.entry) {
            debug!("EDR {} was refreshed while waiting", transfer_process_id);
            tx.rollback().await.map_err(StoreError::from)?;
            return Ok(LockOutcome::Fresh);
        }

        let handle = LockHandle::new(transfer_process_id);
        self.held.insert(
            transfer_process_id.to_string(),
            HeldLock {
                owner: handle.owner(),
                tx,
            },
        );

        debug!("EDR {} is expired, lock acquired for refresh", transfer_process_id);
        Ok(LockOutcome::Acquired(handle))
    }

    async fn release_lock(&self, handle: &LockHandle) -> Result<(), LockError> {
        match self
            .held
            .remove_if(handle.key(), |_, held| held.owner == handle.owner())
        {
            Some((_, held)) => {
                held.tx.commit().await.map_err(StoreError::from)?;
                Ok(())
            }
            None => {
                warn!(
                    "Ignoring release of EDR {} lock by {}, not the current holder",
                    handle.key(),
                    handle.owner()
                );
                Ok(())
            }
        }
    }

    fn is_expired(&self, credential: &EdrCredential, entry: &EdrEntry) -> bool {
        is_expired(credential, entry)
    }
}
