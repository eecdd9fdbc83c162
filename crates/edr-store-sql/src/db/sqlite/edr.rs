use chrono::Duration;
use edc_edr_core::core::{
    db::{
        edr::{EdrEntryStream, EdrStore, QuerySpec, StoreError, StoreResult},
        memory::edr::DEFAULT_LEASE_SECONDS,
    },
    model::edr::{now, CachedEdr, EdrCredential, EdrEntry, EdrLease, EdrState, LeasedEdr},
};
use futures::{StreamExt, TryStreamExt};
use sqlx::{Sqlite, SqlitePool};
use uuid::Uuid;

use crate::db::edr::{
    decode_credential, encode_credential, impl_edr_store, EdrRow, DEFAULT_PAGE_SIZE,
};

#[derive(Clone)]
pub struct SqliteEdrStore {
    pool: SqlitePool,
    holder: String,
    lease_duration: Duration,
    page_size: i64,
}

impl SqliteEdrStore {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let pool = SqlitePool::connect(url).await?;
        Ok(Self::new(pool))
    }

    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            holder: Uuid::new_v4().to_string(),
            lease_duration: Duration::seconds(DEFAULT_LEASE_SECONDS),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    pub fn with_page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size;
        self
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations/sqlite")
            .run(&self.pool)
            .await?;
        Ok(())
    }
}

impl_edr_store!(SqliteEdrStore, Sqlite, SqlitePool);
