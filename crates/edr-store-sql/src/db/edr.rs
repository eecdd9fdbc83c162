use chrono::{DateTime, Utc};
use edc_edr_core::core::{
    db::edr::{StoreError, StoreResult},
    model::edr::{CachedEdr, EdrCredential, EdrEntry, EdrState},
};

/// Rows fetched per round trip by `query_for_entries`.
pub const DEFAULT_PAGE_SIZE: i64 = 100;

/// A row of `edr_entries`. Timestamps are stored as unix milliseconds and the
/// credential as JSON text so that both backends share one schema.
#[derive(sqlx::FromRow)]
pub(crate) struct EdrRow {
    pub transfer_process_id: String,
    pub asset_id: String,
    pub agreement_id: String,
    pub contract_negotiation_id: Option<String>,
    pub provider_id: String,
    pub state: EdrState,
    pub state_count: i32,
    pub state_timestamp: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub error_detail: Option<String>,
    pub version: i64,
    pub credential: String,
}

impl EdrRow {
    pub fn into_entry(self) -> StoreResult<EdrEntry> {
        Ok(self.split()?.0)
    }

    pub fn into_cached(self) -> StoreResult<CachedEdr> {
        let (entry, credential) = self.split()?;
        Ok(CachedEdr::new(entry, decode_credential(&credential)?))
    }

    fn split(self) -> StoreResult<(EdrEntry, String)> {
        let entry = EdrEntry::builder()
            .transfer_process_id(self.transfer_process_id)
            .asset_id(self.asset_id)
            .agreement_id(self.agreement_id)
            .maybe_contract_negotiation_id(self.contract_negotiation_id)
            .provider_id(self.provider_id)
            .state(self.state)
            .state_count(self.state_count)
            .state_timestamp(from_millis(self.state_timestamp)?)
            .created_at(from_millis(self.created_at)?)
            .updated_at(from_millis(self.updated_at)?)
            .maybe_error_detail(self.error_detail)
            .version(self.version)
            .build();

        Ok((entry, self.credential))
    }
}

pub(crate) fn encode_credential(credential: &EdrCredential) -> StoreResult<String> {
    serde_json::to_string(credential).map_err(|err| StoreError::Generic(err.into()))
}

pub(crate) fn decode_credential(raw: &str) -> StoreResult<EdrCredential> {
    serde_json::from_str(raw).map_err(|err| StoreError::Generic(err.into()))
}

pub(crate) fn from_millis(millis: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::Generic(anyhow::anyhow!("Invalid timestamp {}", millis)))
}

/// Implements `EdrStore` for a store struct with `pool`, `holder`,
/// `lease_duration` and `page_size` fields. The statements only use SQL that
/// SQLite and PostgreSQL both understand.
macro_rules! impl_edr_store {
    ($store:ty, $db:ty, $pool:ty) => {
        struct Page {
            spec: edc_edr_core::core::db::edr::QuerySpec,
            offset: i64,
            remaining: Option<i64>,
            done: bool,
        }

        impl $store {
            async fn exists(&self, transfer_process_id: &str) -> StoreResult<bool> {
                let found = sqlx::query_scalar::<_, String>(
                    r#"
                    SELECT transfer_process_id FROM edr_entries WHERE transfer_process_id = $1
                    "#,
                )
                .bind(transfer_process_id)
                .fetch_optional(&self.pool)
                .await?;

                Ok(found.is_some())
            }

            async fn fetch_page(
                pool: $pool,
                page_size: i64,
                mut page: Page,
            ) -> StoreResult<Option<(Vec<EdrEntry>, Page)>> {
                let size = page
                    .remaining
                    .map(|remaining| remaining.min(page_size))
                    .unwrap_or(page_size);

                if page.done || size <= 0 {
                    return Ok(None);
                }

                let mut q = sqlx::QueryBuilder::<$db>::new("SELECT * FROM edr_entries WHERE 1 = 1");

                let spec = &page.spec;
                for (column, value) in [
                    ("transfer_process_id", &spec.transfer_process_id),
                    ("asset_id", &spec.asset_id),
                    ("agreement_id", &spec.agreement_id),
                    ("contract_negotiation_id", &spec.contract_negotiation_id),
                    ("provider_id", &spec.provider_id),
                ] {
                    if let Some(value) = value {
                        q.push(format!(" AND {} = ", column)).push_bind(value.clone());
                    }
                }
                if let Some(state) = spec.state {
                    q.push(" AND state = ").push_bind(state);
                }

                q.push(" ORDER BY created_at, transfer_process_id LIMIT ")
                    .push_bind(size)
                    .push(" OFFSET ")
                    .push_bind(page.offset);

                let rows = q.build_query_as::<EdrRow>().fetch_all(&pool).await?;
                let fetched = rows.len() as i64;

                page.done = fetched < size;
                page.offset += fetched;
                page.remaining = page.remaining.map(|remaining| remaining - fetched);

                let entries = rows
                    .into_iter()
                    .map(EdrRow::into_entry)
                    .collect::<StoreResult<Vec<_>>>()?;

                Ok(Some((entries, page)))
            }
        }

        #[async_trait::async_trait]
        impl EdrStore for $store {
            async fn find_by_id(
                &self,
                transfer_process_id: &str,
            ) -> StoreResult<Option<CachedEdr>> {
                sqlx::query_as::<_, EdrRow>(
                    r#"
                    SELECT * FROM edr_entries WHERE transfer_process_id = $1
                    "#,
                )
                .bind(transfer_process_id)
                .fetch_optional(&self.pool)
                .await?
                .map(EdrRow::into_cached)
                .transpose()
            }

            async fn resolve_reference(
                &self,
                transfer_process_id: &str,
            ) -> StoreResult<Option<EdrCredential>> {
                sqlx::query_scalar::<_, String>(
                    r#"
                    SELECT credential FROM edr_entries WHERE transfer_process_id = $1
                    "#,
                )
                .bind(transfer_process_id)
                .fetch_optional(&self.pool)
                .await?
                .map(|raw| decode_credential(&raw))
                .transpose()
            }

            async fn find_by_id_and_lease(
                &self,
                transfer_process_id: &str,
            ) -> StoreResult<LeasedEdr> {
                let now = now();
                let expires_at = now + self.lease_duration;

                let row = sqlx::query_as::<_, EdrRow>(
                    r#"
                    UPDATE edr_entries
                    SET lease_holder = $1, lease_expires_at = $2, version = version + 1
                    WHERE transfer_process_id = $3
                      AND (lease_holder IS NULL OR lease_expires_at <= $4)
                    RETURNING *
                    "#,
                )
                .bind(&self.holder)
                .bind(expires_at.timestamp_millis())
                .bind(transfer_process_id)
                .bind(now.timestamp_millis())
                .fetch_optional(&self.pool)
                .await?;

                match row {
                    Some(row) => {
                        let edr = row.into_cached()?;
                        let lease = EdrLease {
                            transfer_process_id: transfer_process_id.to_string(),
                            holder: self.holder.clone(),
                            token: edr.entry.version,
                            expires_at,
                        };
                        Ok(LeasedEdr { edr, lease })
                    }
                    None if self.exists(transfer_process_id).await? => {
                        Err(StoreError::AlreadyLeased(transfer_process_id.to_string()))
                    }
                    None => Err(StoreError::NotFound(transfer_process_id.to_string())),
                }
            }

            async fn break_lease(&self, lease: &EdrLease) -> StoreResult<()> {
                sqlx::query(
                    r#"
                    UPDATE edr_entries SET lease_holder = NULL, lease_expires_at = NULL
                    WHERE transfer_process_id = $1 AND lease_holder = $2 AND version = $3
                    "#,
                )
                .bind(&lease.transfer_process_id)
                .bind(&lease.holder)
                .bind(lease.token)
                .execute(&self.pool)
                .await?;

                Ok(())
            }

            async fn references_for_asset(
                &self,
                asset_id: &str,
                provider_id: Option<String>,
            ) -> StoreResult<Vec<EdrCredential>> {
                let mut q = sqlx::QueryBuilder::<$db>::new(
                    "SELECT credential FROM edr_entries WHERE asset_id = ",
                );
                q.push_bind(asset_id.to_string());

                if let Some(provider_id) = provider_id {
                    q.push(" AND provider_id = ").push_bind(provider_id);
                }

                q.push(" AND state IN (")
                    .push_bind(EdrState::Negotiated)
                    .push(", ")
                    .push_bind(EdrState::Refreshing)
                    .push(")");

                q.build_query_scalar::<String>()
                    .fetch_all(&self.pool)
                    .await?
                    .iter()
                    .map(|raw| decode_credential(raw))
                    .collect()
            }

            async fn save(&self, mut entry: EdrEntry, credential: EdrCredential) -> StoreResult<()> {
                entry.mark_saved(now());

                sqlx::query(
                    r#"
                    INSERT INTO edr_entries (
                        transfer_process_id, asset_id, agreement_id, contract_negotiation_id,
                        provider_id, state, state_count, state_timestamp, created_at, updated_at,
                        error_detail, version, credential, lease_holder, lease_expires_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 1, $12, NULL, NULL)
                    ON CONFLICT (transfer_process_id) DO UPDATE SET
                        asset_id = excluded.asset_id,
                        agreement_id = excluded.agreement_id,
                        contract_negotiation_id = excluded.contract_negotiation_id,
                        provider_id = excluded.provider_id,
                        state = excluded.state,
                        state_count = excluded.state_count,
                        state_timestamp = excluded.state_timestamp,
                        updated_at = excluded.updated_at,
                        error_detail = excluded.error_detail,
                        version = edr_entries.version + 1,
                        credential = excluded.credential,
                        lease_holder = NULL,
                        lease_expires_at = NULL
                    "#,
                )
                .bind(&entry.transfer_process_id)
                .bind(&entry.asset_id)
                .bind(&entry.agreement_id)
                .bind(&entry.contract_negotiation_id)
                .bind(&entry.provider_id)
                .bind(entry.state)
                .bind(entry.state_count)
                .bind(entry.state_timestamp.timestamp_millis())
                .bind(entry.created_at.timestamp_millis())
                .bind(entry.updated_at.timestamp_millis())
                .bind(&entry.error_detail)
                .bind(encode_credential(&credential)?)
                .execute(&self.pool)
                .await?;

                Ok(())
            }

            async fn update(&self, entry: EdrEntry) -> StoreResult<EdrEntry> {
                let row = sqlx::query_as::<_, EdrRow>(
                    r#"
                    UPDATE edr_entries SET
                        asset_id = $1,
                        agreement_id = $2,
                        contract_negotiation_id = $3,
                        provider_id = $4,
                        state = $5,
                        state_count = $6,
                        state_timestamp = $7,
                        updated_at = $8,
                        error_detail = $9,
                        version = version + 1,
                        lease_holder = NULL,
                        lease_expires_at = NULL
                    WHERE transfer_process_id = $10 AND version = $11
                    RETURNING *
                    "#,
                )
                .bind(&entry.asset_id)
                .bind(&entry.agreement_id)
                .bind(&entry.contract_negotiation_id)
                .bind(&entry.provider_id)
                .bind(entry.state)
                .bind(entry.state_count)
                .bind(entry.state_timestamp.timestamp_millis())
                .bind(now().timestamp_millis())
                .bind(&entry.error_detail)
                .bind(&entry.transfer_process_id)
                .bind(entry.version)
                .fetch_optional(&self.pool)
                .await?;

                match row {
                    Some(row) => row.into_entry(),
                    None if self.exists(&entry.transfer_process_id).await? => {
                        Err(StoreError::Conflict(entry.transfer_process_id))
                    }
                    None => Err(StoreError::NotFound(entry.transfer_process_id)),
                }
            }

            async fn delete_by_transfer_process_id(
                &self,
                transfer_process_id: &str,
            ) -> StoreResult<EdrEntry> {
                let row = sqlx::query_as::<_, EdrRow>(
                    r#"
                    DELETE FROM edr_entries
                    WHERE transfer_process_id = $1
                      AND (lease_holder IS NULL OR lease_expires_at <= $2)
                    RETURNING *
                    "#,
                )
                .bind(transfer_process_id)
                .bind(now().timestamp_millis())
                .fetch_optional(&self.pool)
                .await?;

                match row {
                    Some(row) => row.into_entry(),
                    None if self.exists(transfer_process_id).await? => {
                        Err(StoreError::AlreadyLeased(transfer_process_id.to_string()))
                    }
                    None => Err(StoreError::NotFound(transfer_process_id.to_string())),
                }
            }

            fn query_for_entries(&self, spec: QuerySpec) -> EdrEntryStream {
                let pool = self.pool.clone();
                let page_size = self.page_size.max(1);

                let first = Page {
                    offset: spec.offset.max(0),
                    remaining: spec.limit.map(|limit| limit.max(0)),
                    done: false,
                    spec,
                };

                futures::stream::try_unfold(first, move |page| {
                    Self::fetch_page(pool.clone(), page_size, page)
                })
                .map_ok(|entries| futures::stream::iter(entries.into_iter().map(Ok)))
                .try_flatten()
                .boxed()
            }
        }
    };
}

pub(crate) use impl_edr_store;
