use async_trait::async_trait;
use bon::Builder;
use futures::stream::BoxStream;
use miwa::derive::interface;
use thiserror::Error;

#[cfg(test)]
use mockall::{automock, predicate::*};

use crate::core::model::edr::{
    CachedEdr, EdrCredential, EdrEntry, EdrLease, EdrState, LeasedEdr,
};

pub type StoreResult<T> = Result<T, StoreError>;

pub type EdrEntryStream = BoxStream<'static, StoreResult<EdrEntry>>;

/// Durable cache of EDR entries keyed by transfer process id.
#[async_trait]
#[interface]
#[cfg_attr(test, automock)]
pub trait EdrStore {
    async fn find_by_id(&self, transfer_process_id: &str) -> StoreResult<Option<CachedEdr>>;

    async fn resolve_reference(
        &self,
        transfer_process_id: &str,
    ) -> StoreResult<Option<EdrCredential>>;

    /// Claims the entry for a mutation. Fails with [`StoreError::AlreadyLeased`]
    /// while another lease on the same entry is live.
    async fn find_by_id_and_lease(&self, transfer_process_id: &str) -> StoreResult<LeasedEdr>;

    /// Gives a lease back before it expires. A stale lease is ignored.
    async fn break_lease(&self, lease: &EdrLease) -> StoreResult<()>;

    /// Credentials of all active entries for an asset, optionally restricted to
    /// one provider.
    async fn references_for_asset(
        &self,
        asset_id: &str,
        provider_id: Option<String>,
    ) -> StoreResult<Vec<EdrCredential>>;

    /// Upsert. The stored entry is `NEGOTIATED`, its lease is cleared and its
    /// creation time is kept when the entry already existed.
    async fn save(&self, entry: EdrEntry, credential: EdrCredential) -> StoreResult<()>;

    /// Compare-and-swap on [`EdrEntry::version`]. Writes state and metadata
    /// only, clears the lease and returns the entry as stored.
    async fn update(&self, entry: EdrEntry) -> StoreResult<EdrEntry>;

    async fn delete_by_transfer_process_id(
        &self,
        transfer_process_id: &str,
    ) -> StoreResult<EdrEntry>;

    fn query_for_entries(&self, spec: QuerySpec) -> EdrEntryStream;
}

#[derive(Builder, Clone, Debug, Default, PartialEq)]
pub struct QuerySpec {
    #[builder(default = 0)]
    pub offset: i64,
    pub limit: Option<i64>,
    #[builder(into)]
    pub transfer_process_id: Option<String>,
    #[builder(into)]
    pub asset_id: Option<String>,
    #[builder(into)]
    pub agreement_id: Option<String>,
    #[builder(into)]
    pub contract_negotiation_id: Option<String>,
    #[builder(into)]
    pub provider_id: Option<String>,
    pub state: Option<EdrState>,
}

impl QuerySpec {
    pub fn matches(&self, entry: &EdrEntry) -> bool {
        fn eq(filter: &Option<String>, value: &str) -> bool {
            filter.as_deref().map(|f| f == value).unwrap_or(true)
        }

        eq(&self.transfer_process_id, &entry.transfer_process_id)
            && eq(&self.asset_id, &entry.asset_id)
            && eq(&self.agreement_id, &entry.agreement_id)
            && eq(&self.provider_id, &entry.provider_id)
            && self
                .contract_negotiation_id
                .as_ref()
                .map(|id| entry.contract_negotiation_id.as_ref() == Some(id))
                .unwrap_or(true)
            && self.state.map(|s| s == entry.state).unwrap_or(true)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("EDR entry {0} not found")]
    NotFound(String),
    #[error("EDR entry {0} is leased by another holder")]
    AlreadyLeased(String),
    #[error("EDR entry {0} was modified concurrently")]
    Conflict(String),
    #[error("EDR persistence failure")]
    Sql(#[from] sqlx::Error),
    #[error(transparent)]
    Generic(#[from] anyhow::Error),
}
