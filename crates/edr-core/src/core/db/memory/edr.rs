use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use futures::StreamExt;
use uuid::Uuid;

use crate::core::{
    db::edr::{EdrEntryStream, EdrStore, QuerySpec, StoreError, StoreResult},
    model::edr::{now, CachedEdr, EdrCredential, EdrEntry, EdrLease, LeasedEdr},
};

pub const DEFAULT_LEASE_SECONDS: i64 = 60;

struct Record {
    edr: CachedEdr,
    lease: Option<(String, DateTime<Utc>)>,
}

impl Record {
    fn is_leased(&self, at: DateTime<Utc>) -> bool {
        self.lease
            .as_ref()
            .map(|(_, expires_at)| *expires_at > at)
            .unwrap_or(false)
    }
}

/// Process local [`EdrStore`]. Every operation is atomic per entry.
#[derive(Clone)]
pub struct InMemoryEdrStore {
    entries: Arc<DashMap<String, Record>>,
    holder: String,
    lease_duration: Duration,
}

impl Default for InMemoryEdrStore {
    fn default() -> Self {
        Self::new(
            Uuid::new_v4().to_string(),
            Duration::seconds(DEFAULT_LEASE_SECONDS),
        )
    }
}

impl InMemoryEdrStore {
    pub fn new(holder: impl Into<String>, lease_duration: Duration) -> Self {
        Self {
            entries: Arc::default(),
            holder: holder.into(),
            lease_duration,
        }
    }

    fn snapshot(&self, spec: &QuerySpec) -> Vec<EdrEntry> {
        let mut entries = self
            .entries
            .iter()
            .map(|record| record.edr.entry.clone())
            .filter(|entry| spec.matches(entry))
            .collect::<Vec<_>>();

        entries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.transfer_process_id.cmp(&b.transfer_process_id))
        });

        let offset = spec.offset.max(0) as usize;
        let limit = spec.limit.map(|l| l.max(0) as usize).unwrap_or(usize::MAX);

        entries.into_iter().skip(offset).take(limit).collect()
    }
}

#[async_trait]
impl EdrStore for InMemoryEdrStore {
    async fn find_by_id(&self, transfer_process_id: &str) -> StoreResult<Option<CachedEdr>> {
        Ok(self
            .entries
            .get(transfer_process_id)
            .map(|record| record.edr.clone()))
    }

    async fn resolve_reference(
        &self,
        transfer_process_id: &str,
    ) -> StoreResult<Option<EdrCredential>> {
        Ok(self
            .entries
            .get(transfer_process_id)
            .map(|record| record.edr.credential.clone()))
    }

    async fn find_by_id_and_lease(&self, transfer_process_id: &str) -> StoreResult<LeasedEdr> {
        let now = now();
        let mut record = self
            .entries
            .get_mut(transfer_process_id)
            .ok_or_else(|| StoreError::NotFound(transfer_process_id.to_string()))?;

        if record.is_leased(now) {
            return Err(StoreError::AlreadyLeased(transfer_process_id.to_string()));
        }

        let expires_at = now + self.lease_duration;
        record.edr.entry.version += 1;
        record.lease = Some((self.holder.clone(), expires_at));

        Ok(LeasedEdr {
            edr: record.edr.clone(),
            lease: EdrLease {
                transfer_process_id: transfer_process_id.to_string(),
                holder: self.holder.clone(),
                token: record.edr.entry.version,
                expires_at,
            },
        })
    }

    async fn break_lease(&self, lease: &EdrLease) -> StoreResult<()> {
        if let Some(mut record) = self.entries.get_mut(&lease.transfer_process_id) {
            let owned = record
                .lease
                .as_ref()
                .map(|(holder, _)| *holder == lease.holder)
                .unwrap_or(false);

            if owned && record.edr.entry.version == lease.token {
                record.lease = None;
            }
        }
        Ok(())
    }

    async fn references_for_asset(
        &self,
        asset_id: &str,
        provider_id: Option<String>,
    ) -> StoreResult<Vec<EdrCredential>> {
        Ok(self
            .entries
            .iter()
            .filter(|record| record.edr.entry.asset_id == asset_id)
            .filter(|record| {
                provider_id
                    .as_ref()
                    .map(|id| *id == record.edr.entry.provider_id)
                    .unwrap_or(true)
            })
            .filter(|record| record.edr.entry.state.is_active())
            .map(|record| record.edr.credential.clone())
            .collect())
    }

    async fn save(&self, mut entry: EdrEntry, credential: EdrCredential) -> StoreResult<()> {
        entry.mark_saved(now());

        match self.entries.entry(entry.transfer_process_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                entry.created_at = record.edr.entry.created_at;
                entry.version = record.edr.entry.version + 1;
                record.edr = CachedEdr::new(entry, credential);
                record.lease = None;
            }
            Entry::Vacant(vacant) => {
                entry.version = 1;
                vacant.insert(Record {
                    edr: CachedEdr::new(entry, credential),
                    lease: None,
                });
            }
        }
        Ok(())
    }

    async fn update(&self, mut entry: EdrEntry) -> StoreResult<EdrEntry> {
        let id = entry.transfer_process_id.clone();
        let mut record = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        if record.edr.entry.version != entry.version {
            return Err(StoreError::Conflict(id));
        }

        let stored = &mut record.edr.entry;
        entry.created_at = stored.created_at;
        entry.updated_at = now();
        entry.version += 1;
        *stored = entry.clone();
        record.lease = None;

        Ok(entry)
    }

    async fn delete_by_transfer_process_id(
        &self,
        transfer_process_id: &str,
    ) -> StoreResult<EdrEntry> {
        let now = now();
        match self.entries.entry(transfer_process_id.to_string()) {
            Entry::Occupied(occupied) if occupied.get().is_leased(now) => {
                Err(StoreError::AlreadyLeased(transfer_process_id.to_string()))
            }
            Entry::Occupied(occupied) => Ok(occupied.remove().edr.entry),
            Entry::Vacant(_) => Err(StoreError::NotFound(transfer_process_id.to_string())),
        }
    }

    fn query_for_entries(&self, spec: QuerySpec) -> EdrEntryStream {
        futures::stream::iter(self.snapshot(&spec).into_iter().map(Ok)).boxed()
    }
}
