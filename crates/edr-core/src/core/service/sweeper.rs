use chrono::{DateTime, Duration, Utc};
use futures::{future::join_all, StreamExt};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info};

use crate::{
    config::SweeperConfig,
    core::{
        db::edr::{EdrStoreRef, QuerySpec, StoreError},
        lock::{EdrLockRef, LockOutcome},
        model::edr::{now, CachedEdr, EdrState},
    },
};

/// Deletes entries whose credential expired longer than the retention window
/// ago.
#[derive(Clone)]
pub struct EdrSweeper {
    store: EdrStoreRef,
    lock: EdrLockRef,
    cfg: SweeperConfig,
}

impl EdrSweeper {
    pub fn new(store: EdrStoreRef, lock: EdrLockRef, cfg: SweeperConfig) -> Self {
        Self { store, lock, cfg }
    }

    /// One pass over all `NEGOTIATED` entries. Returns the number of deleted
    /// entries.
    pub async fn sweep_once(&self) -> anyhow::Result<usize> {
        let retention = self.cfg.expired_retention();
        let batch_size = self.cfg.batch_size.max(1) as usize;

        let mut batches = self
            .store
            .query_for_entries(QuerySpec::builder().state(EdrState::Negotiated).build())
            .chunks(batch_size);

        let mut deleted = 0;
        while let Some(batch) = batches.next().await {
            let entries = batch.into_iter().collect::<Result<Vec<_>, _>>()?;

            for result in join_all(
                entries
                    .iter()
                    .map(|entry| self.sweep_entry(&entry.transfer_process_id, retention)),
            )
            .await
            {
                match result {
                    Ok(true) => deleted += 1,
                    Ok(false) => {}
                    Err(err) => error!("Failed to sweep EDR: {:#}", err),
                }
            }
        }

        Ok(deleted)
    }

    async fn sweep_entry(&self, transfer_process_id: &str, retention: Duration) -> anyhow::Result<bool> {
        let Some(cached) = self.store.find_by_id(transfer_process_id).await? else {
            return Ok(false);
        };

        if !is_past_retention(&cached, retention, now()) {
            return Ok(false);
        }

        let handle = match self
            .lock
            .acquire_lock(transfer_process_id, &cached.credential)
            .await?
        {
            LockOutcome::Acquired(handle) => handle,
            LockOutcome::Fresh => return Ok(false),
        };

        let deleted = self.delete_if_past_retention(transfer_process_id, retention).await;
        self.lock.release_lock(&handle).await?;
        deleted
    }

    async fn delete_if_past_retention(
        &self,
        transfer_process_id: &str,
        retention: Duration,
    ) -> anyhow::Result<bool> {
        let Some(cached) = self.store.find_by_id(transfer_process_id).await? else {
            return Ok(false);
        };

        if !is_past_retention(&cached, retention, now()) {
            return Ok(false);
        }

        match self
            .store
            .delete_by_transfer_process_id(transfer_process_id)
            .await
        {
            Ok(_) => {
                debug!("Deleted expired EDR {}", transfer_process_id);
                Ok(true)
            }
            Err(StoreError::AlreadyLeased(_)) | Err(StoreError::NotFound(_)) => {
                debug!("Skipping EDR {}, it is in use", transfer_process_id);
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Sweeps every `iteration_wait` until `shutdown` turns `true` or its
    /// sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting EDR sweeper (every {:?}, retention {}s)",
            self.cfg.iteration_wait(),
            self.cfg.expired_retention
        );

        while !*shutdown.borrow() {
            match self.sweep_once().await {
                Ok(0) => {}
                Ok(deleted) => info!("Deleted {} expired EDRs", deleted),
                Err(err) => error!("EDR sweep failed: {:#}", err),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.cfg.iteration_wait()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("EDR sweeper stopped");
    }

    /// Runs the sweeper in the background.
    pub fn spawn(self) -> SweeperHandle {
        let (shutdown, receiver) = watch::channel(false);
        let task = tokio::task::spawn(self.run(receiver));
        SweeperHandle { shutdown, task }
    }
}

pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signals the sweeper to stop and waits for the current pass to finish.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.shutdown.send_replace(true);
        self.task.await?;
        Ok(())
    }
}

fn is_past_retention(cached: &CachedEdr, retention: Duration, at: DateTime<Utc>) -> bool {
    cached
        .credential
        .expiry(&cached.entry)
        .map(|expiry| expiry + retention <= at)
        .unwrap_or(false)
}
