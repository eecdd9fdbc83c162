use std::sync::Arc;

use edc_edr_core::core::{
    db::edr::EdrStoreRef,
    lock::{
        memory::{InMemoryEdrLock, LockTable},
        EdrLockRef,
    },
};
use miwa::{
    core::{Extension, ExtensionConfig, MiwaContext, MiwaResult},
    derive::extension,
};
use secrecy::ExposeSecret;
use tracing::info;

use crate::db::postgres::lock::PostgresEdrLock;

use super::config::{EdrBackend, EdrDbConfig};

pub struct EdrLockExtension;

#[async_trait::async_trait]
impl Extension for EdrLockExtension {
    async fn start(&self) -> MiwaResult<()> {
        Ok(())
    }

    async fn shutdown(&self) -> MiwaResult<()> {
        Ok(())
    }
}

#[extension(name = "EDR lock extension", provides(EdrLockRef))]
pub async fn edr_lock_extension(
    ctx: &MiwaContext,
    ExtensionConfig(cfg): ExtensionConfig<EdrDbConfig>,
    store: EdrStoreRef,
) -> MiwaResult<EdrLockExtension> {
    ctx.register(create_edr_lock(cfg, store).await?);
    Ok(EdrLockExtension)
}

/// Postgres shares locks across instances, every other backend locks within
/// this process.
pub async fn create_edr_lock(cfg: EdrDbConfig, store: EdrStoreRef) -> anyhow::Result<EdrLockRef> {
    let timeout = cfg.lock_timeout();

    match cfg.backend {
        EdrBackend::Postgres { url } => {
            info!("Using postgres EDR lock");
            let lock = PostgresEdrLock::connect(url.expose_secret(), timeout).await?;
            Ok(EdrLockRef::of(lock))
        }
        EdrBackend::Memory | EdrBackend::Sqlite { .. } => {
            info!("Using in-process EDR lock");
            Ok(EdrLockRef::of(InMemoryEdrLock::new(
                Arc::new(LockTable::new()),
                store,
                timeout,
            )))
        }
    }
}
