use edc_edr_core::core::db::{edr::EdrStoreRef, memory::edr::InMemoryEdrStore};
use miwa::{
    core::{Extension, ExtensionConfig, MiwaContext, MiwaResult},
    derive::extension,
};
use secrecy::ExposeSecret;
use tracing::info;
use uuid::Uuid;

use crate::db::{postgres::edr::PostgresEdrStore, sqlite::edr::SqliteEdrStore};

use super::config::{EdrBackend, EdrDbConfig};

pub struct EdrStoreExtension;

#[async_trait::async_trait]
impl Extension for EdrStoreExtension {
    async fn start(&self) -> MiwaResult<()> {
        Ok(())
    }

    async fn shutdown(&self) -> MiwaResult<()> {
        Ok(())
    }
}

#[extension(name = "EDR store extension", provides(EdrStoreRef))]
pub async fn edr_store_extension(
    ctx: &MiwaContext,
    ExtensionConfig(cfg): ExtensionConfig<EdrDbConfig>,
) -> MiwaResult<EdrStoreExtension> {
    ctx.register(create_edr_store(cfg).await?);
    Ok(EdrStoreExtension)
}

pub async fn create_edr_store(cfg: EdrDbConfig) -> anyhow::Result<EdrStoreRef> {
    let lease_duration = cfg.lease_duration();

    match cfg.backend {
        EdrBackend::Memory => {
            info!("Using in-memory EDR store");
            Ok(EdrStoreRef::of(InMemoryEdrStore::new(
                Uuid::new_v4().to_string(),
                lease_duration,
            )))
        }
        EdrBackend::Sqlite { path } => {
            info!("Using sqlite EDR store at {}", path);
            let store = SqliteEdrStore::connect(&format!("sqlite:{}", path))
                .await?
                .with_lease_duration(lease_duration);
            store.migrate().await?;

            Ok(EdrStoreRef::of(store))
        }
        EdrBackend::Postgres { url } => {
            info!("Using postgres EDR store");
            let store = PostgresEdrStore::connect(url.expose_secret())
                .await?
                .with_lease_duration(lease_duration);
            store.migrate().await?;

            Ok(EdrStoreRef::of(store))
        }
    }
}
