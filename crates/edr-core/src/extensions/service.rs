use miwa::{
    core::{Extension, MiwaContext, MiwaResult},
    derive::extension,
};

use crate::core::{
    db::edr::EdrStoreRef,
    lock::EdrLockRef,
    service::{edr::EdrService, refresh::TokenRefresherRef},
};

pub struct EdrServiceExtension;

#[async_trait::async_trait]
impl Extension for EdrServiceExtension {
    async fn start(&self) -> MiwaResult<()> {
        Ok(())
    }

    async fn shutdown(&self) -> MiwaResult<()> {
        Ok(())
    }
}

#[extension(name = "EDR service extension", provides(EdrService))]
pub async fn edr_service_extension(
    ctx: &MiwaContext,
    store: EdrStoreRef,
    lock: EdrLockRef,
    refresher: TokenRefresherRef,
) -> MiwaResult<EdrServiceExtension> {
    ctx.register(EdrService::new(store, lock, refresher));
    Ok(EdrServiceExtension)
}
