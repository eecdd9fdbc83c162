use std::sync::Arc;

use miwa::{
    core::{Extension, ExtensionConfig, MiwaResult},
    derive::extension,
};
use tokio::sync::Mutex;
use tracing::info;

use crate::{
    config::SweeperConfig,
    core::{
        db::edr::EdrStoreRef,
        lock::EdrLockRef,
        service::sweeper::{EdrSweeper, SweeperHandle},
    },
};

pub struct EdrSweeperExtension {
    sweeper: Option<EdrSweeper>,
    handle: Arc<Mutex<Option<SweeperHandle>>>,
}

#[async_trait::async_trait]
impl Extension for EdrSweeperExtension {
    async fn start(&self) -> MiwaResult<()> {
        match &self.sweeper {
            Some(sweeper) => {
                self.handle.lock().await.replace(sweeper.clone().spawn());
            }
            None => info!("EDR sweeper disabled"),
        }
        Ok(())
    }

    async fn shutdown(&self) -> MiwaResult<()> {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.shutdown().await?;
        }
        Ok(())
    }
}

#[extension(name = "EDR sweeper extension")]
pub async fn edr_sweeper_extension(
    ExtensionConfig(cfg): ExtensionConfig<SweeperConfig>,
    store: EdrStoreRef,
    lock: EdrLockRef,
) -> MiwaResult<EdrSweeperExtension> {
    let sweeper = cfg
        .enabled
        .then(|| EdrSweeper::new(store, lock, cfg.clone()));

    Ok(EdrSweeperExtension {
        sweeper,
        handle: Arc::default(),
    })
}
