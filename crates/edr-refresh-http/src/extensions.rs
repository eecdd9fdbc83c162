use edc_edr_core::core::service::refresh::TokenRefresherRef;
use miwa::{
    core::{Extension, ExtensionConfig, MiwaContext, MiwaResult},
    derive::extension,
};

use crate::{client::HttpTokenRefresher, config::RefreshConfig};

pub struct HttpRefresherExtension;

#[async_trait::async_trait]
impl Extension for HttpRefresherExtension {
    async fn start(&self) -> MiwaResult<()> {
        Ok(())
    }

    async fn shutdown(&self) -> MiwaResult<()> {
        Ok(())
    }
}

#[extension(name = "HTTP token refresher extension", provides(TokenRefresherRef))]
pub async fn http_refresher_extension(
    ctx: &MiwaContext,
    ExtensionConfig(cfg): ExtensionConfig<RefreshConfig>,
) -> MiwaResult<HttpRefresherExtension> {
    ctx.register(create_refresher(&cfg)?);
    Ok(HttpRefresherExtension)
}

fn create_refresher(cfg: &RefreshConfig) -> anyhow::Result<TokenRefresherRef> {
    Ok(TokenRefresherRef::of(HttpTokenRefresher::new(cfg)?))
}
