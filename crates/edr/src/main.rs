use miwa::core::Miwa;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use edc_edr_core::extensions::{edr_service_extension, edr_sweeper_extension};
use edc_edr_refresh_http::http_refresher_extension;
use edc_edr_store_sql::{edr_lock_extension, edr_store_extension};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_file = std::env::var("EDR_CONFIG_FILE").ok();
    let mut handle = Miwa::prepare()
        .with_env("EDR")
        .with_file(config_file)
        .build()?
        .add_extension(edr_store_extension)
        .add_extension(edr_lock_extension)
        .add_extension(http_refresher_extension)
        .add_extension(edr_service_extension)
        .add_extension(edr_sweeper_extension)
        .start()
        .await?;

    info!("EDR cache started");
    handle.wait().await?;

    Ok(())
}

fn env_filter() -> EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("{}=debug,edc_edr_core=debug", env!("CARGO_CRATE_NAME")).into())
}
