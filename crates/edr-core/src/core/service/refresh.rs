use async_trait::async_trait;
use miwa::derive::interface;

#[cfg(test)]
use mockall::{automock, predicate::*};

use crate::core::model::edr::{CachedEdr, EdrCredential};

/// Exchanges an expired credential for a new one at the provider.
#[async_trait]
#[interface]
#[cfg_attr(test, automock)]
pub trait TokenRefresher {
    async fn refresh(&self, edr: &CachedEdr) -> anyhow::Result<EdrCredential>;
}
