use std::time::Duration;

use edc_edr_core::config::{default_lease_duration, default_lock_timeout};
use miwa::derive::ExtensionConfig;
use secrecy::SecretString;
use serde::Deserialize;

/// Storage and locking of EDRs.
#[derive(Deserialize, Clone, ExtensionConfig)]
#[config(prefix = "db.edrs")]
pub struct EdrDbConfig {
    #[serde(default)]
    pub backend: EdrBackend,
    /// Milliseconds a store lease stays valid.
    #[serde(default = "default_lease_duration")]
    pub lease_duration: u64,
    /// Milliseconds a resolve waits for a concurrent refresh of the same EDR.
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout: u64,
}

#[derive(Deserialize, Clone, Default)]
#[serde(rename_all = "lowercase")]
pub enum EdrBackend {
    #[default]
    Memory,
    Sqlite {
        path: String,
    },
    Postgres {
        url: SecretString,
    },
}

impl EdrDbConfig {
    pub fn lease_duration(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.lease_duration as i64)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout)
    }
}
