use std::time::Duration;

use bon::Builder;
use miwa::derive::ExtensionConfig;
use serde::Deserialize;

#[derive(Deserialize, Clone, Debug, Builder, ExtensionConfig)]
#[config(prefix = "edr.sweeper")]
pub struct SweeperConfig {
    #[serde(default = "default_sweeper_enabled")]
    #[builder(default = default_sweeper_enabled())]
    pub enabled: bool,
    /// Milliseconds between two sweeps.
    #[serde(default = "default_iteration_wait")]
    #[builder(default = default_iteration_wait())]
    pub iteration_wait: u64,
    #[serde(default = "default_batch_size")]
    #[builder(default = default_batch_size())]
    pub batch_size: i64,
    /// Seconds an expired credential is kept before its entry is deleted.
    #[serde(default = "default_expired_retention")]
    #[builder(default = default_expired_retention())]
    pub expired_retention: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl SweeperConfig {
    pub fn iteration_wait(&self) -> Duration {
        Duration::from_millis(self.iteration_wait)
    }

    pub fn expired_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.expired_retention as i64)
    }
}

/// Milliseconds a resolve waits for a concurrent refresh of the same EDR.
pub fn default_lock_timeout() -> u64 {
    30_000
}

/// Milliseconds a store lease stays valid.
pub fn default_lease_duration() -> u64 {
    60_000
}

pub fn default_sweeper_enabled() -> bool {
    true
}

pub fn default_iteration_wait() -> u64 {
    1000
}

pub fn default_batch_size() -> i64 {
    20
}

pub fn default_expired_retention() -> u64 {
    60
}
