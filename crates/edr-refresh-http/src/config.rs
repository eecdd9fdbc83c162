use std::time::Duration;

use miwa::derive::ExtensionConfig;
use serde::Deserialize;

#[derive(Deserialize, Clone, Debug, ExtensionConfig)]
#[config(prefix = "edr.refresh")]
pub struct RefreshConfig {
    /// Milliseconds before a call to the token endpoint is abandoned.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
        }
    }
}

impl RefreshConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }
}

fn default_timeout() -> u64 {
    30_000
}
