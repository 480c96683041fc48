//! Config schema types.
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    pub sending: SendingConfig,
}

/// Delivery queue timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendingConfig {
    /// Seconds an idle destination queue stays cached in its registry.
    pub cache_ttl_secs: u64,
    /// Milliseconds an item scheduled during a block waits for a release
    /// before it resolves as failed.
    pub block_retry_window_ms: u64,
    /// Milliseconds between checks while waiting on a block or a drain.
    pub poll_interval_ms: u64,
    /// Seconds between background registry sweeps.
    pub sweep_interval_secs: u64,
    /// Seconds a shutdown waits for pending items.
    pub stop_timeout_secs: u64,
}

impl Default for SendingConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 3600,
            block_retry_window_ms: 5000,
            poll_interval_ms: 100,
            sweep_interval_secs: 60,
            stop_timeout_secs: 10,
        }
    }
}

impl SendingConfig {
    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    #[must_use]
    pub fn block_retry_window(&self) -> Duration {
        Duration::from_millis(self.block_retry_window_ms)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    #[must_use]
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}
