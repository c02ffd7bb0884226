use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Configuration parameters for instance registration and membership watch
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RegistryConfig {
    /// Root key namespace every record of this cluster lives under
    /// Processes sharing a backend but not a namespace never see each other
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Lease/TTL attached to instance records (seconds)
    /// Expiry without renewal causes backend-side removal of the record
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_in_secs: u64,

    /// Renewal attempts before the registrar falls back to a full
    /// re-registration with a fresh lease
    #[serde(default = "default_renew_retry_count")]
    pub renew_retry_count: usize,

    /// Fixed delay between renewal attempts (milliseconds)
    #[serde(default = "default_renew_retry_interval")]
    pub renew_retry_interval_in_ms: u64,

    /// Per-fork delivery queue capacity; a full queue backpressures the
    /// broadcaster for that fork
    #[serde(default = "default_watch_queue_capacity")]
    pub watch_queue_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            lease_ttl_in_secs: default_lease_ttl(),
            renew_retry_count: default_renew_retry_count(),
            renew_retry_interval_in_ms: default_renew_retry_interval(),
            watch_queue_capacity: default_watch_queue_capacity(),
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(Error::Config(ConfigError::Message(
                "registry.namespace must not be empty".into(),
            )));
        }

        if self.lease_ttl_in_secs < 2 {
            // The heartbeat runs at half the TTL; below 2s it cannot tick
            return Err(Error::Config(ConfigError::Message(
                "registry.lease_ttl_in_secs must be at least 2".into(),
            )));
        }

        if self.renew_retry_count == 0 {
            return Err(Error::Config(ConfigError::Message(
                "registry.renew_retry_count must be greater than 0".into(),
            )));
        }

        if self.watch_queue_capacity == 0 {
            return Err(Error::Config(ConfigError::Message(
                "registry.watch_queue_capacity must be greater than 0".into(),
            )));
        }

        Ok(())
    }

    /// Lease duration attached to instance records
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_in_secs)
    }

    /// Heartbeat cadence: half the lease TTL, tolerating one missed tick
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_in_secs) / 2
    }

    pub fn renew_retry_interval(&self) -> Duration {
        Duration::from_millis(self.renew_retry_interval_in_ms)
    }
}

fn default_namespace() -> String {
    crate::constants::DEFAULT_NAMESPACE.to_string()
}
// in secs
fn default_lease_ttl() -> u64 {
    10
}
fn default_renew_retry_count() -> usize {
    3
}
// in ms
fn default_renew_retry_interval() -> u64 {
    500
}
fn default_watch_queue_capacity() -> usize {
    crate::constants::DEFAULT_WATCH_QUEUE_CAPACITY
}
