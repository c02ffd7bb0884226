use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Configuration parameters for the user-location directory
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LocatorConfig {
    /// Root key namespace, normally shared with the registry
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Per-fork delivery queue capacity for location watches
    #[serde(default = "default_watch_queue_capacity")]
    pub watch_queue_capacity: usize,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            watch_queue_capacity: default_watch_queue_capacity(),
        }
    }
}

impl LocatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(Error::Config(ConfigError::Message(
                "locator.namespace must not be empty".into(),
            )));
        }

        if self.watch_queue_capacity == 0 {
            return Err(Error::Config(ConfigError::Message(
                "locator.watch_queue_capacity must be greater than 0".into(),
            )));
        }

        Ok(())
    }
}

fn default_namespace() -> String {
    crate::constants::DEFAULT_NAMESPACE.to_string()
}
fn default_watch_queue_capacity() -> usize {
    crate::constants::DEFAULT_WATCH_QUEUE_CAPACITY
}
