//! Configuration for the clustering substrate.
//!
//! Provides per-subsystem config structs with serde field defaults and
//! validation, plus a small loader with priority:
//! 1. Default values (hardcoded)
//! 2. Optional config file
//! 3. Environment variables (highest priority)

mod locator;
mod registry;
pub use locator::*;
pub use registry::*;


//---
use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Settings {
    /// Registration lifecycle and membership watch parameters
    #[serde(default)]
    pub registry: RegistryConfig,

    /// User-location protocol parameters
    #[serde(default)]
    pub locator: LocatorConfig,
}

impl Settings {
    /// Load configuration with proper priority ordering.
    ///
    /// # Arguments
    /// * `path` - Optional path to a config file merged over the defaults
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = Config::builder();

        if let Some(path) = path {
            config = config.add_source(File::with_name(path).required(true));
        }

        // Environment variables (highest priority)
        config = config.add_source(
            Environment::with_prefix("GRIDLINK")
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true),
        );

        let settings: Settings = config.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validates all subsystem configurations
    pub fn validate(&self) -> Result<()> {
        self.registry.validate()?;
        self.locator.validate()?;
        Ok(())
    }
}
