//! Accessory registration.
//!
//! Plugins register a factory under a `(plugin, accessory)` name pair once at
//! startup; the bridge then instantiates one accessory per matching
//! `[[accessories]]` table.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use toml::Table;
use tracing::info;

use crate::errors::RegistryError;
use crate::hap::Service;

/// Something the bridge can expose
#[async_trait]
pub trait Accessory: Send + Sync {
    fn name(&self) -> &str;

    /// Services to expose, in display order
    fn services(&self) -> Vec<Arc<Service>>;

    /// Stop background work. Called once when the bridge shuts down.
    fn shutdown(&self) {}

    /// Resolves once background work has exited after `shutdown`
    async fn stopped(&self) {}
}

pub type AccessoryFactory =
    Box<dyn Fn(&Table) -> Result<Box<dyn Accessory>, RegistryError> + Send + Sync>;

struct Registration {
    plugin: String,
    factory: AccessoryFactory,
}

/// Accessory types known to the bridge
#[derive(Default)]
pub struct AccessoryRegistry {
    entries: HashMap<String, Registration>,
}

impl AccessoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_accessory(
        &mut self,
        plugin: &str,
        accessory: &str,
        factory: AccessoryFactory,
    ) -> Result<(), RegistryError> {
        if let Some(existing) = self.entries.get(accessory) {
            return Err(RegistryError::Duplicate {
                plugin: existing.plugin.clone(),
                accessory: accessory.to_string(),
            });
        }

        info!("Registered accessory {} from plugin {}", accessory, plugin);
        self.entries.insert(
            accessory.to_string(),
            Registration {
                plugin: plugin.to_string(),
                factory,
            },
        );
        Ok(())
    }

    pub fn is_registered(&self, accessory: &str) -> bool {
        self.entries.contains_key(accessory)
    }

    /// Plugin that owns an accessory type
    pub fn plugin_for(&self, accessory: &str) -> Option<&str> {
        self.entries.get(accessory).map(|r| r.plugin.as_str())
    }

    pub fn create(&self, accessory: &str, config: &Table) -> Result<Box<dyn Accessory>, RegistryError> {
        let registration = self
            .entries
            .get(accessory)
            .ok_or_else(|| RegistryError::UnknownAccessory(accessory.to_string()))?;
        (registration.factory)(config)
    }
}
