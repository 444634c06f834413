//! Process-wide store registry
//!
//! Maps store names to factories, with at most one default. Registration is
//! expected at startup; lookups take a shared read lock only.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::Store;

/// Builds a store instance for one manager scope
pub type StoreFactory = Arc<dyn Fn() -> Result<Arc<dyn Store>, StoreError> + Send + Sync>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Default store is not defined")]
    NoDefault,
    #[error("Store is not registered: {0}")]
    Unknown(String),
    #[error("Store factory for {name} failed: {source}")]
    Factory {
        name: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Default)]
struct RegistryInner {
    factories: HashMap<String, StoreFactory>,
    default: Option<String>,
}

static GLOBAL: Lazy<Arc<StoreRegistry>> = Lazy::new(|| Arc::new(StoreRegistry::new()));

/// Name -> factory table
#[derive(Default)]
pub struct StoreRegistry {
    inner: RwLock<RegistryInner>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry
    pub fn global() -> Arc<StoreRegistry> {
        GLOBAL.clone()
    }

    /// Register `factory` under `name`. With `default = true` the name becomes
    /// the default store, replacing any previous default.
    pub fn register<F>(&self, name: impl Into<String>, factory: F, default: bool)
    where
        F: Fn() -> Result<Arc<dyn Store>, StoreError> + Send + Sync + 'static,
    {
        let name = name.into();
        let mut inner = self.inner.write();
        inner.factories.insert(name.clone(), Arc::new(factory));
        if default {
            if let Some(previous) = inner.default.replace(name.clone()) {
                if previous != name {
                    debug!(previous = %previous, default = %name, "Default store replaced");
                }
            }
        }
        info!(store = %name, default = default, "Store registered");
    }

    /// Register a shared instance; every scope gets the same `Arc`
    pub fn register_instance(&self, name: impl Into<String>, store: Arc<dyn Store>, default: bool) {
        self.register(name, move || Ok(store.clone()), default);
    }

    /// Remove `name`; clears the default if it pointed there
    pub fn unregister(&self, name: &str) -> bool {
        let mut inner = self.inner.write();
        if inner.default.as_deref() == Some(name) {
            inner.default = None;
        }
        inner.factories.remove(name).is_some()
    }

    pub fn make_default(&self, name: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        if !inner.factories.contains_key(name) {
            return Err(RegistryError::Unknown(name.to_string()));
        }
        inner.default = Some(name.to_string());
        Ok(())
    }

    pub fn default_name(&self) -> Option<String> {
        self.inner.read().default.clone()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().factories.contains_key(name)
    }

    /// Sorted registered names
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve `name`, falling back to the default when `None`
    pub fn resolve_name(&self, name: Option<&str>) -> Result<String, RegistryError> {
        let inner = self.inner.read();
        let name = match name {
            Some(name) => name.to_string(),
            None => inner.default.clone().ok_or(RegistryError::NoDefault)?,
        };
        if !inner.factories.contains_key(&name) {
            return Err(RegistryError::Unknown(name));
        }
        Ok(name)
    }

    /// Build the store named `name` (or the default). The factory runs outside
    /// the lock.
    pub fn instantiate(&self, name: Option<&str>) -> Result<(String, Arc<dyn Store>), RegistryError> {
        let (name, factory) = {
            let inner = self.inner.read();
            let name = match name {
                Some(name) => name.to_string(),
                None => inner.default.clone().ok_or(RegistryError::NoDefault)?,
            };
            let factory = inner
                .factories
                .get(&name)
                .cloned()
                .ok_or_else(|| RegistryError::Unknown(name.clone()))?;
            (name, factory)
        };

        let store = factory().map_err(|source| RegistryError::Factory {
            name: name.clone(),
            source,
        })?;
        Ok((name, store))
    }
}
