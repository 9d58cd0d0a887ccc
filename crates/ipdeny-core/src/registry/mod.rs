//! Plugin-based adapter registry
//!
//! The registry allows block stores and snapshot sources to be registered
//! dynamically at runtime, avoiding hardcoded if-else chains.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ipdeny_core::registry::AdapterRegistry;
//! use ipdeny_core::config::StoreConfig;
//!
//! // Create a registry with the in-memory store already registered
//! let registry = AdapterRegistry::with_builtins();
//!
//! // Adapter crates register themselves
//! ipdeny_store_sql::register(&registry);
//!
//! // Create a store from config
//! let store = registry.create_store(&StoreConfig::Sql { url }).await?;
//! ```
//!
//! ## Registration
//!
//! Implementations should register themselves during initialization:
//!
//! ```rust,ignore
//! // In ipdeny-source-http crate
//! pub fn register(registry: &AdapterRegistry) {
//!     registry.register_source("http", Box::new(HttpSourceFactory));
//! }
//! ```

use crate::config::{SourceConfig, StoreConfig};
use crate::error::{Error, Result};
use crate::store::MemoryBlockStoreFactory;
use crate::traits::{BlockStore, BlockStoreFactory, SnapshotSource, SnapshotSourceFactory};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Adapter registry for plugin-based store and source creation
///
/// ## Thread Safety
///
/// The registry uses interior mutability with RwLock, allowing concurrent
/// reads and exclusive writes.
#[derive(Default)]
pub struct AdapterRegistry {
    /// Registered block store factories
    stores: RwLock<HashMap<String, Arc<dyn BlockStoreFactory>>>,

    /// Registered snapshot source factories
    sources: RwLock<HashMap<String, Box<dyn SnapshotSourceFactory>>>,
}

// A poisoned lock only means a registering thread panicked; the map itself
// is still usable.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl AdapterRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the adapters this crate ships (`memory`)
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register_store("memory", Box::new(MemoryBlockStoreFactory));
        registry
    }

    /// Register a block store factory
    ///
    /// # Parameters
    ///
    /// - `name`: Store type name (e.g., "sql", "memory")
    /// - `factory`: Factory object for creating store instances
    pub fn register_store(&self, name: impl Into<String>, factory: Box<dyn BlockStoreFactory>) {
        write(&self.stores).insert(name.into(), Arc::from(factory));
    }

    /// Register a snapshot source factory
    ///
    /// # Parameters
    ///
    /// - `name`: Source type name (e.g., "http")
    /// - `factory`: Factory object for creating source instances
    pub fn register_source(
        &self,
        name: impl Into<String>,
        factory: Box<dyn SnapshotSourceFactory>,
    ) {
        write(&self.sources).insert(name.into(), factory);
    }

    /// Create a block store from configuration
    ///
    /// # Returns
    ///
    /// - `Ok(Arc<dyn BlockStore>)`: Created store, connected and ready
    /// - `Err(Error)`: If the store type is not registered or creation fails
    pub async fn create_store(&self, config: &StoreConfig) -> Result<Arc<dyn BlockStore>> {
        let store_type = config.type_name();

        let factory = read(&self.stores)
            .get(store_type)
            .cloned()
            .ok_or_else(|| Error::config(format!("Unknown store type: {}", store_type)))?;

        // Lock released above; factories may connect to a database
        factory.create(config).await
    }

    /// Create a snapshot source from configuration
    ///
    /// # Returns
    ///
    /// - `Ok(Box<dyn SnapshotSource>)`: Created source instance
    /// - `Err(Error)`: If the source type is not registered or creation fails
    pub fn create_source(&self, config: &SourceConfig) -> Result<Box<dyn SnapshotSource>> {
        let source_type = config.type_name();
        let sources = read(&self.sources);

        let factory = sources
            .get(source_type)
            .ok_or_else(|| Error::config(format!("Unknown source type: {}", source_type)))?;

        factory.create(config)
    }

    /// List all registered store types
    pub fn list_stores(&self) -> Vec<String> {
        read(&self.stores).keys().cloned().collect()
    }

    /// List all registered source types
    pub fn list_sources(&self) -> Vec<String> {
        read(&self.sources).keys().cloned().collect()
    }

    /// Check if a store type is registered
    pub fn has_store(&self, name: &str) -> bool {
        read(&self.stores).contains_key(name)
    }

    /// Check if a source type is registered
    pub fn has_source(&self, name: &str) -> bool {
        read(&self.sources).contains_key(name)
    }
}
