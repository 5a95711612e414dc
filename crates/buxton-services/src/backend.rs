//! Backend capability trait and registry (spec §4.2, §9's "dynamic
//! dispatch to backends" design note).
//!
//! A backend is modeled as a trait object with exactly four entries
//! (get/set/unset/list). The registry loads a named backend lazily on
//! first reference, caches it, and hands out per-layer handles keyed by
//! `(backend, layer.name, layer.owning_uid?)`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use buxton_core::model::{Key, Label, Value};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("unknown backend {0:?}")]
    UnknownBackend(String),
    #[error("key not found")]
    NotFound,
    #[error("backend I/O error: {0}")]
    Io(String),
}

/// A stored record: the value plus the label it was stored under.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub value: Value,
    pub label: Label,
}

/// A single layer's database identity, as derived by `Layer::db_identity`.
pub type LayerId = (String, String, Option<u32>);

/// Capability a storage module must provide. Implementations must be
/// `Send + Sync` since the registry hands out shared handles across
/// client tasks.
pub trait BackendModule: Send + Sync {
    fn get(&self, layer: &LayerId, key: &Key) -> Result<StoredRecord, BackendError>;

    fn set(
        &self,
        layer: &LayerId,
        key: &Key,
        value: Value,
        label: Label,
    ) -> Result<(), BackendError>;

    fn unset(&self, layer: &LayerId, key: &Key) -> Result<(), BackendError>;

    /// Enumerate every key stored for this layer identity, sentinel
    /// records included.
    fn list(&self, layer: &LayerId) -> Result<Vec<Key>, BackendError>;

    /// Remove every key under `(layer, group)`, sentinel included.
    /// Returns the removed keys (for notifier fanout).
    fn remove_group(&self, layer: &LayerId, group: &str) -> Result<Vec<Key>, BackendError>;
}

/// A constructor for a named backend, invoked at most once per name.
pub type BackendFactory = Box<dyn Fn() -> Result<Arc<dyn BackendModule>, BackendError> + Send + Sync>;

/// Loads, caches, and dispatches to storage modules by name.
///
/// Teardown (`Drop`) destroys every loaded backend exactly once; the
/// registry holds no more than one instance per backend name, matching
/// spec §4.2.
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
    loaded: Mutex<HashMap<String, Arc<dyn BackendModule>>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            loaded: Mutex::new(HashMap::new()),
        }
    }

    /// Register a factory for a backend name. Replaces any prior factory
    /// for the same name (used only at startup, before any layer has
    /// triggered a load).
    pub fn register(&mut self, name: impl Into<String>, factory: BackendFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Fetch (loading on first reference) the backend for `name`.
    pub fn backend(&self, name: &str) -> Result<Arc<dyn BackendModule>, BackendError> {
        let mut loaded = self.loaded.lock().expect("backend registry mutex poisoned");
        if let Some(existing) = loaded.get(name) {
            return Ok(existing.clone());
        }
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| BackendError::UnknownBackend(name.to_string()))?;
        let backend = factory()?;
        loaded.insert(name.to_string(), backend.clone());
        tracing::info!(backend = name, "backend loaded");
        Ok(backend)
    }

    /// Number of backend instances currently loaded (for tests/status).
    pub fn loaded_count(&self) -> usize {
        self.loaded.lock().expect("backend registry mutex poisoned").len()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn backend_is_loaded_lazily_and_cached() {
        let mut registry = BackendRegistry::new();
        let load_count = Arc::new(AtomicUsize::new(0));
        let counter = load_count.clone();
        registry.register(
            "memory",
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(MemoryBackend::new()) as Arc<dyn BackendModule>)
            }),
        );

        assert_eq!(load_count.load(Ordering::SeqCst), 0);
        registry.backend("memory").unwrap();
        registry.backend("memory").unwrap();
        assert_eq!(load_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_backend_is_an_error() {
        let registry = BackendRegistry::new();
        assert!(matches!(
            registry.backend("nope"),
            Err(BackendError::UnknownBackend(_))
        ));
    }
}
