//! In-memory backend — non-persistent, used by ephemeral layers and by
//! the test suite.

use dashmap::DashMap;

use buxton_core::model::{Key, Label, Value};

use crate::backend::{BackendError, BackendModule, LayerId, StoredRecord};

type RecordKey = (String, Option<String>);

#[derive(Default)]
pub struct MemoryBackend {
    layers: DashMap<LayerId, DashMap<RecordKey, StoredRecord>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn layer_table(&self, layer: &LayerId) -> dashmap::mapref::one::Ref<'_, LayerId, DashMap<RecordKey, StoredRecord>> {
        self.layers.entry(layer.clone()).or_default();
        self.layers.get(layer).expect("just inserted")
    }
}

impl BackendModule for MemoryBackend {
    fn get(&self, layer: &LayerId, key: &Key) -> Result<StoredRecord, BackendError> {
        let table = self.layer_table(layer);
        table
            .get(&(key.group.clone(), key.name.clone()))
            .map(|r| r.clone())
            .ok_or(BackendError::NotFound)
    }

    fn set(
        &self,
        layer: &LayerId,
        key: &Key,
        value: Value,
        label: Label,
    ) -> Result<(), BackendError> {
        let table = self.layer_table(layer);
        table.insert((key.group.clone(), key.name.clone()), StoredRecord { value, label });
        Ok(())
    }

    fn unset(&self, layer: &LayerId, key: &Key) -> Result<(), BackendError> {
        let table = self.layer_table(layer);
        table
            .remove(&(key.group.clone(), key.name.clone()))
            .map(|_| ())
            .ok_or(BackendError::NotFound)
    }

    fn list(&self, layer: &LayerId) -> Result<Vec<Key>, BackendError> {
        let table = self.layer_table(layer);
        Ok(table
            .iter()
            .map(|entry| {
                let (group, name) = entry.key().clone();
                Key {
                    layer: Some(layer.1.clone()),
                    group,
                    name,
                }
            })
            .collect())
    }

    fn remove_group(&self, layer: &LayerId, group: &str) -> Result<Vec<Key>, BackendError> {
        let table = self.layer_table(layer);
        let to_remove: Vec<RecordKey> = table
            .iter()
            .filter(|entry| entry.key().0 == group)
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = Vec::with_capacity(to_remove.len());
        for record_key in to_remove {
            table.remove(&record_key);
            removed.push(Key {
                layer: Some(layer.1.clone()),
                group: record_key.0,
                name: record_key.1,
            });
        }
        Ok(removed)
    }
}
