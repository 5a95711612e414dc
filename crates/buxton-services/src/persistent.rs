//! Persistent backend — a `rusqlite` (bundled SQLite) database file per
//! layer identity, at `<root>/<name>[-<uid>].db` (spec §4.2 / §6).

use std::path::PathBuf;
use std::sync::Mutex;

use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension};

use buxton_core::model::{Key, Label, Value};

use crate::backend::{BackendError, BackendModule, LayerId, StoredRecord};

impl From<rusqlite::Error> for BackendError {
    fn from(e: rusqlite::Error) -> Self {
        BackendError::Io(e.to_string())
    }
}

const SENTINEL_NAME: &str = "";

/// The type tag stored alongside each value so it can be reconstructed.
fn value_type_tag(value: &Value) -> i64 {
    match value {
        Value::String(_) => 1,
        Value::Int32(_) => 2,
        Value::UInt32(_) => 3,
        Value::Int64(_) => 4,
        Value::UInt64(_) => 5,
        Value::Float(_) => 6,
        Value::Double(_) => 7,
        Value::Bool(_) => 8,
    }
}

fn value_to_blob(value: &Value) -> Vec<u8> {
    match value {
        Value::String(s) => s.as_bytes().to_vec(),
        Value::Int32(v) => v.to_le_bytes().to_vec(),
        Value::UInt32(v) => v.to_le_bytes().to_vec(),
        Value::Int64(v) => v.to_le_bytes().to_vec(),
        Value::UInt64(v) => v.to_le_bytes().to_vec(),
        Value::Float(v) => v.to_le_bytes().to_vec(),
        Value::Double(v) => v.to_le_bytes().to_vec(),
        Value::Bool(v) => vec![if *v { 1 } else { 0 }],
    }
}

fn value_from_row(type_tag: i64, blob: &[u8]) -> Result<Value, BackendError> {
    let bad = || BackendError::Io("corrupt stored value".to_string());
    Ok(match type_tag {
        1 => Value::String(String::from_utf8(blob.to_vec()).map_err(|_| bad())?),
        2 => Value::Int32(i32::from_le_bytes(blob.try_into().map_err(|_| bad())?)),
        3 => Value::UInt32(u32::from_le_bytes(blob.try_into().map_err(|_| bad())?)),
        4 => Value::Int64(i64::from_le_bytes(blob.try_into().map_err(|_| bad())?)),
        5 => Value::UInt64(u64::from_le_bytes(blob.try_into().map_err(|_| bad())?)),
        6 => Value::Float(f32::from_le_bytes(blob.try_into().map_err(|_| bad())?)),
        7 => Value::Double(f64::from_le_bytes(blob.try_into().map_err(|_| bad())?)),
        8 => Value::Bool(*blob.first().ok_or_else(bad)? != 0),
        _ => return Err(bad()),
    })
}

/// One SQLite connection per layer identity, opened lazily and kept open
/// for the life of the backend.
pub struct PersistentBackend {
    root: PathBuf,
    connections: DashMap<LayerId, Mutex<Connection>>,
}

impl PersistentBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            connections: DashMap::new(),
        }
    }

    fn db_path(&self, layer: &LayerId) -> PathBuf {
        let (_, name, uid) = layer;
        match uid {
            Some(uid) => self.root.join(format!("{name}-{uid}.db")),
            None => self.root.join(format!("{name}.db")),
        }
    }

    fn with_connection<T>(
        &self,
        layer: &LayerId,
        f: impl FnOnce(&Connection) -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        if !self.connections.contains_key(layer) {
            std::fs::create_dir_all(&self.root)
                .map_err(|e| BackendError::Io(e.to_string()))?;
            let conn = Connection::open(self.db_path(layer))?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS entries (
                    grp TEXT NOT NULL,
                    name TEXT NOT NULL,
                    type_tag INTEGER NOT NULL,
                    label BLOB NOT NULL,
                    value BLOB NOT NULL,
                    PRIMARY KEY (grp, name)
                )",
                [],
            )?;
            self.connections.insert(layer.clone(), Mutex::new(conn));
        }
        let guard = self.connections.get(layer).expect("just inserted");
        let conn = guard.lock().expect("sqlite connection mutex poisoned");
        f(&conn)
    }
}

impl BackendModule for PersistentBackend {
    fn get(&self, layer: &LayerId, key: &Key) -> Result<StoredRecord, BackendError> {
        let name = key.name.as_deref().unwrap_or(SENTINEL_NAME);
        self.with_connection(layer, |conn| {
            conn.query_row(
                "SELECT type_tag, label, value FROM entries WHERE grp = ?1 AND name = ?2",
                params![key.group, name],
                |row| {
                    let type_tag: i64 = row.get(0)?;
                    let label: Vec<u8> = row.get(1)?;
                    let value: Vec<u8> = row.get(2)?;
                    Ok((type_tag, label, value))
                },
            )
            .optional()?
            .map(|(type_tag, label, value)| {
                Ok(StoredRecord {
                    value: value_from_row(type_tag, &value)?,
                    label: Label::new(String::from_utf8_lossy(&label).into_owned())
                        .map_err(|e| BackendError::Io(e.to_string()))?,
                })
            })
            .unwrap_or(Err(BackendError::NotFound))
        })
    }

    fn set(
        &self,
        layer: &LayerId,
        key: &Key,
        value: Value,
        label: Label,
    ) -> Result<(), BackendError> {
        let name = key.name.as_deref().unwrap_or(SENTINEL_NAME);
        let type_tag = value_type_tag(&value);
        let blob = value_to_blob(&value);
        self.with_connection(layer, |conn| {
            conn.execute(
                "INSERT INTO entries (grp, name, type_tag, label, value) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(grp, name) DO UPDATE SET type_tag = excluded.type_tag, label = excluded.label, value = excluded.value",
                params![key.group, name, type_tag, label.as_bytes(), blob],
            )?;
            Ok(())
        })
    }

    fn unset(&self, layer: &LayerId, key: &Key) -> Result<(), BackendError> {
        let name = key.name.as_deref().unwrap_or(SENTINEL_NAME);
        self.with_connection(layer, |conn| {
            let changed = conn.execute(
                "DELETE FROM entries WHERE grp = ?1 AND name = ?2",
                params![key.group, name],
            )?;
            if changed == 0 {
                Err(BackendError::NotFound)
            } else {
                Ok(())
            }
        })
    }

    fn list(&self, layer: &LayerId) -> Result<Vec<Key>, BackendError> {
        self.with_connection(layer, |conn| {
            let mut stmt = conn.prepare("SELECT grp, name FROM entries")?;
            let rows = stmt
                .query_map([], |row| {
                    let group: String = row.get(0)?;
                    let name: String = row.get(1)?;
                    Ok((group, name))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows
                .into_iter()
                .map(|(group, name)| Key {
                    layer: Some(layer.1.clone()),
                    group,
                    name: if name.is_empty() { None } else { Some(name) },
                })
                .collect())
        })
    }

    fn remove_group(&self, layer: &LayerId, group: &str) -> Result<Vec<Key>, BackendError> {
        self.with_connection(layer, |conn| {
            let mut stmt = conn.prepare("SELECT name FROM entries WHERE grp = ?1")?;
            let names: Vec<String> = stmt
                .query_map(params![group], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            conn.execute("DELETE FROM entries WHERE grp = ?1", params![group])?;
            Ok(names
                .into_iter()
                .map(|name| Key {
                    layer: Some(layer.1.clone()),
                    group: group.to_string(),
                    name: if name.is_empty() { None } else { Some(name) },
                })
                .collect())
        })
    }
}
