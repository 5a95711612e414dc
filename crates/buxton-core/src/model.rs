//! Core data model: `Value`, `Key`, `Layer`, `Label`.
//!
//! See spec §3. Labels flow through as borrowed byte slices where possible;
//! anything that crosses a layer boundary for storage owns its bytes.

use serde::{Deserialize, Serialize};

/// An opaque access-control label. Non-empty (length >= 2) for every
/// persisted record; `⊥` is represented as `Label::direct()` / `None` at
/// the client boundary, never as an empty `Label`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Label(String);

/// Default label adopted by direct (unlabelled) clients that create a
/// record with no pre-existing label to inherit.
pub const DEFAULT_LABEL: &str = "_";

/// Minimum byte length of a legal label (invariant 1).
pub const MIN_LABEL_LEN: usize = 2;

impl Label {
    pub fn new(s: impl Into<String>) -> Result<Self, LabelError> {
        let s = s.into();
        if s.len() < MIN_LABEL_LEN {
            return Err(LabelError::TooShort(s));
        }
        Ok(Self(s))
    }

    pub fn default_label() -> Self {
        Self(DEFAULT_LABEL.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LabelError {
    #[error("label {0:?} is shorter than the minimum of {MIN_LABEL_LEN} bytes")]
    TooShort(String),
}

/// Value access mode, passed to `may_access`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    Execute,
}

/// A tagged union over the wire value types (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    String(String),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float(f32),
    Double(f64),
    Bool(bool),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::String(_) => "string",
            Value::Int32(_) => "int32",
            Value::UInt32(_) => "uint32",
            Value::Int64(_) => "int64",
            Value::UInt64(_) => "uint64",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::Bool(_) => "bool",
        }
    }

    /// The dummy value stored in every group sentinel record.
    pub fn group_sentinel() -> Self {
        Value::String("BUXTON_GROUP_VALUE".to_string())
    }

    pub fn is_group_sentinel(&self) -> bool {
        matches!(self, Value::String(s) if s == "BUXTON_GROUP_VALUE")
    }
}

/// Layer kind — governs the root-privilege rule for mutations (invariant 4)
/// and whether `owning_uid` is bound (invariant 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerKind {
    System,
    User,
}

/// A configured layer: name, kind, backend, priority, description, and
/// (for user layers) the owning uid bound per-request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer {
    pub name: String,
    pub kind: LayerKind,
    pub backend_id: String,
    pub priority: u32,
    pub description: String,
    /// Bound per-request for user layers from the caller's effective uid;
    /// `None` for system layers and for a user layer not yet bound to a
    /// specific caller.
    pub owning_uid: Option<u32>,
}

impl Layer {
    /// The database identity tuple used by the backend registry to key
    /// per-layer storage: `(backend, layer.name, layer.owning_uid?)`.
    pub fn db_identity(&self) -> (String, String, Option<u32>) {
        let uid = match self.kind {
            LayerKind::User => self.owning_uid,
            LayerKind::System => None,
        };
        (self.backend_id.clone(), self.name.clone(), uid)
    }

    /// Bind this layer's `owning_uid` to a specific caller, as required
    /// for every operation on a user layer (invariant 5). A system layer
    /// is returned unchanged.
    pub fn bound_to(&self, uid: u32) -> Layer {
        let mut bound = self.clone();
        if bound.kind == LayerKind::User {
            bound.owning_uid = Some(uid);
        }
        bound
    }
}

/// A key triple `(layer?, group, name?)` (spec §3).
///
/// `group` and `name` are validated non-empty, NUL-free UTF-8 at
/// construction time so the resolver never has to re-check them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    pub layer: Option<String>,
    pub group: String,
    pub name: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key component must be non-empty")]
    Empty,
    #[error("key component must not contain a NUL byte")]
    ContainsNul,
    #[error("mutation requires an explicit layer")]
    LayerRequired,
}

fn validate_component(s: &str) -> Result<(), KeyError> {
    if s.is_empty() {
        return Err(KeyError::Empty);
    }
    if s.contains('\0') {
        return Err(KeyError::ContainsNul);
    }
    Ok(())
}

impl Key {
    pub fn new(
        layer: Option<String>,
        group: String,
        name: Option<String>,
    ) -> Result<Self, KeyError> {
        validate_component(&group)?;
        if let Some(n) = &name {
            validate_component(n)?;
        }
        Ok(Self { layer, group, name })
    }

    /// Is this key the group sentinel itself (`name` absent)?
    pub fn is_group_key(&self) -> bool {
        self.name.is_none()
    }

    /// The sentinel key for this key's `(layer, group)` pair.
    pub fn group_key(&self) -> Key {
        Key {
            layer: self.layer.clone(),
            group: self.group.clone(),
            name: None,
        }
    }

    /// Require `layer` to be set, as every mutation does.
    pub fn require_layer(&self) -> Result<&str, KeyError> {
        self.layer.as_deref().ok_or(KeyError::LayerRequired)
    }
}
