//! The resolver: layer-ordered lookup, access enforcement, and the
//! mutation entry points behind every wire operation (spec §4.3).

use buxton_core::model::{Key, Label, Layer, LayerKind, Value};

use crate::access::AccessRules;
use crate::backend::{BackendError, BackendModule, BackendRegistry, StoredRecord};
use crate::notifier::{ClientId, Notifier, Subscription};
use std::sync::Arc;

/// Turns a backend miss into `ResolverError::NotFound` rather than letting
/// it fall through the blanket `BackendError` conversion to `Backend(_)`
/// (which status-maps to `FAILED`, not a not-found code).
fn require_record(result: Result<StoredRecord, BackendError>) -> Result<StoredRecord, ResolverError> {
    match result {
        Ok(record) => Ok(record),
        Err(BackendError::NotFound) => Err(ResolverError::NotFound),
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    #[error("no such layer {0:?}")]
    UnknownLayer(String),
    #[error("operation requires an explicit layer")]
    LayerRequired,
    #[error("key not found")]
    NotFound,
    #[error("group or key already exists")]
    AlreadyExists,
    #[error("permission denied")]
    Denied,
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

impl From<buxton_core::model::KeyError> for ResolverError {
    fn from(_: buxton_core::model::KeyError) -> Self {
        ResolverError::NotFound
    }
}

/// The caller's identity, as derived from `SO_PEERCRED`/`SO_PEERSEC` by the
/// session layer (or supplied directly in in-process/test mode).
#[derive(Debug, Clone)]
pub struct Caller {
    pub uid: u32,
    pub label: Label,
}

impl Caller {
    pub fn root(label: Label) -> Self {
        Self { uid: 0, label }
    }
}

/// What changed, handed back to the dispatch layer so it can build the
/// `CHANGED` frames without re-querying the resolver.
#[derive(Debug, Clone)]
pub struct ChangeNotification {
    pub subscription: Subscription,
    pub key: Key,
    /// `None` for an `UNSET` — the resolved Open Question on CHANGED
    /// payloads for removed keys (SPEC_FULL.md §9).
    pub value: Option<Value>,
    pub label: Option<Label>,
}

/// Marker name under which whole-group subscriptions are recorded in the
/// notifier's `name` slot (a group key's `name` is always `None`).
const GROUP_SENTINEL_NAME: &str = "";

pub struct Resolver {
    layers: Vec<Layer>,
    backends: BackendRegistry,
    access: AccessRules,
    notifier: Notifier,
}

impl Resolver {
    pub fn new(layers: Vec<Layer>, backends: BackendRegistry, access: AccessRules) -> Self {
        Self {
            layers,
            backends,
            access,
            notifier: Notifier::new(),
        }
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn access(&self) -> &AccessRules {
        &self.access
    }

    fn find_layer(&self, name: &str) -> Result<&Layer, ResolverError> {
        self.layers
            .iter()
            .find(|l| l.name == name)
            .ok_or_else(|| ResolverError::UnknownLayer(name.to_string()))
    }

    /// Search order: highest-priority `system` layer containing the key;
    /// failing that, highest-priority `user` layer containing it. Ties
    /// within a kind break by configured (insertion) order (invariant 6).
    fn ordered_layers(&self) -> Vec<&Layer> {
        let mut idx: Vec<usize> = (0..self.layers.len()).collect();
        idx.sort_by(|&a, &b| {
            let rank = |l: &Layer| match l.kind {
                LayerKind::System => 0,
                LayerKind::User => 1,
            };
            let la = &self.layers[a];
            let lb = &self.layers[b];
            rank(la).cmp(&rank(lb)).then(lb.priority.cmp(&la.priority))
        });
        idx.into_iter().map(|i| &self.layers[i]).collect()
    }

    fn backend_for(&self, layer: &Layer) -> Result<Arc<dyn BackendModule>, ResolverError> {
        Ok(self.backends.backend(&layer.backend_id)?)
    }

    fn bind(&self, layer: &Layer, caller: &Caller) -> Layer {
        layer.bound_to(caller.uid)
    }

    /// Cross-layer lookup (no explicit layer named on the key).
    pub fn get(&self, caller: &Caller, key: &Key) -> Result<(Value, Label), ResolverError> {
        if key.layer.is_some() {
            return self.get_in_layer(caller, key);
        }
        for layer in self.ordered_layers() {
            let bound = self.bind(layer, caller);
            let backend = self.backend_for(&bound)?;
            match backend.get(&bound.db_identity(), key) {
                Ok(record) => {
                    if !self.access.may_access(
                        caller.label.as_str(),
                        record.label.as_str(),
                        buxton_core::model::AccessMode::Read,
                    ) {
                        return Err(ResolverError::Denied);
                    }
                    return Ok((record.value, record.label));
                }
                Err(BackendError::NotFound) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(ResolverError::NotFound)
    }

    /// Lookup pinned to the layer named on the key (invariant: every
    /// mutation requires this; reads may use it too).
    pub fn get_in_layer(&self, caller: &Caller, key: &Key) -> Result<(Value, Label), ResolverError> {
        let name = key.layer.as_deref().ok_or(ResolverError::LayerRequired)?;
        let layer = self.find_layer(name)?;
        let bound = self.bind(layer, caller);
        let backend = self.backend_for(&bound)?;
        let record = require_record(backend.get(&bound.db_identity(), key))?;
        if !self.access.may_access(
            caller.label.as_str(),
            record.label.as_str(),
            buxton_core::model::AccessMode::Read,
        ) {
            return Err(ResolverError::Denied);
        }
        Ok((record.value, record.label))
    }

    /// System-layer writes require uid 0 unless the root check has been
    /// disabled for test/debug purposes (invariant 4).
    fn enforce_root_for_system_layer(&self, layer: &Layer, caller: &Caller) -> Result<(), ResolverError> {
        if layer.kind == LayerKind::System && buxton_core::root_check_enabled() && caller.uid != 0 {
            return Err(ResolverError::Denied);
        }
        Ok(())
    }

    pub fn set(&self, caller: &Caller, key: &Key, value: Value) -> Result<Vec<ChangeNotification>, ResolverError> {
        let name = key.require_layer()?;
        let layer = self.find_layer(name)?;
        let bound = self.bind(layer, caller);
        let backend = self.backend_for(&bound)?;
        let id = bound.db_identity();

        let group_key = key.group_key();
        if group_key != *key {
            let group_record = require_record(backend.get(&id, &group_key))?;
            if !self.access.may_access(
                caller.label.as_str(),
                group_record.label.as_str(),
                buxton_core::model::AccessMode::Write,
            ) {
                return Err(ResolverError::Denied);
            }
        }

        let label = match backend.get(&id, key) {
            Ok(existing) => {
                if !self.access.may_access(
                    caller.label.as_str(),
                    existing.label.as_str(),
                    buxton_core::model::AccessMode::Write,
                ) {
                    return Err(ResolverError::Denied);
                }
                existing.label
            }
            Err(BackendError::NotFound) => caller.label.clone(),
            Err(e) => return Err(e.into()),
        };

        backend.set(&id, key, value.clone(), label.clone())?;
        Ok(self.fanout(key, Some(value), Some(label)))
    }

    pub fn unset(&self, caller: &Caller, key: &Key) -> Result<Vec<ChangeNotification>, ResolverError> {
        let name = key.require_layer()?;
        let layer = self.find_layer(name)?;
        let bound = self.bind(layer, caller);
        let backend = self.backend_for(&bound)?;
        let id = bound.db_identity();

        let group_key = key.group_key();
        let group_record = require_record(backend.get(&id, &group_key))?;
        if !self.access.may_access(
            caller.label.as_str(),
            group_record.label.as_str(),
            buxton_core::model::AccessMode::Write,
        ) {
            return Err(ResolverError::Denied);
        }

        let existing = require_record(backend.get(&id, key))?;
        if !self.access.may_access(
            caller.label.as_str(),
            existing.label.as_str(),
            buxton_core::model::AccessMode::Write,
        ) {
            return Err(ResolverError::Denied);
        }
        backend.unset(&id, key)?;
        Ok(self.fanout(key, None, None))
    }

    pub fn create_group(&self, caller: &Caller, key: &Key) -> Result<Vec<ChangeNotification>, ResolverError> {
        let group_key = key.group_key();
        let name = group_key.require_layer()?;
        let layer = self.find_layer(name)?;
        self.enforce_root_for_system_layer(layer, caller)?;
        let bound = self.bind(layer, caller);
        let backend = self.backend_for(&bound)?;
        let id = bound.db_identity();

        if backend.get(&id, &group_key).is_ok() {
            return Err(ResolverError::AlreadyExists);
        }
        let label = Label::default_label();
        backend.set(&id, &group_key, Value::group_sentinel(), label.clone())?;
        Ok(self.fanout(&group_key, Some(Value::group_sentinel()), Some(label)))
    }

    pub fn remove_group(&self, caller: &Caller, key: &Key) -> Result<Vec<ChangeNotification>, ResolverError> {
        let group_key = key.group_key();
        let name = group_key.require_layer()?;
        let layer = self.find_layer(name)?;
        self.enforce_root_for_system_layer(layer, caller)?;
        let bound = self.bind(layer, caller);
        let backend = self.backend_for(&bound)?;
        let id = bound.db_identity();

        let existing = require_record(backend.get(&id, &group_key))?;
        if layer.kind == LayerKind::User
            && !self.access.may_access(
                caller.label.as_str(),
                existing.label.as_str(),
                buxton_core::model::AccessMode::Write,
            )
        {
            return Err(ResolverError::Denied);
        }
        let removed = backend.remove_group(&id, &group_key.group)?;
        let mut notifications = Vec::new();
        for removed_key in removed {
            notifications.extend(self.fanout(&removed_key, None, None));
        }
        Ok(notifications)
    }

    pub fn set_label(&self, caller: &Caller, key: &Key, new_label: Label) -> Result<Vec<ChangeNotification>, ResolverError> {
        let name = key.require_layer()?;
        let layer = self.find_layer(name)?;
        if layer.kind != LayerKind::System {
            return Err(ResolverError::Denied);
        }
        self.enforce_root_for_system_layer(layer, caller)?;
        let bound = self.bind(layer, caller);
        let backend = self.backend_for(&bound)?;
        let id = bound.db_identity();

        let existing = require_record(backend.get(&id, key))?;
        if !self.access.may_access(
            caller.label.as_str(),
            existing.label.as_str(),
            buxton_core::model::AccessMode::Write,
        ) {
            return Err(ResolverError::Denied);
        }
        backend.set(&id, key, existing.value.clone(), new_label.clone())?;
        Ok(self.fanout(key, Some(existing.value), Some(new_label)))
    }

    /// List every key in a single layer, filtered to those the caller may
    /// read.
    pub fn list(&self, caller: &Caller, layer_name: &str) -> Result<Vec<Key>, ResolverError> {
        let layer = self.find_layer(layer_name)?;
        let bound = self.bind(layer, caller);
        let backend = self.backend_for(&bound)?;
        let id = bound.db_identity();
        let keys = backend.list(&id)?;
        Ok(keys
            .into_iter()
            .filter(|k| match backend.get(&id, k) {
                Ok(record) => self.access.may_access(
                    caller.label.as_str(),
                    record.label.as_str(),
                    buxton_core::model::AccessMode::Read,
                ),
                Err(_) => false,
            })
            .collect())
    }

    pub fn subscribe(&self, key: &Key, client_id: ClientId, msgid: u64) {
        let name = key.name.as_deref().unwrap_or(GROUP_SENTINEL_NAME);
        self.notifier.subscribe(&key.group, name, client_id, msgid);
    }

    pub fn unsubscribe(&self, client_id: ClientId, msgid: u64) -> bool {
        self.notifier.unsubscribe(client_id, msgid)
    }

    pub fn retract_client(&self, client_id: ClientId) {
        self.notifier.retract_client(client_id);
    }

    fn fanout(&self, key: &Key, value: Option<Value>, label: Option<Label>) -> Vec<ChangeNotification> {
        let name = key.name.as_deref().unwrap_or(GROUP_SENTINEL_NAME);
        let mut subs = self.notifier.subscribers(&key.group, name);
        if name != GROUP_SENTINEL_NAME {
            subs.extend(self.notifier.subscribers(&key.group, GROUP_SENTINEL_NAME));
        }
        subs.into_iter()
            .map(|subscription| ChangeNotification {
                subscription,
                key: key.clone(),
                value: value.clone(),
                label: label.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;

    fn layer(name: &str, kind: LayerKind, priority: u32) -> Layer {
        Layer {
            name: name.to_string(),
            kind,
            backend_id: "memory".to_string(),
            priority,
            description: String::new(),
            owning_uid: None,
        }
    }

    fn resolver(layers: Vec<Layer>) -> Resolver {
        resolver_with_access(layers, AccessRules::empty())
    }

    fn resolver_with_access(layers: Vec<Layer>, access: AccessRules) -> Resolver {
        let mut registry = BackendRegistry::new();
        registry.register("memory", Box::new(|| Ok(Arc::new(MemoryBackend::new()) as Arc<dyn BackendModule>)));
        Resolver::new(layers, registry, access)
    }

    fn caller() -> Caller {
        Caller { uid: 0, label: Label::default_label() }
    }

    fn create_group(resolver: &Resolver, layer: &str, group: &str) {
        let key = Key::new(Some(layer.into()), group.into(), None).unwrap();
        resolver.create_group(&caller(), &key).unwrap();
    }

    #[test]
    fn set_then_get_round_trips_through_named_layer() {
        let resolver = resolver(vec![layer("base", LayerKind::System, 10)]);
        create_group(&resolver, "base", "net");
        let key = Key::new(Some("base".into()), "net".into(), Some("mtu".into())).unwrap();
        resolver.set(&caller(), &key, Value::Int32(1500)).unwrap();

        let (value, label) = resolver.get_in_layer(&caller(), &key).unwrap();
        assert_eq!(value, Value::Int32(1500));
        assert_eq!(label.as_str(), "_");
    }

    #[test]
    fn cross_layer_get_prefers_higher_priority_system_layer() {
        let resolver = resolver(vec![
            layer("low", LayerKind::System, 1),
            layer("high", LayerKind::System, 100),
        ]);
        create_group(&resolver, "low", "net");
        create_group(&resolver, "high", "net");
        let low_key = Key::new(Some("low".into()), "net".into(), Some("mtu".into())).unwrap();
        let high_key = Key::new(Some("high".into()), "net".into(), Some("mtu".into())).unwrap();
        resolver.set(&caller(), &low_key, Value::Int32(1)).unwrap();
        resolver.set(&caller(), &high_key, Value::Int32(2)).unwrap();

        let lookup = Key::new(None, "net".into(), Some("mtu".into())).unwrap();
        let (value, _) = resolver.get(&caller(), &lookup).unwrap();
        assert_eq!(value, Value::Int32(2));
    }

    #[test]
    fn system_layer_set_is_label_gated_not_root_gated() {
        // set/unset check Smack WRITE labels, not uid; group/label operations
        // are the ones root-gated via `enforce_root_for_system_layer`.
        let resolver = resolver(vec![layer("base", LayerKind::System, 10)]);
        create_group(&resolver, "base", "net");
        let key = Key::new(Some("base".into()), "net".into(), Some("mtu".into())).unwrap();
        let non_root = Caller { uid: 1000, label: Label::default_label() };
        resolver.set(&non_root, &key, Value::Int32(1500)).unwrap();

        let (value, _) = resolver.get_in_layer(&non_root, &key).unwrap();
        assert_eq!(value, Value::Int32(1500));
    }

    #[test]
    fn set_denied_without_write_on_group_label() {
        let resolver = resolver(vec![layer("base", LayerKind::System, 10)]);
        create_group(&resolver, "base", "net");
        let outsider = Caller { uid: 1000, label: Label::new("other").unwrap() };
        let key = Key::new(Some("base".into()), "net".into(), Some("mtu".into())).unwrap();
        assert!(matches!(
            resolver.set(&outsider, &key, Value::Int32(1500)),
            Err(ResolverError::Denied)
        ));
    }

    #[test]
    fn set_adopts_callers_label_for_a_new_value() {
        // Grant "app" WRITE on the default group label so the set below is
        // allowed despite "app" not matching the group's own label.
        let tmp = std::env::temp_dir().join(format!("buxton-resolver-rules-test-{}", std::process::id()));
        std::fs::write(&tmp, "app _ rw\n").unwrap();
        let resolver = resolver_with_access(vec![layer("base", LayerKind::System, 10)], AccessRules::load(&tmp).unwrap());
        create_group(&resolver, "base", "net");

        let labelled = Caller { uid: 0, label: Label::new("app").unwrap() };
        let key = Key::new(Some("base".into()), "net".into(), Some("mtu".into())).unwrap();
        resolver.set(&labelled, &key, Value::Int32(1500)).unwrap();

        let (_, label) = resolver.get_in_layer(&labelled, &key).unwrap();
        assert_eq!(label.as_str(), "app");

        std::fs::remove_file(&tmp).ok();
    }

    #[test]
    fn remove_group_on_system_layer_skips_group_label_check() {
        // Root gate already covers system-layer removal; the group-label
        // WRITE check only applies to user layers.
        let resolver = resolver(vec![layer("base", LayerKind::System, 10)]);
        create_group(&resolver, "base", "net");
        let odd_label_caller = Caller { uid: 0, label: Label::new("other").unwrap() };
        let key = Key::new(Some("base".into()), "net".into(), None).unwrap();
        resolver.remove_group(&odd_label_caller, &key).unwrap();
    }

    #[test]
    fn set_label_rejected_on_user_layer() {
        let resolver = resolver(vec![layer("base", LayerKind::User, 10)]);
        create_group(&resolver, "base", "net");
        let key = Key::new(Some("base".into()), "net".into(), Some("mtu".into())).unwrap();
        resolver.set(&caller(), &key, Value::Int32(1500)).unwrap();

        assert!(matches!(
            resolver.set_label(&caller(), &key, Label::new("app.net").unwrap()),
            Err(ResolverError::Denied)
        ));
    }

    #[test]
    fn set_before_group_exists_is_not_found() {
        let resolver = resolver(vec![layer("base", LayerKind::System, 10)]);
        let key = Key::new(Some("base".into()), "net".into(), Some("hostname".into())).unwrap();
        assert!(matches!(
            resolver.set(&caller(), &key, Value::String("box".into())),
            Err(ResolverError::NotFound)
        ));
    }

    #[test]
    fn unset_on_missing_value_is_not_found() {
        let resolver = resolver(vec![layer("base", LayerKind::System, 10)]);
        create_group(&resolver, "base", "net");
        let key = Key::new(Some("base".into()), "net".into(), Some("mtu".into())).unwrap();
        assert!(matches!(resolver.unset(&caller(), &key), Err(ResolverError::NotFound)));
    }

    #[test]
    fn create_group_twice_is_already_exists() {
        let resolver = resolver(vec![layer("base", LayerKind::System, 10)]);
        let key = Key::new(Some("base".into()), "net".into(), None).unwrap();
        resolver.create_group(&caller(), &key).unwrap();
        assert!(matches!(
            resolver.create_group(&caller(), &key),
            Err(ResolverError::AlreadyExists)
        ));
    }

    #[test]
    fn subscriber_is_notified_on_set_and_unset() {
        let resolver = resolver(vec![layer("base", LayerKind::System, 10)]);
        create_group(&resolver, "base", "net");
        let key = Key::new(Some("base".into()), "net".into(), Some("mtu".into())).unwrap();
        resolver.subscribe(&key, 1, 42);

        let notifications = resolver.set(&caller(), &key, Value::Int32(1500)).unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].value, Some(Value::Int32(1500)));

        let notifications = resolver.unset(&caller(), &key).unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].value, None);
    }

    #[test]
    fn group_level_subscriber_sees_child_key_changes() {
        let resolver = resolver(vec![layer("base", LayerKind::System, 10)]);
        create_group(&resolver, "base", "net");
        let group_key = Key::new(Some("base".into()), "net".into(), None).unwrap();
        let child_key = Key::new(Some("base".into()), "net".into(), Some("mtu".into())).unwrap();
        resolver.subscribe(&group_key, 5, 1);

        let notifications = resolver.set(&caller(), &child_key, Value::Int32(9000)).unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].subscription.client_id, 5);
    }
}
