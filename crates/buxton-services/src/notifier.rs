//! Subscription graph and change fanout (spec §4.6, §9's subscription
//! graph design note).
//!
//! The notifier only tracks *who* is subscribed to a `(group, name)` pair
//! — it has no notion of a subscriber's label. Per-subscriber label
//! filtering (does the subscriber's label permit READ on the new value's
//! label?) is applied by the caller, which owns the client table.

use dashmap::DashMap;

/// Opaque identifier for a connected client, assigned by the client table.
pub type ClientId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub client_id: ClientId,
    pub msgid: u64,
}

/// Two-level map `group -> name -> subscriptions`, giving delivery that is
/// O(#subscribers) for the changed key without scanning unrelated groups.
#[derive(Default)]
pub struct Notifier {
    groups: DashMap<String, DashMap<String, Vec<Subscription>>>,
    /// Secondary index for O(1) `UNNOTIFY` removal by `(client, msgid)`.
    index: DashMap<(ClientId, u64), (String, String)>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a subscription. Accepted even if `(group, name)` does not
    /// yet exist in any layer — per spec §9's Open Question resolution,
    /// delivery begins on the first future `CREATE-GROUP` + `SET`.
    pub fn subscribe(&self, group: &str, name: &str, client_id: ClientId, msgid: u64) {
        self.groups
            .entry(group.to_string())
            .or_default()
            .entry(name.to_string())
            .or_default()
            .push(Subscription { client_id, msgid });
        self.index
            .insert((client_id, msgid), (group.to_string(), name.to_string()));
    }

    /// Remove the subscription registered under `client_id`'s `msgid`.
    /// Returns `true` if a subscription was found and removed.
    pub fn unsubscribe(&self, client_id: ClientId, msgid: u64) -> bool {
        let Some((_, (group, name))) = self.index.remove(&(client_id, msgid)) else {
            return false;
        };
        if let Some(names) = self.groups.get(&group) {
            if let Some(mut subs) = names.get_mut(&name) {
                subs.retain(|s| !(s.client_id == client_id && s.msgid == msgid));
            }
        }
        true
    }

    /// Retract every subscription held by a disconnecting client.
    pub fn retract_client(&self, client_id: ClientId) {
        let keys: Vec<(ClientId, u64)> = self
            .index
            .iter()
            .filter(|entry| entry.key().0 == client_id)
            .map(|entry| *entry.key())
            .collect();
        for key in keys {
            self.unsubscribe(key.0, key.1);
        }
    }

    /// All subscriptions currently registered for `(group, name)`.
    pub fn subscribers(&self, group: &str, name: &str) -> Vec<Subscription> {
        self.groups
            .get(group)
            .and_then(|names| names.get(name).map(|subs| subs.clone()))
            .unwrap_or_default()
    }

    /// Total subscription count, for status/diagnostics.
    pub fn total_subscriptions(&self) -> usize {
        self.groups
            .iter()
            .flat_map(|names| names.value().iter().map(|e| e.value().len()).collect::<Vec<_>>())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_then_notify_finds_subscriber() {
        let notifier = Notifier::new();
        notifier.subscribe("net", "mtu", 1, 7);
        let subs = notifier.subscribers("net", "mtu");
        assert_eq!(subs, vec![Subscription { client_id: 1, msgid: 7 }]);
    }

    #[test]
    fn unnotify_removes_by_msgid() {
        let notifier = Notifier::new();
        notifier.subscribe("net", "mtu", 1, 7);
        assert!(notifier.unsubscribe(1, 7));
        assert!(notifier.subscribers("net", "mtu").is_empty());
        assert!(!notifier.unsubscribe(1, 7));
    }

    #[test]
    fn disconnect_retracts_every_subscription_for_that_client() {
        let notifier = Notifier::new();
        notifier.subscribe("net", "mtu", 1, 7);
        notifier.subscribe("net", "hostname", 1, 8);
        notifier.subscribe("net", "mtu", 2, 9);

        notifier.retract_client(1);

        assert_eq!(notifier.subscribers("net", "mtu"), vec![Subscription { client_id: 2, msgid: 9 }]);
        assert!(notifier.subscribers("net", "hostname").is_empty());
    }

    #[test]
    fn subscription_before_group_exists_is_accepted() {
        let notifier = Notifier::new();
        notifier.subscribe("not-yet-created", "key", 1, 1);
        assert_eq!(notifier.subscribers("not-yet-created", "key").len(), 1);
    }
}
