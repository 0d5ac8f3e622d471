//! In-memory storage implementation
//!
//! Used by tests and by servers that don't need to survive a restart.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicI64, Ordering};

use super::MailStore;
use crate::models::{Alert, IdentityRecord, MessageKind, StoredMessage, Subscription, User};

/// In-memory implementation of MailStore
///
/// Uses HashMaps protected by RwLocks for thread-safe access. Row ids come
/// from one shared counter, so they are unique across tables.
pub struct InMemoryMailStore {
    users: RwLock<HashMap<i64, User>>,
    identities: RwLock<Vec<IdentityRecord>>,
    subscriptions: RwLock<Vec<Subscription>>,
    alerts: RwLock<Vec<Alert>>,
    messages: RwLock<HashMap<i64, StoredMessage>>,
    /// (owner, key) -> value
    data: RwLock<HashMap<(String, String), Vec<u8>>>,
    next_id: AtomicI64,
}

impl InMemoryMailStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            identities: RwLock::new(Vec::new()),
            subscriptions: RwLock::new(Vec::new()),
            alerts: RwLock::new(Vec::new()),
            messages: RwLock::new(HashMap::new()),
            data: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Messages matching `filter`, oldest first
    fn select_messages(&self, filter: impl Fn(&StoredMessage) -> bool) -> Vec<StoredMessage> {
        let messages = self.messages.read().unwrap();
        let mut result: Vec<_> = messages.values().filter(|m| filter(m)).cloned().collect();
        result.sort_by_key(|m| (m.timestamp, m.id));
        result
    }

    fn select_served(&self, filter: impl Fn(&StoredMessage) -> bool) -> Vec<StoredMessage> {
        self.select_messages(|m| m.is_served() && filter(m))
    }
}

impl Default for InMemoryMailStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MailStore for InMemoryMailStore {
    fn insert_user(&self, mut user: User) -> Result<i64> {
        user.id = self.allocate_id();
        let id = user.id;
        self.users.write().unwrap().insert(id, user);
        Ok(id)
    }

    fn update_user(&self, user: &User) -> Result<()> {
        let mut users = self.users.write().unwrap();
        match users.get_mut(&user.id) {
            Some(existing) => {
                *existing = user.clone();
                Ok(())
            }
            None => anyhow::bail!("user {} does not exist", user.id),
        }
    }

    fn get_user(&self, id: i64) -> Result<Option<User>> {
        Ok(self.users.read().unwrap().get(&id).cloned())
    }

    fn insert_identity(&self, mut identity: IdentityRecord) -> Result<i64> {
        identity.id = self.allocate_id();
        let id = identity.id;
        self.identities.write().unwrap().push(identity);
        Ok(id)
    }

    fn identities_for_fingerprint(&self, fingerprint: &str) -> Result<Vec<IdentityRecord>> {
        let identities = self.identities.read().unwrap();
        Ok(identities
            .iter()
            .filter(|i| i.fingerprint == fingerprint)
            .cloned()
            .collect())
    }

    fn insert_subscription(&self, mut subscription: Subscription) -> Result<i64> {
        subscription.id = self.allocate_id();
        let id = subscription.id;
        self.subscriptions.write().unwrap().push(subscription);
        Ok(id)
    }

    fn subscriptions_for_user(&self, user_id: i64) -> Result<Vec<Subscription>> {
        let subscriptions = self.subscriptions.read().unwrap();
        Ok(subscriptions
            .iter()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect())
    }

    fn insert_alert(&self, mut alert: Alert) -> Result<i64> {
        alert.id = self.allocate_id();
        let id = alert.id;
        self.alerts.write().unwrap().push(alert);
        Ok(id)
    }

    fn alerts_since(&self, to: &str, since: i64) -> Result<Vec<Alert>> {
        let alerts = self.alerts.read().unwrap();
        let mut result: Vec<_> = alerts
            .iter()
            .filter(|a| a.to == to && a.timestamp > since)
            .cloned()
            .collect();
        result.sort_by_key(|a| (a.timestamp, a.id));
        Ok(result)
    }

    fn insert_message(&self, mut message: StoredMessage) -> Result<i64> {
        message.id = self.allocate_id();
        let id = message.id;
        self.messages.write().unwrap().insert(id, message);
        Ok(id)
    }

    fn messages_with_name(&self, name: &str, author: &str) -> Result<Vec<StoredMessage>> {
        Ok(self.select_served(|m| m.name == name && m.from == author))
    }

    fn messages_from_since(&self, author: &str, since: i64) -> Result<Vec<StoredMessage>> {
        Ok(self.select_served(|m| m.from == author && m.timestamp > since))
    }

    fn sent_messages_since(&self, author: &str, since: i64) -> Result<Vec<StoredMessage>> {
        Ok(self.select_messages(|m| {
            m.kind == MessageKind::Sent && m.from == author && m.timestamp > since
        }))
    }

    fn public_messages_from_since(&self, author: &str, since: i64) -> Result<Vec<StoredMessage>> {
        Ok(self.select_served(|m| m.from == author && m.is_broadcast() && m.timestamp > since))
    }

    fn incoming_messages_since(&self, recipient: &str, since: i64) -> Result<Vec<StoredMessage>> {
        Ok(self.select_served(|m| m.timestamp > since && m.to.iter().any(|t| t == recipient)))
    }

    fn update_message_data(&self, id: i64, expected_version: i64, data: Vec<u8>) -> Result<bool> {
        let mut messages = self.messages.write().unwrap();
        match messages.get_mut(&id) {
            Some(message) if message.version == expected_version => {
                message.data = data;
                message.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn set_data(&self, owner: &str, key: &str, data: &[u8]) -> Result<()> {
        self.data
            .write()
            .unwrap()
            .insert((owner.to_string(), key.to_string()), data.to_vec());
        Ok(())
    }

    fn get_data(&self, owner: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let data = self.data.read().unwrap();
        Ok(data.get(&(owner.to_string(), key.to_string())).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Address;

    fn make_message(name: &str, from: &str, to: &[&str], timestamp: i64) -> StoredMessage {
        let kind = if to.is_empty() {
            MessageKind::OutgoingPublic
        } else {
            MessageKind::OutgoingPrivate
        };
        let to = to.iter().map(|s| s.to_string()).collect();
        let mut message = StoredMessage::new(name, from, to, kind, vec![1, 2, 3]);
        message.timestamp = timestamp;
        message
    }

    #[test]
    fn test_user_by_fingerprint() {
        let store = InMemoryMailStore::new();
        let user_id = store.insert_user(User::new("Alice", "")).unwrap();
        store
            .insert_identity(IdentityRecord::new(user_id, Address::from_fingerprint("aa")))
            .unwrap();

        let user = store.user_for_fingerprint("aa").unwrap().unwrap();
        assert_eq!(user.id, user_id);
        assert_eq!(user.name, "Alice");
        assert!(store.user_for_fingerprint("bb").unwrap().is_none());
    }

    #[test]
    fn test_update_user() {
        let store = InMemoryMailStore::new();
        let id = store.insert_user(User::new("Alice", "")).unwrap();
        let mut user = store.get_user(id).unwrap().unwrap();
        user.avatar = "https://example.com/a.png".to_string();
        store.update_user(&user).unwrap();
        assert_eq!(store.get_user(id).unwrap().unwrap().avatar, user.avatar);

        let mut ghost = user.clone();
        ghost.id = 999;
        assert!(store.update_user(&ghost).is_err());
    }

    #[test]
    fn test_since_queries_are_strict_and_ordered() {
        let store = InMemoryMailStore::new();
        store.insert_message(make_message("late", "a", &[], 30)).unwrap();
        store.insert_message(make_message("early", "a", &[], 20)).unwrap();
        store.insert_message(make_message("cutoff", "a", &[], 10)).unwrap();
        store.insert_message(make_message("private", "a", &["b"], 25)).unwrap();
        store.insert_message(make_message("other", "c", &[], 40)).unwrap();

        let names = |rows: Vec<StoredMessage>| rows.into_iter().map(|m| m.name).collect::<Vec<_>>();

        assert_eq!(
            names(store.public_messages_from_since("a", 10).unwrap()),
            vec!["early", "late"]
        );
        assert_eq!(
            names(store.messages_from_since("a", 10).unwrap()),
            vec!["early", "private", "late"]
        );
        assert_eq!(names(store.incoming_messages_since("b", 0).unwrap()), vec!["private"]);
    }

    #[test]
    fn test_sent_copies_are_kept_apart() {
        let store = InMemoryMailStore::new();
        store.insert_message(make_message("m1", "a", &["b"], 10)).unwrap();
        let mut copy = make_message("m1", "a", &["b"], 10);
        copy.kind = MessageKind::Sent;
        store.insert_message(copy).unwrap();

        assert_eq!(store.messages_with_name("m1", "a").unwrap().len(), 1);
        assert_eq!(store.messages_from_since("a", 0).unwrap().len(), 1);
        assert_eq!(store.incoming_messages_since("b", 0).unwrap().len(), 1);

        let sent = store.sent_messages_since("a", 0).unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, MessageKind::Sent);
        assert!(store.sent_messages_since("a", 10).unwrap().is_empty());
    }

    #[test]
    fn test_update_message_compare_and_swap() {
        let store = InMemoryMailStore::new();
        let id = store.insert_message(make_message("m1", "a", &[], 1)).unwrap();

        assert!(store.update_message_data(id, 0, vec![9]).unwrap());
        // Stale version loses
        assert!(!store.update_message_data(id, 0, vec![8]).unwrap());

        let row = &store.messages_with_name("m1", "a").unwrap()[0];
        assert_eq!(row.data, vec![9]);
        assert_eq!(row.version, 1);
        assert_eq!(row.timestamp, 1);
    }

    #[test]
    fn test_alerts_since() {
        let store = InMemoryMailStore::new();
        for (to, ts) in [("b", 5), ("b", 15), ("c", 20)] {
            store
                .insert_alert(Alert {
                    id: 0,
                    to: to.to_string(),
                    from: "a".to_string(),
                    name: format!("m{ts}"),
                    location: "localhost:2048".to_string(),
                    timestamp: ts,
                })
                .unwrap();
        }

        let alerts = store.alerts_since("b", 5).unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].name, "m15");
    }

    #[test]
    fn test_data_overwrite() {
        let store = InMemoryMailStore::new();
        assert!(store.get_data("a", "theme").unwrap().is_none());
        store.set_data("a", "theme", b"dark").unwrap();
        store.set_data("a", "theme", b"light").unwrap();
        assert_eq!(store.get_data("a", "theme").unwrap(), Some(b"light".to_vec()));
        assert!(store.get_data("b", "theme").unwrap().is_none());
    }
}
