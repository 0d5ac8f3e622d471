//! Storage trait definitions

use crate::models::{Alert, IdentityRecord, StoredMessage, Subscription, User};
use anyhow::Result;

/// Trait for mail server persistence
///
/// The narrow select/insert/update capability the protocol layer needs over
/// users, identities, subscriptions, alerts, messages and opaque data.
/// "Since" queries are strict: rows with `timestamp > since`, oldest first.
pub trait MailStore: Send + Sync {
    // === Users ===

    /// Insert a user, returning its assigned id
    fn insert_user(&self, user: User) -> Result<i64>;

    /// Overwrite an existing user's profile fields
    fn update_user(&self, user: &User) -> Result<()>;

    fn get_user(&self, id: i64) -> Result<Option<User>>;

    // === Identities ===

    /// Link a signing address to a user, returning the record id
    fn insert_identity(&self, identity: IdentityRecord) -> Result<i64>;

    fn identities_for_fingerprint(&self, fingerprint: &str) -> Result<Vec<IdentityRecord>>;

    /// The user owning `fingerprint`, if any identity links to one
    fn user_for_fingerprint(&self, fingerprint: &str) -> Result<Option<User>> {
        match self.identities_for_fingerprint(fingerprint)?.first() {
            Some(identity) => self.get_user(identity.owner),
            None => Ok(None),
        }
    }

    // === Subscriptions ===

    fn insert_subscription(&self, subscription: Subscription) -> Result<i64>;

    fn subscriptions_for_user(&self, user_id: i64) -> Result<Vec<Subscription>>;

    // === Alerts ===

    fn insert_alert(&self, alert: Alert) -> Result<i64>;

    /// Alerts addressed to `to` newer than `since`
    fn alerts_since(&self, to: &str, since: i64) -> Result<Vec<Alert>>;

    // === Messages ===

    /// Insert a message row, returning its assigned id
    fn insert_message(&self, message: StoredMessage) -> Result<i64>;

    /// Every served row matching `(name, author)`; callers decide what a
    /// count other than one means
    ///
    /// This and the other served-message queries skip
    /// [`MessageKind::Sent`](crate::models::MessageKind::Sent) rows.
    fn messages_with_name(&self, name: &str, author: &str) -> Result<Vec<StoredMessage>>;

    /// Everything `author` published newer than `since`
    fn messages_from_since(&self, author: &str, since: i64) -> Result<Vec<StoredMessage>>;

    /// `author`'s own sent copies newer than `since`
    fn sent_messages_since(&self, author: &str, since: i64) -> Result<Vec<StoredMessage>>;

    /// Broadcast messages (no recipient) `author` published newer than `since`
    fn public_messages_from_since(&self, author: &str, since: i64) -> Result<Vec<StoredMessage>>;

    /// Messages addressed to `recipient` newer than `since`
    fn incoming_messages_since(&self, recipient: &str, since: i64) -> Result<Vec<StoredMessage>>;

    /// Replace a message's payload if its version still equals
    /// `expected_version`
    ///
    /// Returns `false` when the row was changed (or removed) concurrently.
    /// On success the version increments; name, author and timestamp are
    /// preserved.
    fn update_message_data(&self, id: i64, expected_version: i64, data: Vec<u8>) -> Result<bool>;

    // === Opaque data ===

    /// Insert or overwrite a value under `(owner, key)`
    fn set_data(&self, owner: &str, key: &str, data: &[u8]) -> Result<()>;

    fn get_data(&self, owner: &str, key: &str) -> Result<Option<Vec<u8>>>;
}
