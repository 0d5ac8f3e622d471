//! The merged mail feed

use log::{debug, info};
use std::time::Instant;

use super::download::{
    deliver_alert, download_message_from_alert, fetch_message, fetch_message_list, held_at,
    resolve,
};
use crate::client::Client;
use crate::error::Result;
use crate::identity::{Address, Identity};
use crate::models::{Mail, StoredMessage, User};
use crate::router::Router;
use crate::storage::MailStore;

/// One feed item; exists only for the duration of a sync call
#[derive(Debug, Clone, PartialEq)]
pub struct MelangeMessage {
    pub mail: Mail,
    /// Name the message is stored under on its server
    pub name: String,
    /// Came from a public subscription rather than an alert or our own outbox
    pub public: bool,
    /// Unix seconds used for ordering
    pub timestamp: i64,
}

impl MelangeMessage {
    fn new(mail: Mail, name: impl Into<String>, public: bool) -> Self {
        Self {
            timestamp: mail.created_at.timestamp(),
            name: name.into(),
            mail,
            public,
        }
    }

    /// Total order: timestamp, then author fingerprint, then name
    fn sort_key(&self) -> (i64, &str, &str) {
        (self.timestamp, self.mail.author.as_str(), self.name.as_str())
    }
}

/// Which sources a sync call reads, and from when
#[derive(Debug, Clone, Copy, Default)]
pub struct FeedOptions {
    pub include_public: bool,
    pub include_private: bool,
    pub include_self: bool,
    /// Only items newer than this (Unix seconds)
    pub since: i64,
}

impl FeedOptions {
    /// All three sources since `since`
    pub fn all(since: i64) -> Self {
        Self {
            include_public: true,
            include_private: true,
            include_self: true,
            since,
        }
    }
}

/// Build the feed for `user`, whose local identity is `key`
///
/// Passes run in order public, private, self; the first failure in any
/// of them fails the call.
pub fn messages(
    router: &dyn Router,
    store: &dyn MailStore,
    key: &Identity,
    user: &User,
    options: FeedOptions,
) -> Result<Vec<MelangeMessage>> {
    let start = Instant::now();
    let since = options.since;
    let mut out = Vec::new();

    if options.include_public {
        for subscription in store.subscriptions_for_user(user.id)? {
            let author = resolve(router, &subscription.address, None)?;
            let list = fetch_message_list(&author, since.max(0) as u64, key)?;
            for desc in &list.content {
                let mail = fetch_message(&held_at(&author, &desc.location), &desc.name, key)?;
                out.push(MelangeMessage::new(mail, &desc.name, true));
            }
        }
    }
    let public = out.len();

    if options.include_private {
        for alert in store.alerts_since(key.fingerprint(), since)? {
            let mail = download_message_from_alert(router, &alert, key)?;
            out.push(MelangeMessage::new(mail, alert.name, false));
        }
    }
    let private = out.len() - public;

    if options.include_self {
        for row in store.sent_messages_since(key.fingerprint(), since)? {
            let to = row.first_recipient().map(Address::from_fingerprint);
            let mail = row.to_mail(key, to)?;
            out.push(MelangeMessage::new(mail, row.name, false));
        }
    }
    let own = out.len() - public - private;

    out.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

    info!(
        "Synced feed for {}: {} public, {} private, {} own in {}ms",
        key.fingerprint(),
        public,
        private,
        own,
        start.elapsed().as_millis()
    );
    Ok(out)
}

/// Publish through `client`, keep a sent copy in `store`, and alert
/// every recipient when `alert` is set
///
/// The sent copy is what the self pass of [`messages`] reads back. It is
/// never served, so `store` may be the one the home server uses.
/// Recipients without a known location are resolved with
/// [`Router::lookup`]. The first failed alert fails the call; the message
/// itself stays published.
pub fn publish_and_record(
    router: &dyn Router,
    client: &Client,
    store: &dyn MailStore,
    mail: &Mail,
    to: &[Address],
    name: &str,
    alert: bool,
) -> Result<String> {
    let name = client.publish_message(mail, to, name, alert)?;
    let row = StoredMessage::outgoing(name.clone(), client.key(), mail)?;
    store.insert_message(row)?;
    debug!("Recorded sent message {}", name);

    if alert {
        for recipient in to {
            let recipient = if recipient.has_location() {
                recipient.clone()
            } else {
                router.lookup(&recipient.fingerprint)?
            };
            deliver_alert(&name, client.key(), &recipient, &client.server().location)?;
        }
    }
    Ok(name)
}
