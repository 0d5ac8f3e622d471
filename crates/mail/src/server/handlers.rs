//! Persistence-backed mail server handlers
//!
//! [`MailServer`] is the receiving side of the protocol: registration,
//! publish and update, incoming downloads, opaque data, and the
//! by-name / since-cursor retrieval other servers use during sync.
//!
//! Retrieval handlers never fail towards the peer. Storage or
//! reconstruction errors are logged and reported as an absent result.

use log::{debug, error, info, warn};
use std::sync::Arc;

use super::dispatch::{Delegate, RetrievedMail};
use crate::envelope::EncryptedMessage;
use crate::error::{Error, Result};
use crate::identity::{Address, Identity};
use crate::models::{
    Alert, IdentityRecord, Mail, MessageDescription, MessageKind, MessageList, StoredMessage, User,
    components,
};
use crate::storage::MailStore;
use crate::wire::{Data, PublishMessage, ResponseMessage, UpdateMessage};

/// Name reserved for the synthesized profile message
pub const PROFILE_MESSAGE: &str = "profile";

/// Register keys carrying profile fields
pub const NAME_KEY: &str = "name";
pub const AVATAR_KEY: &str = "avatar";

/// Mail server state: persistence, the server key, and its advertised location
pub struct MailServer {
    store: Arc<dyn MailStore>,
    key: Arc<Identity>,
    location: String,
}

impl MailServer {
    pub fn new(store: Arc<dyn MailStore>, key: Arc<Identity>, location: impl Into<String>) -> Self {
        Self {
            store,
            key,
            location: location.into(),
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn store(&self) -> &Arc<dyn MailStore> {
        &self.store
    }

    fn registered_user(&self, address: &Address) -> Result<User> {
        self.store
            .user_for_fingerprint(&address.fingerprint)?
            .ok_or_else(|| Error::NotRegistered(address.fingerprint.clone()))
    }

    /// Create a user and link `from` to it
    ///
    /// Registering an address that is already linked updates that user's
    /// profile fields in place instead of creating a second identity.
    pub fn register(&self, from: &Address, keys: &[Data]) -> Result<()> {
        let value = |name: &str| {
            keys.iter()
                .find(|d| d.key == name)
                .map(|d| String::from_utf8_lossy(&d.data).into_owned())
        };

        if let Some(mut user) = self.store.user_for_fingerprint(&from.fingerprint)? {
            if let Some(name) = value(NAME_KEY) {
                user.name = name;
            }
            if let Some(avatar) = value(AVATAR_KEY) {
                user.avatar = avatar;
            }
            self.store.update_user(&user)?;
            info!("Updated registration for {}", from);
            return Ok(());
        }

        let user = User::new(
            value(NAME_KEY).unwrap_or_default(),
            value(AVATAR_KEY).unwrap_or_default(),
        );
        let user_id = self.store.insert_user(user)?;
        self.store
            .insert_identity(IdentityRecord::new(user_id, from.clone()))?;
        info!("Registered {} as user {}", from, user_id);
        Ok(())
    }

    /// Accepted and ignored; key material is not purged
    pub fn unregister(&self, from: &Address) -> Result<()> {
        debug!("Ignoring unregister from {}", from);
        Ok(())
    }

    /// Store a published envelope under `(name, from)`
    ///
    /// Republishing identical bytes under an existing name is a no-op;
    /// different bytes are a [`Error::Conflict`].
    pub fn publish_message(
        &self,
        from: &Address,
        name: &str,
        to: Vec<String>,
        data: Vec<u8>,
        alert: bool,
    ) -> Result<()> {
        self.registered_user(from)?;
        if name.is_empty() {
            return Err(Error::MissingName);
        }
        EncryptedMessage::from_bytes(&data)?;

        let existing = self.store.messages_with_name(name, &from.fingerprint)?;
        if !existing.is_empty() {
            if existing.iter().any(|m| m.data == data) {
                debug!("Message {} from {} already stored", name, from);
                return Ok(());
            }
            return Err(Error::Conflict(name.to_string()));
        }

        let kind = if alert {
            MessageKind::OutgoingPrivate
        } else {
            MessageKind::OutgoingPublic
        };
        let message = StoredMessage::new(name, from.fingerprint.clone(), to, kind, data);
        self.store.insert_message(message)?;
        debug!("Stored {} message {} from {}", kind.as_str(), name, from);
        Ok(())
    }

    /// Overwrite the payload of the one message named `(name, from)`
    pub fn update_message(&self, from: &Address, name: &str, data: Vec<u8>) -> Result<()> {
        self.registered_user(from)?;
        if name.is_empty() {
            return Err(Error::MissingName);
        }
        EncryptedMessage::from_bytes(&data)?;

        let mut existing = self.store.messages_with_name(name, &from.fingerprint)?;
        if existing.len() != 1 {
            return Err(Error::NotFound(format!(
                "unique message {name:?} ({} matches)",
                existing.len()
            )));
        }
        let message = existing.remove(0);

        if !self
            .store
            .update_message_data(message.id, message.version, data)?
        {
            return Err(Error::Conflict(name.to_string()));
        }
        Ok(())
    }

    /// Messages addressed to `from` newer than `since`
    ///
    /// With `context`, also includes what `from` sent in that window.
    /// Rows whose envelope no longer decodes are logged and skipped.
    pub fn get_messages(&self, from: &Address, since: u64, context: bool) -> Result<Vec<ResponseMessage>> {
        let since = since as i64;
        let mut rows = self.store.incoming_messages_since(&from.fingerprint, since)?;
        if context {
            rows.extend(self.store.messages_from_since(&from.fingerprint, since)?);
            rows.sort_by_key(|m| (m.timestamp, m.id));
            rows.dedup_by_key(|m| m.id);
        }

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            if let Err(e) = EncryptedMessage::from_bytes(&row.data) {
                error!("Skipping undecodable message {} from {}: {}", row.name, row.from, e);
                continue;
            }
            out.push(ResponseMessage {
                to: row.first_recipient().unwrap_or(&from.fingerprint).to_string(),
                name: row.name,
                from: row.from,
                timestamp: row.timestamp,
                data: row.data,
            });
        }
        Ok(out)
    }

    pub fn set_data(&self, from: &Address, key: &str, data: &[u8]) -> Result<()> {
        self.registered_user(from)?;
        self.store.set_data(&from.fingerprint, key, data)?;
        Ok(())
    }

    pub fn get_data(&self, from: &Address, key: &str) -> Result<Vec<u8>> {
        self.registered_user(from)?;
        self.store
            .get_data(&from.fingerprint, key)?
            .ok_or_else(|| Error::NotFound(format!("data {key:?}")))
    }

    /// Fetch one message for `requester`; `None` when it can't be served
    pub fn retrieve_message_for_user(
        &self,
        name: &str,
        author: &str,
        requester: &Address,
    ) -> Option<RetrievedMail> {
        let result = if name == PROFILE_MESSAGE {
            self.render_profile(author, requester).map(RetrievedMail::Rendered)
        } else {
            self.stored_message(name, author).map(RetrievedMail::Stored)
        };

        result
            .inspect_err(|e| error!("Failed to retrieve {} from {}: {}", name, author, e))
            .ok()
    }

    fn render_profile(&self, author: &str, requester: &Address) -> Result<Mail> {
        let identities = self.store.identities_for_fingerprint(author)?;
        if identities.len() != 1 {
            return Err(Error::Ambiguous {
                what: format!("identity for {author}"),
                count: identities.len(),
            });
        }
        let identity = &identities[0];
        let user = self
            .store
            .get_user(identity.owner)?
            .ok_or_else(|| Error::NotFound(format!("user {}", identity.owner)))?;

        // The server signs the rendering, so it is also the author
        Ok(Mail::builder(self.key.address.clone())
            .recipient(requester.clone())
            .component(components::PROFILE_NAME, user.name)
            .component(components::PROFILE_AVATAR, user.avatar)
            .build())
    }

    fn stored_message(&self, name: &str, author: &str) -> Result<Vec<u8>> {
        let mut rows = self.store.messages_with_name(name, author)?;
        match rows.len() {
            1 => Ok(rows.remove(0).data),
            0 => Err(Error::NotFound(format!("message {name:?}"))),
            count => Err(Error::Ambiguous {
                what: format!("message {name:?}"),
                count,
            }),
        }
    }

    /// Descriptors for `author`'s broadcast messages newer than `since`,
    /// all pointing at this server
    pub fn retrieve_message_list_for_user(
        &self,
        since: u64,
        author: &str,
        requester: &Address,
    ) -> Option<MessageList> {
        let rows = match self.store.public_messages_from_since(author, since as i64) {
            Ok(rows) => rows,
            Err(e) => {
                error!("Failed to load messages from {}: {}", author, e);
                return None;
            }
        };

        let mut list = MessageList::new(author, requester.fingerprint.clone());
        list.content = rows
            .iter()
            .map(|row| row.to_description(&self.location, &requester.fingerprint))
            .collect();
        Some(list)
    }

    /// Persist an alert delivered by another server
    ///
    /// The alert's sender is the verified `from`, whatever the description
    /// claims.
    pub fn save_message_description(&self, from: &Address, desc: &MessageDescription) -> Result<()> {
        let Some(user) = self.store.user_for_fingerprint(&desc.to)? else {
            return Err(Error::NotRegistered(desc.to.clone()));
        };
        if !user.receiving {
            warn!("Dropping alert for {}: not receiving", desc.to);
            return Ok(());
        }
        if desc.from != from.fingerprint {
            warn!(
                "Alert claims sender {} but was signed by {}",
                desc.from, from.fingerprint
            );
        }

        self.store
            .insert_alert(Alert::from_description(desc, &from.fingerprint))?;
        debug!("Saved alert {} for {}", desc.name, desc.to);
        Ok(())
    }

    /// The server's own signing identity
    pub fn key(&self) -> &Identity {
        &self.key
    }
}

impl Delegate for MailServer {
    fn register(&self, from: &Address, keys: Vec<Data>) -> Result<()> {
        MailServer::register(self, from, &keys)
    }

    fn unregister(&self, from: &Address, _keys: Vec<Data>) -> Result<()> {
        MailServer::unregister(self, from)
    }

    fn publish_message(&self, from: &Address, message: PublishMessage) -> Result<()> {
        MailServer::publish_message(
            self,
            from,
            &message.name,
            message.to,
            message.data,
            message.alert,
        )
    }

    fn update_message(&self, from: &Address, message: UpdateMessage) -> Result<()> {
        MailServer::update_message(self, from, &message.name, message.data)
    }

    fn get_messages(&self, from: &Address, since: u64, context: bool) -> Result<Vec<ResponseMessage>> {
        MailServer::get_messages(self, from, since, context)
    }

    fn set_data(&self, from: &Address, data: Data) -> Result<()> {
        MailServer::set_data(self, from, &data.key, &data.data)
    }

    fn get_data(&self, from: &Address, key: &str) -> Result<Vec<u8>> {
        MailServer::get_data(self, from, key)
    }

    fn retrieve_message_for_user(
        &self,
        name: &str,
        author: &str,
        from: &Address,
    ) -> Option<RetrievedMail> {
        MailServer::retrieve_message_for_user(self, name, author, from)
    }

    fn retrieve_message_list_for_user(
        &self,
        since: u64,
        author: &str,
        from: &Address,
    ) -> Option<MessageList> {
        MailServer::retrieve_message_list_for_user(self, since, author, from)
    }

    fn save_message_description(&self, from: &Address, desc: MessageDescription) -> Result<()> {
        MailServer::save_message_description(self, from, &desc)
    }
}
