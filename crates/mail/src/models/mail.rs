//! Mail, the unit users publish and fetch

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::{EncryptedMessage, Header, SignedMessage};
use crate::error::{Error, Result};
use crate::identity::{Address, Identity};
use crate::wire::{self, WireType};

/// Well-known component names
pub mod components {
    pub const PROFILE_NAME: &str = "airdispat.ch/profile/name";
    pub const PROFILE_AVATAR: &str = "airdispat.ch/profile/avatar";
    pub const BODY: &str = "airdispat.ch/notes/body";
}

/// An opaque named blob inside a mail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    pub data: Vec<u8>,
}

impl Component {
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

/// A message as authored: routing plus an ordered list of components
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mail {
    pub author: Address,
    /// `None` for broadcast mail
    pub recipient: Option<Address>,
    pub created_at: DateTime<Utc>,
    pub components: Vec<Component>,
}

impl Mail {
    pub fn builder(author: Address) -> MailBuilder {
        MailBuilder::new(author)
    }

    pub fn add_component(&mut self, name: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.components.push(Component::new(name, data));
    }

    /// Data of the first component with this name
    pub fn component(&self, name: &str) -> Option<&[u8]> {
        self.components
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.data.as_slice())
    }

    pub fn is_public(&self) -> bool {
        self.recipient.is_none()
    }

    /// Sign with `key`; encrypt for `to` when given, otherwise leave in the clear
    ///
    /// The header is untimed so identical mail yields identical bytes when
    /// unencrypted.
    pub fn to_envelope(&self, key: &Identity, to: Option<&Address>) -> Result<EncryptedMessage> {
        let public = Address::public();
        let header = Header::untimed(&key.address, to.unwrap_or(&public));
        let signed = SignedMessage::sign(header, WireType::Mail, wire::encode(self)?, key)?;
        match to {
            Some(to) => signed.encrypt_for(to),
            None => signed.unencrypted(),
        }
    }

    /// Open an envelope produced by [`Mail::to_envelope`]
    ///
    /// The mail's author must be the verified signer.
    pub fn from_envelope(bytes: &[u8], key: &Identity) -> Result<Self> {
        let signed = EncryptedMessage::from_bytes(bytes)?.open(key)?;
        let mail: Mail = signed.decode(WireType::Mail)?;
        if mail.author != signed.header.from {
            return Err(Error::Verification(format!(
                "mail claims author {} but was signed by {}",
                mail.author, signed.header.from
            )));
        }
        Ok(mail)
    }
}

/// Builder for creating Mail instances
pub struct MailBuilder {
    author: Address,
    recipient: Option<Address>,
    created_at: Option<DateTime<Utc>>,
    components: Vec<Component>,
}

impl MailBuilder {
    fn new(author: Address) -> Self {
        Self {
            author,
            recipient: None,
            created_at: None,
            components: Vec::new(),
        }
    }

    pub fn recipient(mut self, recipient: Address) -> Self {
        self.recipient = Some(recipient);
        self
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn component(mut self, name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.components.push(Component::new(name, data));
        self
    }

    pub fn build(self) -> Mail {
        Mail {
            author: self.author,
            recipient: self.recipient,
            created_at: self.created_at.unwrap_or_else(Utc::now),
            components: self.components,
        }
    }
}

/// Pointer to a message stored on a specific server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDescription {
    pub name: String,
    pub location: String,
    pub from: String,
    pub to: String,
    pub timestamp: i64,
}

/// Answer to "what has this author published since the cursor"
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageList {
    pub author: String,
    pub to: String,
    pub content: Vec<MessageDescription>,
}

impl MessageList {
    pub fn new(author: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            to: to.into(),
            content: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}
