//! Persisted message rows

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::{Mail, MessageDescription};
use crate::error::Result;
use crate::identity::{Address, Identity};

/// How a stored message was published
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Broadcast or listed publicly; no alert sent
    OutgoingPublic,
    /// Published with an alert to its recipients
    OutgoingPrivate,
    /// Author-readable copy of mail the store's owner sent; never served
    Sent,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::OutgoingPublic => "outgoing-public",
            MessageKind::OutgoingPrivate => "outgoing-private",
            MessageKind::Sent => "sent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "outgoing-public" => Some(MessageKind::OutgoingPublic),
            "outgoing-private" => Some(MessageKind::OutgoingPrivate),
            "sent" => Some(MessageKind::Sent),
            _ => None,
        }
    }
}

/// A message row: the published envelope plus the routing needed to query it
///
/// `data` is the envelope exactly as published (signed, and encrypted for
/// the first recipient when there is one). `version` increments on every
/// overwrite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub name: String,
    /// Author fingerprint
    pub from: String,
    /// Recipient fingerprints; empty for broadcast
    pub to: Vec<String>,
    pub kind: MessageKind,
    /// Unix seconds when the message was stored
    pub timestamp: i64,
    pub data: Vec<u8>,
    pub version: i64,
}

impl StoredMessage {
    /// New unsaved row stamped with the current time
    pub fn new(
        name: impl Into<String>,
        from: impl Into<String>,
        to: Vec<String>,
        kind: MessageKind,
        data: Vec<u8>,
    ) -> Self {
        Self {
            id: 0,
            name: name.into(),
            from: from.into(),
            to,
            kind,
            timestamp: Utc::now().timestamp(),
            data,
            version: 0,
        }
    }

    /// [`MessageKind::Sent`] row recording mail the local identity sent
    ///
    /// The envelope is signed but unencrypted so the author can read it
    /// back.
    pub fn outgoing(name: impl Into<String>, key: &Identity, mail: &Mail) -> Result<Self> {
        let to = mail
            .recipient
            .iter()
            .map(|r| r.fingerprint.clone())
            .collect::<Vec<_>>();
        let data = mail.to_envelope(key, None)?.to_bytes()?;
        let mut row = Self::new(name, key.fingerprint(), to, MessageKind::Sent, data);
        row.timestamp = mail.created_at.timestamp();
        Ok(row)
    }

    /// Whether the server hands this row to other parties
    pub fn is_served(&self) -> bool {
        self.kind != MessageKind::Sent
    }

    pub fn is_broadcast(&self) -> bool {
        self.to.is_empty()
    }

    pub fn first_recipient(&self) -> Option<&str> {
        self.to.first().map(String::as_str)
    }

    /// Open the stored envelope and address the result to `to`
    pub fn to_mail(&self, key: &Identity, to: Option<Address>) -> Result<Mail> {
        let mut mail = Mail::from_envelope(&self.data, key)?;
        if to.is_some() {
            mail.recipient = to;
        }
        Ok(mail)
    }

    /// Descriptor pointing at this message on the server at `location`
    pub fn to_description(&self, location: &str, to: &str) -> MessageDescription {
        MessageDescription {
            name: self.name.clone(),
            location: location.to_string(),
            from: self.from.clone(),
            to: to.to_string(),
            timestamp: self.timestamp,
        }
    }
}
