//! Registered users and the signing identities linked to them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::Address;

/// A mailbox owner on this server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    /// Display name served in the profile message
    pub name: String,
    /// Avatar URL served in the profile message
    pub avatar: String,
    /// Whether the server accepts alerts for this user
    pub receiving: bool,
    pub registered_on: DateTime<Utc>,
}

impl User {
    pub fn new(name: impl Into<String>, avatar: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            avatar: avatar.into(),
            receiving: true,
            registered_on: Utc::now(),
        }
    }
}

/// Link from a signing address to the user that owns it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: i64,
    /// Owning [`User::id`]
    pub owner: i64,
    pub fingerprint: String,
    pub address: Address,
}

impl IdentityRecord {
    pub fn new(owner: i64, address: Address) -> Self {
        Self {
            id: 0,
            owner,
            fingerprint: address.fingerprint.clone(),
            address,
        }
    }
}
