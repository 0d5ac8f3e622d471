use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::MessageDescription;

/// Notice that a private message for `to` is waiting at `location`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    /// Recipient fingerprint
    pub to: String,
    /// Author fingerprint
    pub from: String,
    pub name: String,
    pub location: String,
    pub timestamp: i64,
}

impl Alert {
    /// Record a delivered description, stamped with the arrival time
    ///
    /// `from` is the verified sender of the description, not the value it
    /// claims.
    pub fn from_description(desc: &MessageDescription, from: &str) -> Self {
        Self {
            id: 0,
            to: desc.to.clone(),
            from: from.to_string(),
            name: desc.name.clone(),
            location: desc.location.clone(),
            timestamp: Utc::now().timestamp(),
        }
    }
}
