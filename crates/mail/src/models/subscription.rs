use serde::{Deserialize, Serialize};

/// A user's standing request for another address's public feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub user_id: i64,
    /// Alias or fingerprint, resolved at sync time
    pub address: String,
}

impl Subscription {
    pub fn new(user_id: i64, address: impl Into<String>) -> Self {
        Self {
            id: 0,
            user_id,
            address: address.into(),
        }
    }
}
