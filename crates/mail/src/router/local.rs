use std::collections::HashMap;
use std::sync::RwLock;

use super::Router;
use crate::error::{Error, Result};
use crate::identity::{Address, Identity};

/// Alias table held in memory
///
/// Resolves both aliases and fingerprints; useful for single-process
/// deployments and tests.
#[derive(Default)]
pub struct LocalRouter {
    entries: RwLock<HashMap<String, Address>>,
}

impl LocalRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `alias` (and the address's fingerprint) to `address`
    pub fn insert(&self, alias: impl Into<String>, address: Address) {
        let mut entries = self.entries.write().unwrap();
        entries.insert(address.fingerprint.clone(), address.clone());
        entries.insert(alias.into(), address);
    }

    fn get(&self, key: &str) -> Result<Address> {
        self.entries
            .read()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::AliasNotFound(key.to_string()))
    }
}

impl Router for LocalRouter {
    fn lookup_alias(&self, alias: &str) -> Result<Address> {
        self.get(alias)
    }

    fn lookup(&self, address: &str) -> Result<Address> {
        self.get(address)
    }

    fn register(&self, key: &Identity, alias: &str) -> Result<()> {
        if !key.address.has_location() {
            return Err(Error::MissingLocation(key.fingerprint().to_string()));
        }
        self.insert(alias, key.address.clone());
        Ok(())
    }
}
