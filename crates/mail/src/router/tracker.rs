//! Directory service client and server

use log::{debug, info};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::Router;
use crate::envelope::Header;
use crate::error::{Error, Result};
use crate::identity::{Address, Identity};
use crate::server::Delegate;
use crate::transport::{self, RawMessage};
use crate::wire::{AliasLookup, AliasRegister, Response, WireType, codes};

/// Client for one directory server
pub struct TrackerRouter {
    origin: Arc<Identity>,
    location: String,
}

impl TrackerRouter {
    /// `origin` signs every request; `location` is the directory's `host:port`
    pub fn new(origin: Arc<Identity>, location: impl Into<String>) -> Self {
        Self {
            origin,
            location: location.into(),
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    fn header(&self, from: &Identity) -> Header {
        let to = Address::public().with_location(self.location.clone());
        Header::new(&from.address, &to).with_encryption_key(from.encryption_key())
    }

    fn query(&self, key: &str) -> Result<Address> {
        let request = RawMessage::new(
            self.header(&self.origin),
            WireType::AliasLookup,
            &AliasLookup {
                alias: key.to_string(),
            },
        )?;
        let reply = transport::send_and_receive(request, &self.origin, &self.location, None)?;

        let address: Address = match transport::decode_reply(&reply, WireType::AliasResponse) {
            Ok(address) => address,
            Err(Error::Remote { code, .. }) if code == codes::NOT_FOUND => {
                return Err(Error::AliasNotFound(key.to_string()));
            }
            Err(e) => return Err(e),
        };

        if !address.has_location() {
            return Err(Error::MissingLocation(address.fingerprint));
        }
        debug!("Resolved {} to {} at {}", key, address, address.location);
        Ok(address)
    }
}

impl Router for TrackerRouter {
    fn lookup_alias(&self, alias: &str) -> Result<Address> {
        self.query(alias)
    }

    fn lookup(&self, address: &str) -> Result<Address> {
        self.query(address)
    }

    fn register(&self, key: &Identity, alias: &str) -> Result<()> {
        if !key.address.has_location() {
            return Err(Error::MissingLocation(key.fingerprint().to_string()));
        }

        let request = RawMessage::new(
            self.header(key),
            WireType::AliasRegister,
            &AliasRegister {
                alias: alias.to_string(),
                address: key.address.clone(),
            },
        )?;
        let reply = transport::send_and_receive(request, key, &self.location, None)?;
        transport::decode_reply::<Response>(&reply, WireType::Response)?;

        info!("Registered {} as {} with {}", key.fingerprint(), alias, self.location);
        Ok(())
    }
}

/// In-memory directory served over the protocol
///
/// Entries are keyed by both alias and fingerprint. Only the owner of an
/// address may register it.
#[derive(Default)]
pub struct Tracker {
    entries: RwLock<HashMap<String, Address>>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct keys (aliases plus fingerprints)
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Delegate for Tracker {
    fn lookup_alias(&self, _from: &Address, alias: &str) -> Result<Address> {
        self.entries
            .read()
            .unwrap()
            .get(alias)
            .cloned()
            .ok_or_else(|| Error::AliasNotFound(alias.to_string()))
    }

    fn register_alias(&self, from: &Address, alias: &str, address: Address) -> Result<()> {
        if *from != address {
            return Err(Error::Verification(format!(
                "{from} cannot register an alias for {address}"
            )));
        }
        if !address.has_location() {
            return Err(Error::MissingLocation(address.fingerprint));
        }
        super::split_alias(alias)?;

        let mut entries = self.entries.write().unwrap();
        if let Some(existing) = entries.get(alias) {
            if *existing != address {
                return Err(Error::Conflict(alias.to_string()));
            }
        }

        debug!("Tracking {} -> {} at {}", alias, address, address.location);
        entries.insert(address.fingerprint.clone(), address.clone());
        entries.insert(alias.to_string(), address);
        Ok(())
    }
}
