use std::sync::Arc;

use super::{Router, TrackerRouter, split_alias, tracker_location};
use crate::error::{Error, Result};
use crate::identity::{Address, Identity};

type Locator = dyn Fn(&str) -> String + Send + Sync;

/// Resolves `name@domain` by asking the directory server for `domain`
///
/// Read-only: bare fingerprints and registration are rejected.
pub struct LookupRouter {
    origin: Arc<Identity>,
    locator: Box<Locator>,
}

impl LookupRouter {
    /// Directory servers are found at [`tracker_location`] of the domain
    pub fn new(origin: Arc<Identity>) -> Self {
        Self::with_locator(origin, tracker_location)
    }

    /// Use a custom domain-to-directory mapping
    pub fn with_locator(
        origin: Arc<Identity>,
        locator: impl Fn(&str) -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            origin,
            locator: Box::new(locator),
        }
    }
}

impl Router for LookupRouter {
    fn lookup_alias(&self, alias: &str) -> Result<Address> {
        let (_, domain) = split_alias(alias)?;
        let location = (self.locator)(domain);
        TrackerRouter::new(self.origin.clone(), location).lookup_alias(alias)
    }

    fn lookup(&self, _address: &str) -> Result<Address> {
        Err(Error::UnsupportedOperation("lookup of non-aliased names"))
    }

    fn register(&self, _key: &Identity, _alias: &str) -> Result<()> {
        Err(Error::UnsupportedOperation("registration through the lookup router"))
    }
}
