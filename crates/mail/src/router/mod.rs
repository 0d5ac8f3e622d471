//! Address resolution
//!
//! A [`Router`] turns an alias (`name@domain`) or a bare fingerprint into a
//! routable [`Address`]. Three strategies are provided:
//!
//! - [`LookupRouter`]: derives the directory server from the alias domain
//!   and forwards the lookup there. Read-only.
//! - [`TrackerRouter`]: talks to one fixed directory server; used for
//!   registering this server's identities.
//! - [`LocalRouter`]: an in-process alias table.
//!
//! Resolution failures are returned to the caller; nothing here retries.

mod local;
mod lookup;
mod tracker;

use std::sync::{Arc, OnceLock};

use crate::error::{Error, Result};
use crate::identity::{Address, Identity};

pub use local::LocalRouter;
pub use lookup::LookupRouter;
pub use tracker::{Tracker, TrackerRouter};

/// Port directory servers listen on
pub const TRACKER_PORT: u16 = 1024;

/// Well-known directory used for registration
pub const DEFAULT_TRACKER: &str = "airdispat.ch";

/// Alias and address resolution capability
pub trait Router: Send + Sync {
    /// Resolve `name@domain` (or, where supported, a fingerprint)
    fn lookup_alias(&self, alias: &str) -> Result<Address>;

    /// Resolve a bare fingerprint
    fn lookup(&self, address: &str) -> Result<Address>;

    /// Publish `key`'s address under `alias`
    fn register(&self, key: &Identity, alias: &str) -> Result<()>;
}

/// Split `name@domain`, requiring exactly one `@` with both sides non-empty
pub fn split_alias(alias: &str) -> Result<(&str, &str)> {
    let mut parts = alias.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(name), Some(domain), None) if !name.is_empty() && !domain.is_empty() => {
            Ok((name, domain))
        }
        _ => Err(Error::MalformedAlias(alias.to_string())),
    }
}

/// Directory server location for a domain
///
/// A domain that already names a port is used as is.
pub fn tracker_location(domain: &str) -> String {
    if domain.contains(':') {
        domain.to_string()
    } else {
        format!("{domain}:{TRACKER_PORT}")
    }
}

/// The process-wide resolution handles and the key they act with
pub struct Routers {
    pub server_key: Arc<Identity>,
    /// Registers this server's identities with the bootstrap directory
    pub registration: Arc<dyn Router>,
    /// Resolves arbitrary aliases by domain
    pub lookup: Arc<dyn Router>,
}

impl Routers {
    pub fn new(server_key: Arc<Identity>, tracker: &str) -> Self {
        Self {
            registration: Arc::new(TrackerRouter::new(
                server_key.clone(),
                tracker_location(tracker),
            )),
            lookup: Arc::new(LookupRouter::new(server_key.clone())),
            server_key,
        }
    }
}

static ROUTERS: OnceLock<Routers> = OnceLock::new();

/// Install the process-wide routers on first call
///
/// Later calls return the existing bundle unchanged; `key` and `tracker`
/// are then ignored. Without a key a fresh identity is created.
pub fn init_routers(key: Option<Identity>, tracker: &str) -> &'static Routers {
    ROUTERS.get_or_init(|| {
        let key = Arc::new(key.unwrap_or_else(Identity::create));
        Routers::new(key, tracker)
    })
}

/// The routers installed by [`init_routers`], if any
pub fn routers() -> Option<&'static Routers> {
    ROUTERS.get()
}
