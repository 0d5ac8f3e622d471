//! Keypairs and routable addresses
//!
//! An [`Identity`] pairs an Ed25519 signing key with an X25519 exchange key.
//! Its [`Address`] is the public half: a fingerprint derived from the
//! verifying key, the network location of the server holding the mailbox,
//! and the public keys peers need to verify and encrypt.

use anyhow::{Context, Result};
use base64::{Engine as _, engine::general_purpose};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use log::info;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;
use x25519_dalek::{PublicKey, StaticSecret};

/// Number of SHA-256 bytes kept in a fingerprint
pub const FINGERPRINT_LEN: usize = 20;

/// Derive the fingerprint for a verifying key
pub fn fingerprint_of(key: &[u8; 32]) -> String {
    let digest = Sha256::digest(key);
    hex::encode(&digest[..FINGERPRINT_LEN])
}

/// Public, routable half of an identity
///
/// `location` may be empty until a directory resolves it. Two addresses are
/// equal when their fingerprints are equal; location and keys are routing
/// metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Address {
    /// Hex-encoded fingerprint of the signing key (empty for broadcast)
    pub fingerprint: String,
    /// `host:port` of the server holding this mailbox
    pub location: String,
    /// Ed25519 verifying key
    pub signing_key: Option<[u8; 32]>,
    /// X25519 public key used to encrypt to this address
    pub encryption_key: Option<[u8; 32]>,
}

impl Address {
    /// Address known only by fingerprint
    pub fn from_fingerprint(fingerprint: impl Into<String>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            ..Default::default()
        }
    }

    /// The broadcast address used by unencrypted public messages
    pub fn public() -> Self {
        Self::default()
    }

    pub fn is_public(&self) -> bool {
        self.fingerprint.is_empty()
    }

    /// Copy of this address routed to a different server
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    pub fn has_location(&self) -> bool {
        !self.location.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.fingerprint
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fingerprint.hash(state);
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fingerprint)
    }
}

/// A local keypair and its derived address
///
/// Immutable after creation apart from the advertised location.
pub struct Identity {
    signing: SigningKey,
    exchange: StaticSecret,
    pub address: Address,
}

/// On-disk key file format
#[derive(Serialize, Deserialize)]
struct KeyFile {
    signing_key: String,
    exchange_key: String,
    #[serde(default)]
    location: String,
}

impl Identity {
    /// Generate a fresh identity
    pub fn create() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let exchange = StaticSecret::random_from_rng(OsRng);
        Self::from_keys(signing, exchange, String::new())
    }

    fn from_keys(signing: SigningKey, exchange: StaticSecret, location: String) -> Self {
        let verifying = signing.verifying_key().to_bytes();
        let encryption = PublicKey::from(&exchange).to_bytes();
        let address = Address {
            fingerprint: fingerprint_of(&verifying),
            location,
            signing_key: Some(verifying),
            encryption_key: Some(encryption),
        };
        Self {
            signing,
            exchange,
            address,
        }
    }

    /// Set the location advertised in this identity's address
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.address.location = location.into();
        self
    }

    pub fn fingerprint(&self) -> &str {
        &self.address.fingerprint
    }

    /// Public X25519 key peers use to encrypt replies to us
    pub fn encryption_key(&self) -> [u8; 32] {
        PublicKey::from(&self.exchange).to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Ed25519 signature over `data`
    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        self.signing.sign(data).to_bytes()
    }

    /// X25519 agreement between our exchange key and a peer public key
    pub(crate) fn diffie_hellman(&self, public: &[u8; 32]) -> [u8; 32] {
        self.exchange
            .diffie_hellman(&PublicKey::from(*public))
            .to_bytes()
    }

    /// Persist key material as JSON with base64 keys
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let file = KeyFile {
            signing_key: general_purpose::STANDARD.encode(self.signing.to_bytes()),
            exchange_key: general_purpose::STANDARD.encode(self.exchange.to_bytes()),
            location: self.address.location.clone(),
        };
        config::save_json_file(path, &file)
    }

    /// Load key material written by [`Identity::save_to_file`]
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let file: KeyFile = config::load_json_file(path)?;
        let signing = decode_key(&file.signing_key).context("Invalid signing key")?;
        let exchange = decode_key(&file.exchange_key).context("Invalid exchange key")?;
        Ok(Self::from_keys(
            SigningKey::from_bytes(&signing),
            StaticSecret::from(exchange),
            file.location,
        ))
    }

    /// Load the key at `path`, or create one (saving it when a path is given)
    pub fn load_or_create(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path.filter(|p| p.exists()) {
            return Self::load_from_file(path);
        }

        let identity = Self::create();
        if let Some(path) = path {
            identity
                .save_to_file(path)
                .with_context(|| format!("Failed to save key to {}", path.display()))?;
            info!("Created new key at {}", path.display());
        }
        Ok(identity)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

fn decode_key(encoded: &str) -> Result<[u8; 32]> {
    let bytes = general_purpose::STANDARD.decode(encoded)?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| anyhow::anyhow!("expected 32 key bytes, got {}", b.len()))
}
