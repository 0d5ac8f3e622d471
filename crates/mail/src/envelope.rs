//! Signed and encrypted envelopes
//!
//! Every wire message is signed by its sender. Messages addressed to a
//! party whose encryption key is known are additionally sealed:
//!
//! 1. ephemeral X25519 agreement with the recipient's exchange key
//! 2. HKDF-SHA256 over the shared secret, salted with both public keys
//! 3. XChaCha20-Poly1305 over the encoded signed message
//!
//! Messages without a recipient key (broadcast mail, requests to servers
//! whose key is unknown) travel signed but in the clear.

use chacha20poly1305::{
    Key, XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use chrono::Utc;
use ed25519_dalek::{Signature, VerifyingKey};
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::error::{Error, Result};
use crate::identity::{Address, Identity, fingerprint_of};
use crate::wire::{self, WireType};

/// HKDF info string binding derived keys to this envelope format
const ENVELOPE_CONTEXT: &[u8] = b"melange-envelope-v1";

/// XChaCha20 nonce size
pub const NONCE_SIZE: usize = 24;

/// Routing header, built fresh for every outgoing message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub from: Address,
    pub to: Address,
    /// Key the receiver should encrypt its reply with
    pub encryption_key: Option<[u8; 32]>,
    /// Unix seconds; zero for content-addressed mail
    pub timestamp: i64,
}

impl Header {
    /// Header for a request or reply, stamped with the current time
    pub fn new(from: &Address, to: &Address) -> Self {
        Self {
            from: from.clone(),
            to: to.clone(),
            encryption_key: None,
            timestamp: Utc::now().timestamp(),
        }
    }

    /// Header without a timestamp, so identical content signs identically
    pub fn untimed(from: &Address, to: &Address) -> Self {
        Self {
            timestamp: 0,
            ..Self::new(from, to)
        }
    }

    pub fn with_encryption_key(mut self, key: [u8; 32]) -> Self {
        self.encryption_key = Some(key);
        self
    }
}

/// A message together with its sender's signature
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedMessage {
    pub header: Header,
    pub kind: WireType,
    pub payload: Vec<u8>,
    pub signer: [u8; 32],
    pub signature: Vec<u8>,
}

impl SignedMessage {
    /// Sign an encoded payload with `key`
    pub fn sign(header: Header, kind: WireType, payload: Vec<u8>, key: &Identity) -> Result<Self> {
        let bytes = signing_bytes(&header, kind, &payload)?;
        let signature = key.sign(&bytes).to_vec();
        Ok(Self {
            header,
            kind,
            payload,
            signer: key.verifying_key().to_bytes(),
            signature,
        })
    }

    /// Check the signature and that the signer owns `header.from`
    pub fn verify(&self) -> Result<()> {
        if fingerprint_of(&self.signer) != self.header.from.fingerprint {
            return Err(Error::Verification(format!(
                "signer does not match sender {}",
                self.header.from
            )));
        }

        let key = VerifyingKey::from_bytes(&self.signer)
            .map_err(|e| Error::Verification(format!("invalid signing key: {e}")))?;
        let signature = Signature::from_slice(&self.signature)
            .map_err(|e| Error::Verification(format!("invalid signature: {e}")))?;
        let bytes = signing_bytes(&self.header, self.kind, &self.payload)?;

        key.verify_strict(&bytes, &signature)
            .map_err(|_| Error::Verification("signature mismatch".to_string()))
    }

    /// Decode the payload, requiring the given wire type
    pub fn decode<T: DeserializeOwned>(&self, expected: WireType) -> Result<T> {
        if self.kind != expected {
            return Err(Error::UnexpectedType {
                expected,
                found: self.kind,
            });
        }
        wire::decode(&self.payload)
    }

    /// Wrap without encryption (broadcast payloads)
    pub fn unencrypted(self) -> Result<EncryptedMessage> {
        Ok(EncryptedMessage {
            to: self.header.to.fingerprint.clone(),
            sealed: None,
            data: wire::encode(&self)?,
        })
    }

    /// Encrypt for a single recipient
    pub fn encrypt_for(self, to: &Address) -> Result<EncryptedMessage> {
        let recipient = to
            .encryption_key
            .ok_or_else(|| Error::MissingEncryptionKey(to.to_string()))?;

        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral).to_bytes();
        let shared = ephemeral.diffie_hellman(&PublicKey::from(recipient));
        let cipher = derive_cipher(shared.as_bytes(), &ephemeral_public, &recipient)?;

        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let plaintext = wire::encode(&self)?;
        let data = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| Error::Malformed("encryption failed".to_string()))?;

        Ok(EncryptedMessage {
            to: to.fingerprint.clone(),
            sealed: Some(Sealed {
                ephemeral: ephemeral_public,
                nonce,
            }),
            data,
        })
    }

    /// Encrypt when the recipient's key is known, otherwise send in the clear
    pub fn seal(self, to: Option<&Address>) -> Result<EncryptedMessage> {
        match to {
            Some(to) if to.encryption_key.is_some() => self.encrypt_for(to),
            _ => self.unencrypted(),
        }
    }
}

/// Parameters needed to open an encrypted envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sealed {
    pub ephemeral: [u8; 32],
    pub nonce: [u8; NONCE_SIZE],
}

/// Outer container written to the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedMessage {
    /// Fingerprint of the intended reader
    pub to: String,
    pub sealed: Option<Sealed>,
    pub data: Vec<u8>,
}

impl EncryptedMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        wire::encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        wire::decode(bytes)
    }

    pub fn is_encrypted(&self) -> bool {
        self.sealed.is_some()
    }

    /// Recover the signed message; does not verify it
    pub fn decrypt(&self, key: &Identity) -> Result<SignedMessage> {
        let Some(sealed) = &self.sealed else {
            return wire::decode(&self.data);
        };

        if self.to != key.fingerprint() {
            return Err(Error::Verification(format!(
                "message sealed for {}, not {}",
                self.to,
                key.fingerprint()
            )));
        }

        let shared = key.diffie_hellman(&sealed.ephemeral);
        let cipher = derive_cipher(&shared, &sealed.ephemeral, &key.encryption_key())?;
        let plaintext = cipher
            .decrypt(XNonce::from_slice(&sealed.nonce), self.data.as_slice())
            .map_err(|_| Error::Verification("decryption failed".to_string()))?;

        wire::decode(&plaintext).map_err(|e| Error::Verification(e.to_string()))
    }

    /// Decrypt and verify in one step
    pub fn open(&self, key: &Identity) -> Result<SignedMessage> {
        let signed = self.decrypt(key)?;
        signed.verify()?;
        Ok(signed)
    }
}

fn signing_bytes(header: &Header, kind: WireType, payload: &[u8]) -> Result<Vec<u8>> {
    wire::encode(&(header, kind, payload))
}

fn derive_cipher(
    shared: &[u8; 32],
    ephemeral: &[u8; 32],
    recipient: &[u8; 32],
) -> Result<XChaCha20Poly1305> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral);
    salt[32..].copy_from_slice(recipient);

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut okm = [0u8; 32];
    hkdf.expand(ENVELOPE_CONTEXT, &mut okm)
        .map_err(|_| Error::Malformed("key derivation failed".to_string()))?;

    Ok(XChaCha20Poly1305::new(Key::from_slice(&okm)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::GetData;

    fn signed_request(from: &Identity, to: &Identity) -> SignedMessage {
        let payload = wire::encode(&GetData {
            key: "settings".to_string(),
        })
        .unwrap();
        let header = Header::new(&from.address, &to.address)
            .with_encryption_key(from.encryption_key());
        SignedMessage::sign(header, WireType::GetData, payload, from).unwrap()
    }

    #[test]
    fn test_sign_and_verify() {
        let alice = Identity::create();
        let bob = Identity::create();
        let signed = signed_request(&alice, &bob);
        signed.verify().unwrap();

        let decoded: GetData = signed.decode(WireType::GetData).unwrap();
        assert_eq!(decoded.key, "settings");
    }

    #[test]
    fn test_tampered_payload_fails_verification() {
        let alice = Identity::create();
        let bob = Identity::create();
        let mut signed = signed_request(&alice, &bob);
        signed.payload.push(0);

        let err = signed.verify().unwrap_err();
        assert!(matches!(err, Error::Verification(_)));
    }

    #[test]
    fn test_forged_sender_fails_verification() {
        let alice = Identity::create();
        let mallory = Identity::create();
        let bob = Identity::create();

        // Mallory signs a header claiming to come from Alice
        let header = Header::new(&alice.address, &bob.address);
        let signed = SignedMessage::sign(header, WireType::GetData, vec![], &mallory).unwrap();
        assert!(matches!(signed.verify(), Err(Error::Verification(_))));
    }

    #[test]
    fn test_encrypt_round_trip() {
        let alice = Identity::create();
        let bob = Identity::create();
        let signed = signed_request(&alice, &bob);

        let sealed = signed.encrypt_for(&bob.address).unwrap();
        assert!(sealed.is_encrypted());

        let bytes = sealed.to_bytes().unwrap();
        let opened = EncryptedMessage::from_bytes(&bytes).unwrap().open(&bob).unwrap();
        assert_eq!(opened.header.from, alice.address);
        assert_eq!(opened.kind, WireType::GetData);
    }

    #[test]
    fn test_wrong_recipient_cannot_decrypt() {
        let alice = Identity::create();
        let bob = Identity::create();
        let eve = Identity::create();

        let sealed = signed_request(&alice, &bob).encrypt_for(&bob.address).unwrap();
        assert!(matches!(sealed.open(&eve), Err(Error::Verification(_))));
    }

    #[test]
    fn test_seal_without_key_is_unencrypted() {
        let alice = Identity::create();
        let bob = Identity::create();
        let bare = Address::from_fingerprint(bob.fingerprint());

        let sealed = signed_request(&alice, &bob).seal(Some(&bare)).unwrap();
        assert!(!sealed.is_encrypted());
        sealed.open(&bob).unwrap();
    }

    #[test]
    fn test_unencrypted_signing_is_deterministic() {
        let alice = Identity::create();
        let header = Header::untimed(&alice.address, &Address::public());
        let first = SignedMessage::sign(header.clone(), WireType::Mail, vec![1, 2, 3], &alice)
            .unwrap()
            .unencrypted()
            .unwrap()
            .to_bytes()
            .unwrap();
        let second = SignedMessage::sign(header, WireType::Mail, vec![1, 2, 3], &alice)
            .unwrap()
            .unencrypted()
            .unwrap()
            .to_bytes()
            .unwrap();
        assert_eq!(first, second);
    }
}
