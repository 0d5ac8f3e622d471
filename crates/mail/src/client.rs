//! Protocol client bound to one identity and one mail server
//!
//! Every request is a single signed envelope on a fresh connection, with
//! a header advertising the local encryption key so the server can seal
//! its reply. [`Client::download_messages`] is the one streamed exchange:
//! a `Response` announcing `N`, followed by exactly `N` response messages
//! on the same connection.

use log::debug;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::envelope::Header;
use crate::error::{Error, Result};
use crate::identity::{Address, Identity};
use crate::models::Mail;
use crate::transport::{self, RawMessage};
use crate::wire::{
    Data, DownloadMessages, GetData, PublishMessage, Register, Response, ResponseMessage,
    Unregister, UpdateMessage, WireType, codes,
};

/// Upper bound on the capacity reserved from a server-announced count
const MAX_PREALLOCATED: usize = 1024;

/// Handle for talking to one mail server as one identity
#[derive(Clone)]
pub struct Client {
    key: Arc<Identity>,
    server: Address,
}

impl Client {
    /// Bind `key` to the server at `server`
    ///
    /// # Panics
    ///
    /// If `server` has no network location. Resolve it through a
    /// [`crate::router::Router`] first.
    pub fn new(key: Arc<Identity>, server: Address) -> Self {
        assert!(
            server.has_location(),
            "cannot create a client for {server} without a network location"
        );
        Self { key, server }
    }

    pub fn server(&self) -> &Address {
        &self.server
    }

    pub fn key(&self) -> &Identity {
        &self.key
    }

    fn header(&self) -> Header {
        Header::new(&self.key.address, &self.server).with_encryption_key(self.key.encryption_key())
    }

    fn raw<T: Serialize>(&self, kind: WireType, body: &T) -> Result<RawMessage> {
        RawMessage::new(self.header(), kind, body)
    }

    fn send_and_get_response(&self, message: RawMessage) -> Result<Response> {
        let reply = transport::send_and_receive(
            message,
            &self.key,
            &self.server.location,
            Some(&self.server),
        )?;
        transport::decode_reply(&reply, WireType::Response)
    }

    fn send_and_check(&self, message: RawMessage) -> Result<Response> {
        let response = self.send_and_get_response(message)?;
        if response.code != codes::OK {
            return Err(Error::Status {
                code: response.code,
                message: response.message,
            });
        }
        Ok(response)
    }

    // === Account management ===

    /// Register with the server, passing profile fields such as `name`
    pub fn register<K, V>(&self, keys: impl IntoIterator<Item = (K, V)>) -> Result<()>
    where
        K: Into<String>,
        V: Into<Vec<u8>>,
    {
        let message = self.raw(
            WireType::Register,
            &Register {
                keys: to_data(keys),
            },
        )?;
        self.send_and_check(message)?;
        Ok(())
    }

    pub fn unregister<K, V>(&self, keys: impl IntoIterator<Item = (K, V)>) -> Result<()>
    where
        K: Into<String>,
        V: Into<Vec<u8>>,
    {
        let message = self.raw(
            WireType::Unregister,
            &Unregister {
                keys: to_data(keys),
            },
        )?;
        self.send_and_check(message)?;
        Ok(())
    }

    // === Message management ===

    /// Sign `mail`, encrypting for the first recipient if there is one
    fn sign_and_encrypt(&self, mail: &Mail, to: &[Address]) -> Result<Vec<u8>> {
        mail.to_envelope(&self.key, to.first())?.to_bytes()
    }

    /// Store `mail` on the server and return its name
    ///
    /// Without an explicit `name` the message is named by the hex SHA-256
    /// of its envelope, so publishing identical broadcast mail twice yields
    /// the same name. `alert` asks that recipients be notified.
    pub fn publish_message(
        &self,
        mail: &Mail,
        to: &[Address],
        name: &str,
        alert: bool,
    ) -> Result<String> {
        let data = self.sign_and_encrypt(mail, to)?;
        let name = if name.is_empty() {
            content_name(&data)
        } else {
            name.to_string()
        };

        let message = self.raw(
            WireType::PublishMessage,
            &PublishMessage {
                to: to.iter().map(|a| a.fingerprint.clone()).collect(),
                name: name.clone(),
                alert,
                data,
            },
        )?;
        self.send_and_check(message)?;

        debug!("Published {} to {}", name, self.server.location);
        Ok(name)
    }

    /// Replace the content stored under `name`
    pub fn update_message(&self, mail: &Mail, to: &[Address], name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::MissingName);
        }

        let data = self.sign_and_encrypt(mail, to)?;
        let message = self.raw(
            WireType::UpdateMessage,
            &UpdateMessage {
                name: name.to_string(),
                data,
            },
        )?;
        self.send_and_check(message)?;
        Ok(())
    }

    /// Download messages addressed to us since `since`
    ///
    /// All or nothing: any failure while reading the announced messages
    /// fails the whole call. The connection is closed on every return.
    pub fn download_messages(&self, since: u64, context: bool) -> Result<Vec<ResponseMessage>> {
        let message = self.raw(
            WireType::DownloadMessages,
            &DownloadMessages { since, context },
        )?;

        let mut conn = transport::connect(&self.server.location)?;
        transport::sign_and_send(message, &self.key, Some(&self.server), &mut conn)?;

        let head = transport::receive(&mut conn, &self.key)?;
        let response: Response = transport::decode_reply(&head, WireType::Response)?;
        if response.code != codes::OK {
            return Err(Error::Status {
                code: response.code,
                message: response.message,
            });
        }

        if response.length == 0 {
            return Ok(Vec::new());
        }

        let count = response.length as usize;
        let mut messages = Vec::with_capacity(count.min(MAX_PREALLOCATED));
        for _ in 0..count {
            let reply = transport::receive(&mut conn, &self.key)?;
            messages.push(transport::decode_reply(&reply, WireType::ResponseMessage)?);
        }

        debug!("Downloaded {} messages from {}", messages.len(), self.server.location);
        Ok(messages)
    }

    // === Data management ===

    /// Store an opaque value under `key`
    pub fn set_data(&self, key: &str, value: &[u8]) -> Result<()> {
        let message = self.raw(
            WireType::Data,
            &Data {
                key: key.to_string(),
                data: value.to_vec(),
            },
        )?;
        self.send_and_check(message)?;
        Ok(())
    }

    pub fn get_data(&self, key: &str) -> Result<Vec<u8>> {
        let message = self.raw(
            WireType::GetData,
            &GetData {
                key: key.to_string(),
            },
        )?;
        Ok(self.send_and_check(message)?.data)
    }
}

/// Hex SHA-256 of an envelope, the default message name
pub fn content_name(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn to_data<K, V>(keys: impl IntoIterator<Item = (K, V)>) -> Vec<Data>
where
    K: Into<String>,
    V: Into<Vec<u8>>,
{
    keys.into_iter()
        .map(|(key, data)| Data {
            key: key.into(),
            data: data.into(),
        })
        .collect()
}
