//! Wire message types
//!
//! Each request or reply carries one [`WireType`] tag plus a
//! bincode-encoded payload struct from this module. Mail, message lists
//! and message descriptions travel as their [`crate::models`] types.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::identity::{Address, Identity};
use crate::models::Mail;

/// Tag identifying the payload carried by an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WireType {
    Error,
    Response,
    ResponseMessage,
    Register,
    Unregister,
    DownloadMessages,
    PublishMessage,
    UpdateMessage,
    Data,
    GetData,
    Mail,
    MessageList,
    TransferMessage,
    TransferMessageList,
    MessageDescription,
    AliasLookup,
    AliasRegister,
    AliasResponse,
}

/// Status and error codes shared by client and server
pub mod codes {
    pub const OK: u32 = 0;
    pub const INTERNAL: u32 = 1;
    pub const NOT_FOUND: u32 = 2;
    pub const AMBIGUOUS: u32 = 3;
    pub const BAD_REQUEST: u32 = 4;
    pub const NOT_REGISTERED: u32 = 5;
    pub const CONFLICT: u32 = 6;
    pub const UNSUPPORTED: u32 = 7;
}

/// Encode a payload struct
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Decode a payload struct
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// A named opaque value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Data {
    pub key: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Register {
    pub keys: Vec<Data>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unregister {
    pub keys: Vec<Data>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadMessages {
    pub since: u64,
    pub context: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishMessage {
    pub to: Vec<String>,
    pub name: String,
    pub alert: bool,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateMessage {
    pub name: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetData {
    pub key: String,
}

/// Reply to simple requests; `length` announces streamed sub-messages
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    pub code: u32,
    pub message: String,
    pub length: u64,
    pub data: Vec<u8>,
}

impl Response {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    pub fn with_length(length: u64) -> Self {
        Self {
            length,
            ..Self::default()
        }
    }
}

/// Application-level failure reported by a peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: u32,
    pub description: String,
}

/// Request for one stored message by name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferMessage {
    pub name: String,
    pub author: String,
}

/// Request for descriptors of an author's broadcast messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferMessageList {
    pub since: u64,
    pub author: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliasLookup {
    pub alias: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliasRegister {
    pub alias: String,
    pub address: Address,
}

/// One message streamed back by a download-messages request
///
/// `data` holds the stored envelope exactly as the author published it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub name: String,
    pub from: String,
    pub to: String,
    pub timestamp: i64,
    pub data: Vec<u8>,
}

impl ResponseMessage {
    /// Open the carried envelope as `key`
    pub fn to_mail(&self, key: &Identity) -> Result<Mail> {
        Mail::from_envelope(&self.data, key)
    }
}
