//! Mail crate - federated, end-to-end encrypted mail exchange
//!
//! This crate provides the protocol core of a Melange mail server and its
//! clients:
//! - Identities, addresses and signed/encrypted envelopes
//! - Framed wire transport and message types
//! - Address resolution through directory servers (routers)
//! - The protocol client (register, publish/update, download, data)
//! - Cross-server sync merging public, private and own mail into one feed
//! - Server dispatch and persistence-backed request handlers
//! - Storage trait abstractions with in-memory and SQLite backends
//!
//! All network operations are blocking and carry their own timeouts.

pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod models;
pub mod router;
pub mod server;
pub mod storage;
pub mod sync;
pub mod transport;
pub mod wire;

pub use client::{Client, content_name};
pub use config::ServerConfig;
pub use envelope::{EncryptedMessage, Header, SignedMessage};
pub use error::{Error, ErrorKind, Result};
pub use identity::{Address, Identity};
pub use models::{
    Alert, Component, IdentityRecord, Mail, MailBuilder, MessageDescription, MessageKind,
    MessageList, StoredMessage, Subscription, User, components,
};
pub use router::{
    LocalRouter, LookupRouter, Router, Routers, Tracker, TrackerRouter, init_routers, routers,
};
pub use server::{Delegate, MailServer, RetrievedMail, Server};
pub use storage::{InMemoryMailStore, MailStore, SqliteMailStore};
pub use sync::{
    FeedOptions, MelangeMessage, download_message, download_message_from_alert,
    download_message_list, download_public_mail, get_profile, messages, publish_and_record,
    send_alert,
};
