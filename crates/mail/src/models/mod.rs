//! Domain models for mail entities

mod alert;
mod mail;
mod message;
mod subscription;
mod user;

pub use alert::Alert;
pub use mail::{Component, Mail, MailBuilder, MessageDescription, MessageList, components};
pub use message::{MessageKind, StoredMessage};
pub use subscription::Subscription;
pub use user::{IdentityRecord, User};
