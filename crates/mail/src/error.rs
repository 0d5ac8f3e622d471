//! Error types for the protocol core

use crate::wire::{WireType, codes};

/// Result alias used throughout the protocol layer
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Broad category of an [`Error`], used by callers deciding whether to retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Alias malformed, directory unreachable or entry missing
    Resolution,
    /// Connect/send/receive failure
    Transport,
    /// Bad signature or failed decryption
    Verification,
    /// Unexpected wire type, non-zero status, malformed framing
    Protocol,
    /// Application-level error reported by the remote peer
    Remote,
    /// Zero persistence matches where one was required
    NotFound,
    /// Multiple persistence matches where one was required
    Ambiguous,
    /// Caller violated a precondition (missing name, missing location)
    Precondition,
    /// Persistence backend failure
    Storage,
}

/// Errors produced by the directory, client, sync engine and server handlers
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed alias {0:?}: expected name@domain")]
    MalformedAlias(String),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    #[error("no directory entry for {0:?}")]
    AliasNotFound(String),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("verification failed: {0}")]
    Verification(String),

    #[error("unexpected message type: expected {expected:?}, got {found:?}")]
    UnexpectedType { expected: WireType, found: WireType },

    #[error("unexpected response status {code}: {message}")]
    Status { code: u32, message: String },

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("remote error {code}: {description}")]
    Remote { code: u32, description: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("expected exactly one {what}, found {count}")]
    Ambiguous { what: String, count: usize },

    #[error("{0} is not registered on this server")]
    NotRegistered(String),

    #[error("conflicting write to message {0:?}")]
    Conflict(String),

    #[error("a named message to update is required")]
    MissingName,

    #[error("address {0} has no network location")]
    MissingLocation(String),

    #[error("address {0} has no encryption key")]
    MissingEncryptionKey(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl Error {
    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MalformedAlias(_) | Error::UnsupportedOperation(_) | Error::AliasNotFound(_) => {
                ErrorKind::Resolution
            }
            Error::Transport(_) => ErrorKind::Transport,
            Error::Verification(_) => ErrorKind::Verification,
            Error::UnexpectedType { .. } | Error::Status { .. } | Error::Malformed(_) => {
                ErrorKind::Protocol
            }
            Error::Remote { .. } => ErrorKind::Remote,
            Error::NotFound(_) | Error::NotRegistered(_) => ErrorKind::NotFound,
            Error::Ambiguous { .. } => ErrorKind::Ambiguous,
            Error::Conflict(_) => ErrorKind::Storage,
            Error::MissingName | Error::MissingLocation(_) | Error::MissingEncryptionKey(_) => {
                ErrorKind::Precondition
            }
            Error::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Code reported to the peer when a handler fails with this error
    pub fn wire_code(&self) -> u32 {
        match self {
            Error::NotFound(_) | Error::AliasNotFound(_) => codes::NOT_FOUND,
            Error::Ambiguous { .. } => codes::AMBIGUOUS,
            Error::NotRegistered(_) => codes::NOT_REGISTERED,
            Error::Conflict(_) => codes::CONFLICT,
            Error::UnsupportedOperation(_) => codes::UNSUPPORTED,
            Error::MalformedAlias(_)
            | Error::Malformed(_)
            | Error::MissingName
            | Error::MissingLocation(_)
            | Error::MissingEncryptionKey(_) => codes::BAD_REQUEST,
            _ => codes::INTERNAL,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Malformed(err.to_string())
    }
}
