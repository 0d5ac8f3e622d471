//! Storage traits and implementations
//!
//! This module defines the persistence layer the server-side handlers and
//! the sync engine consume. The trait-based design allows swapping between
//! in-memory and SQLite storage.

mod memory;
mod sqlite;
mod traits;

pub use memory::InMemoryMailStore;
pub use sqlite::SqliteMailStore;
pub use traits::MailStore;
