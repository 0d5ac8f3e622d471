//! Server side of the protocol
//!
//! [`Server`] owns the accept loop and wire dispatch; [`MailServer`] is the
//! persistence-backed [`Delegate`] a mail server plugs into it.

mod dispatch;
mod handlers;

pub use dispatch::{Delegate, RetrievedMail, Server};
pub use handlers::{AVATAR_KEY, MailServer, NAME_KEY, PROFILE_MESSAGE};
