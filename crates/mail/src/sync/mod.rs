//! Cross-server mail synchronization
//!
//! [`messages`] merges three independent sources into one feed ordered by
//! timestamp: public mail from subscriptions (list, then fetch each
//! descriptor), private mail announced by alerts, and the local identity's
//! sent copies written by [`publish_and_record`]. The helpers in this module perform the individual
//! cross-server fetches and are usable on their own.
//!
//! Every operation is all or nothing: the first resolution, transport or
//! verification failure aborts the call and no partial result is returned.

mod download;
mod feed;

pub use download::{
    download_message, download_message_from_alert, download_message_list, download_public_mail,
    get_profile, send_alert,
};
pub use feed::{FeedOptions, MelangeMessage, messages, publish_and_record};
