//! Cross-server fetches: single messages, public lists, profiles, alerts

use chrono::Utc;
use log::debug;

use crate::envelope::Header;
use crate::error::{Error, Result};
use crate::identity::{Address, Identity};
use crate::models::{Alert, Mail, MessageDescription, MessageList};
use crate::router::Router;
use crate::server::PROFILE_MESSAGE;
use crate::transport::{self, RawMessage};
use crate::wire::{Response, TransferMessage, TransferMessageList, WireType};

/// Resolve `to`, routing to `to_server` instead when one is given
///
/// A bare fingerprint with an explicit server needs no directory lookup.
pub(crate) fn resolve(router: &dyn Router, to: &str, to_server: Option<&str>) -> Result<Address> {
    let to_server = to_server.filter(|s| !s.is_empty());
    let address = match to_server {
        Some(server) if !to.contains('@') => Address::from_fingerprint(to).with_location(server),
        Some(server) => router.lookup_alias(to)?.with_location(server),
        None => router.lookup_alias(to)?,
    };

    if !address.has_location() {
        return Err(Error::MissingLocation(address.fingerprint));
    }
    Ok(address)
}

fn request_header(from: &Identity, to: &Address) -> Header {
    Header::new(&from.address, to).with_encryption_key(from.encryption_key())
}

/// Fetch the message `name` authored by `to`
///
/// `to_server` overrides the author's resolved location for this request
/// (descriptors and alerts carry the server that holds the message).
pub fn download_message(
    router: &dyn Router,
    name: &str,
    from: &Identity,
    to: &str,
    to_server: Option<&str>,
) -> Result<Mail> {
    let author = resolve(router, to, to_server)?;
    fetch_message(&author, name, from)
}

/// Fetch `name` from the server at `author.location`
pub(crate) fn fetch_message(author: &Address, name: &str, from: &Identity) -> Result<Mail> {
    let request = RawMessage::new(
        request_header(from, author),
        WireType::TransferMessage,
        &TransferMessage {
            name: name.to_string(),
            author: author.fingerprint.clone(),
        },
    )?;
    let reply = transport::send_and_receive(request, from, &author.location, None)?;
    transport::check_for_error(&reply)?;

    match reply.kind {
        WireType::Mail => Mail::from_envelope(&reply.payload, from),
        // Servers answer an empty success when they can't serve the message
        WireType::Response => Err(Error::NotFound(format!(
            "message {name:?} from {}",
            author.fingerprint
        ))),
        found => Err(Error::UnexpectedType {
            expected: WireType::Mail,
            found,
        }),
    }
}

/// Descriptors of `to`'s broadcast messages newer than `since`
///
/// An empty success reply means no messages.
pub fn download_public_mail(
    router: &dyn Router,
    since: u64,
    from: &Identity,
    to: &str,
) -> Result<MessageList> {
    let author = resolve(router, to, None)?;
    fetch_message_list(&author, since, from)
}

/// Descriptors of `author`'s broadcast messages, asked of `author.location`
pub(crate) fn fetch_message_list(
    author: &Address,
    since: u64,
    from: &Identity,
) -> Result<MessageList> {
    let request = RawMessage::new(
        request_header(from, author),
        WireType::TransferMessageList,
        &TransferMessageList {
            since,
            author: author.fingerprint.clone(),
        },
    )?;
    let reply = transport::send_and_receive(request, from, &author.location, None)?;
    transport::check_for_error(&reply)?;

    match reply.kind {
        WireType::MessageList => reply.decode(WireType::MessageList),
        WireType::Response => {
            let response: Response = reply.decode(WireType::Response)?;
            if !response.data.is_empty() {
                return Err(Error::Malformed(
                    "message list reply carried unexpected data".to_string(),
                ));
            }
            Ok(MessageList::new(author.fingerprint.clone(), from.fingerprint()))
        }
        found => Err(Error::UnexpectedType {
            expected: WireType::MessageList,
            found,
        }),
    }
}

/// Fetch every message a list describes, in list order
pub fn download_message_list(
    router: &dyn Router,
    list: &MessageList,
    from: &Identity,
    to: &str,
) -> Result<Vec<Mail>> {
    let Some(first) = list.content.first() else {
        return Ok(Vec::new());
    };
    let author = resolve(router, to, Some(&first.location))?;

    list.content
        .iter()
        .map(|desc| fetch_message(&held_at(&author, &desc.location), &desc.name, from))
        .collect()
}

/// `author` routed to the server at `location`, if one is named
pub(crate) fn held_at(author: &Address, location: &str) -> Address {
    if location.is_empty() {
        author.clone()
    } else {
        author.clone().with_location(location)
    }
}

/// Fetch the profile `to`'s server renders for us
pub fn get_profile(router: &dyn Router, from: &Identity, to: &str) -> Result<Mail> {
    download_message(router, PROFILE_MESSAGE, from, to, None)
}

/// Fetch the message an alert points at
pub fn download_message_from_alert(
    router: &dyn Router,
    alert: &Alert,
    from: &Identity,
) -> Result<Mail> {
    download_message(router, &alert.name, from, &alert.from, Some(&alert.location))
}

/// Tell `to`'s server that message `name` is waiting at `location`
pub fn send_alert(
    router: &dyn Router,
    name: &str,
    from: &Identity,
    to: &str,
    location: &str,
) -> Result<()> {
    let recipient = resolve(router, to, None)?;
    deliver_alert(name, from, &recipient, location)
}

/// Deliver an alert straight to `recipient.location`
pub(crate) fn deliver_alert(
    name: &str,
    from: &Identity,
    recipient: &Address,
    location: &str,
) -> Result<()> {
    let desc = MessageDescription {
        name: name.to_string(),
        location: location.to_string(),
        from: from.fingerprint().to_string(),
        to: recipient.fingerprint.clone(),
        timestamp: Utc::now().timestamp(),
    };
    let request = RawMessage::new(
        request_header(from, recipient),
        WireType::MessageDescription,
        &desc,
    )?;
    let reply = transport::send_and_receive(request, from, &recipient.location, None)?;
    transport::decode_reply::<Response>(&reply, WireType::Response)?;

    debug!("Alerted {} about {}", recipient, name);
    Ok(())
}
