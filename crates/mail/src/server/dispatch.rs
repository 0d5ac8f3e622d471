//! Connection accept loop and request dispatch
//!
//! Each connection carries one request. The request envelope is opened
//! with the server key, dispatched on its wire type to a [`Delegate`], and
//! the replies are sealed to the key the requester advertised in its
//! header. A failing handler becomes a single `Error` reply.

use log::{debug, error, info, warn};
use serde::Serialize;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use crate::envelope::{Header, SignedMessage};
use crate::error::{Error, Result};
use crate::identity::{Address, Identity};
use crate::models::{Mail, MessageDescription, MessageList};
use crate::transport::{self, DEFAULT_TIMEOUT, RawMessage};
use crate::wire::{
    self, AliasLookup, AliasRegister, Data, DownloadMessages, ErrorPayload, GetData,
    PublishMessage, Register, Response, ResponseMessage, TransferMessage, TransferMessageList,
    Unregister, UpdateMessage, WireType,
};

/// What a server hands back for a message fetch
#[derive(Debug, Clone)]
pub enum RetrievedMail {
    /// Envelope bytes exactly as the author published them
    Stored(Vec<u8>),
    /// Mail synthesized by the server, signed with the server key
    Rendered(Mail),
}

/// Request handlers behind a [`Server`]
///
/// `from` is always the verified sender of the request. Every handler
/// defaults to [`Error::UnsupportedOperation`], so a delegate implements
/// only the requests it serves.
#[allow(unused_variables)]
pub trait Delegate: Send + Sync {
    fn register(&self, from: &Address, keys: Vec<Data>) -> Result<()> {
        Err(Error::UnsupportedOperation("register"))
    }

    fn unregister(&self, from: &Address, keys: Vec<Data>) -> Result<()> {
        Err(Error::UnsupportedOperation("unregister"))
    }

    fn publish_message(&self, from: &Address, message: PublishMessage) -> Result<()> {
        Err(Error::UnsupportedOperation("publish message"))
    }

    fn update_message(&self, from: &Address, message: UpdateMessage) -> Result<()> {
        Err(Error::UnsupportedOperation("update message"))
    }

    fn get_messages(&self, from: &Address, since: u64, context: bool) -> Result<Vec<ResponseMessage>> {
        Err(Error::UnsupportedOperation("download messages"))
    }

    fn set_data(&self, from: &Address, data: Data) -> Result<()> {
        Err(Error::UnsupportedOperation("set data"))
    }

    fn get_data(&self, from: &Address, key: &str) -> Result<Vec<u8>> {
        Err(Error::UnsupportedOperation("get data"))
    }

    /// `None` is reported to the peer as an empty success
    fn retrieve_message_for_user(
        &self,
        name: &str,
        author: &str,
        from: &Address,
    ) -> Option<RetrievedMail> {
        None
    }

    /// `None` is reported to the peer as an empty success
    fn retrieve_message_list_for_user(
        &self,
        since: u64,
        author: &str,
        from: &Address,
    ) -> Option<MessageList> {
        None
    }

    fn save_message_description(&self, from: &Address, desc: MessageDescription) -> Result<()> {
        Err(Error::UnsupportedOperation("message description"))
    }

    fn lookup_alias(&self, from: &Address, alias: &str) -> Result<Address> {
        Err(Error::UnsupportedOperation("alias lookup"))
    }

    fn register_alias(&self, from: &Address, alias: &str, address: Address) -> Result<()> {
        Err(Error::UnsupportedOperation("alias registration"))
    }
}

/// A listening protocol endpoint
#[derive(Clone)]
pub struct Server {
    /// Advertised `host:port`, for logging
    pub location: String,
    key: Arc<Identity>,
    delegate: Arc<dyn Delegate>,
}

impl Server {
    pub fn new(location: impl Into<String>, key: Arc<Identity>, delegate: Arc<dyn Delegate>) -> Self {
        Self {
            location: location.into(),
            key,
            delegate,
        }
    }

    pub fn key(&self) -> &Identity {
        &self.key
    }

    /// Accept connections forever, one thread per connection
    pub fn serve(&self, listener: TcpListener) -> Result<()> {
        info!(
            "Serving {} as {} on {}",
            self.location,
            self.key.fingerprint(),
            listener.local_addr()?
        );

        for conn in listener.incoming() {
            let conn = match conn {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let server = self.clone();
            thread::spawn(move || {
                let peer = conn.peer_addr().ok();
                if let Err(e) = server.handle_connection(conn) {
                    debug!("Connection from {:?} ended with error: {}", peer, e);
                }
            });
        }

        Ok(())
    }

    /// Read one request, answer it, and close
    pub fn handle_connection(&self, mut conn: TcpStream) -> Result<()> {
        conn.set_read_timeout(Some(DEFAULT_TIMEOUT))?;
        conn.set_write_timeout(Some(DEFAULT_TIMEOUT))?;

        let request = transport::receive(&mut conn, &self.key)?;
        let requester = requester_address(&request.header);
        debug!("Received {:?} from {}", request.kind, requester);

        let replies = match self.dispatch(&request, &requester) {
            Ok(replies) => replies,
            Err(e) => {
                if e.wire_code() == wire::codes::INTERNAL {
                    error!("Handling {:?} from {}: {}", request.kind, requester, e);
                } else {
                    debug!("Rejected {:?} from {}: {}", request.kind, requester, e);
                }
                let payload = ErrorPayload {
                    code: e.wire_code(),
                    description: e.to_string(),
                };
                vec![self.reply(&requester, WireType::Error, &payload)?]
            }
        };

        for reply in replies {
            transport::sign_and_send(reply, &self.key, Some(&requester), &mut conn)?;
        }
        Ok(())
    }

    fn dispatch(&self, request: &SignedMessage, from: &Address) -> Result<Vec<RawMessage>> {
        let delegate = self.delegate.as_ref();
        let ok = || self.reply(from, WireType::Response, &Response::ok());

        match request.kind {
            WireType::Register => {
                let body: Register = request.decode(WireType::Register)?;
                delegate.register(from, body.keys)?;
                Ok(vec![ok()?])
            }
            WireType::Unregister => {
                let body: Unregister = request.decode(WireType::Unregister)?;
                delegate.unregister(from, body.keys)?;
                Ok(vec![ok()?])
            }
            WireType::PublishMessage => {
                let body: PublishMessage = request.decode(WireType::PublishMessage)?;
                delegate.publish_message(from, body)?;
                Ok(vec![ok()?])
            }
            WireType::UpdateMessage => {
                let body: UpdateMessage = request.decode(WireType::UpdateMessage)?;
                delegate.update_message(from, body)?;
                Ok(vec![ok()?])
            }
            WireType::DownloadMessages => {
                let body: DownloadMessages = request.decode(WireType::DownloadMessages)?;
                let messages = delegate.get_messages(from, body.since, body.context)?;

                let mut replies = Vec::with_capacity(messages.len() + 1);
                replies.push(self.reply(
                    from,
                    WireType::Response,
                    &Response::with_length(messages.len() as u64),
                )?);
                for message in &messages {
                    replies.push(self.reply(from, WireType::ResponseMessage, message)?);
                }
                Ok(replies)
            }
            WireType::Data => {
                let body: Data = request.decode(WireType::Data)?;
                delegate.set_data(from, body)?;
                Ok(vec![ok()?])
            }
            WireType::GetData => {
                let body: GetData = request.decode(WireType::GetData)?;
                let data = delegate.get_data(from, &body.key)?;
                Ok(vec![self.reply(from, WireType::Response, &Response::with_data(data))?])
            }
            WireType::TransferMessage => {
                let body: TransferMessage = request.decode(WireType::TransferMessage)?;
                let bytes = match delegate.retrieve_message_for_user(&body.name, &body.author, from)
                {
                    Some(RetrievedMail::Stored(bytes)) => bytes,
                    Some(RetrievedMail::Rendered(mail)) => {
                        let to = from.encryption_key.is_some().then_some(from);
                        mail.to_envelope(&self.key, to)?.to_bytes()?
                    }
                    None => return Ok(vec![ok()?]),
                };
                let header = Header::new(&self.key.address, from);
                Ok(vec![RawMessage {
                    header,
                    kind: WireType::Mail,
                    payload: bytes,
                }])
            }
            WireType::TransferMessageList => {
                let body: TransferMessageList = request.decode(WireType::TransferMessageList)?;
                match delegate.retrieve_message_list_for_user(body.since, &body.author, from) {
                    Some(list) => Ok(vec![self.reply(from, WireType::MessageList, &list)?]),
                    None => Ok(vec![ok()?]),
                }
            }
            WireType::MessageDescription => {
                let body: MessageDescription = request.decode(WireType::MessageDescription)?;
                delegate.save_message_description(from, body)?;
                Ok(vec![ok()?])
            }
            WireType::AliasLookup => {
                let body: AliasLookup = request.decode(WireType::AliasLookup)?;
                let address = delegate.lookup_alias(from, &body.alias)?;
                Ok(vec![self.reply(from, WireType::AliasResponse, &address)?])
            }
            WireType::AliasRegister => {
                let body: AliasRegister = request.decode(WireType::AliasRegister)?;
                delegate.register_alias(from, &body.alias, body.address)?;
                Ok(vec![ok()?])
            }
            WireType::Error
            | WireType::Response
            | WireType::ResponseMessage
            | WireType::Mail
            | WireType::MessageList
            | WireType::AliasResponse => Err(Error::UnsupportedOperation("reply sent as request")),
        }
    }

    fn reply<T: Serialize>(&self, to: &Address, kind: WireType, body: &T) -> Result<RawMessage> {
        RawMessage::new(Header::new(&self.key.address, to), kind, body)
    }
}

/// The sender as a reply destination, carrying its advertised reply key
fn requester_address(header: &Header) -> Address {
    let mut address = header.from.clone();
    if header.encryption_key.is_some() {
        address.encryption_key = header.encryption_key;
    }
    address
}
