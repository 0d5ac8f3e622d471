//! Framed envelope transport over TCP
//!
//! ## Wire Format
//! ```text
//! [Magic(4) = "MLG1"] [Length(4), big-endian] [EncryptedMessage(N)]
//! ```
//!
//! Frames larger than [`MAX_FRAME_SIZE`] are rejected before allocation.
//! All socket operations block, bounded by [`DEFAULT_TIMEOUT`].

use log::debug;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::envelope::{EncryptedMessage, Header, SignedMessage};
use crate::error::{Error, Result};
use crate::identity::{Address, Identity};
use crate::wire::{self, ErrorPayload, WireType};

/// Frame preamble
pub const MAGIC: [u8; 4] = *b"MLG1";

/// Largest frame body accepted (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Connect, read and write timeout for every exchange
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Open a connection to `host:port`
pub fn connect(location: &str) -> Result<TcpStream> {
    let mut last_err = None;
    for addr in location.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, DEFAULT_TIMEOUT) {
            Ok(stream) => {
                stream.set_read_timeout(Some(DEFAULT_TIMEOUT))?;
                stream.set_write_timeout(Some(DEFAULT_TIMEOUT))?;
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }

    Err(last_err
        .unwrap_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no addresses for {location}"),
            )
        })
        .into())
}

pub fn write_frame<W: Write>(writer: &mut W, body: &[u8]) -> Result<()> {
    if body.len() > MAX_FRAME_SIZE {
        return Err(Error::Malformed(format!("frame of {} bytes too large", body.len())));
    }
    writer.write_all(&MAGIC)?;
    writer.write_all(&(body.len() as u32).to_be_bytes())?;
    writer.write_all(body)?;
    writer.flush()?;
    Ok(())
}

pub fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut preamble = [0u8; 8];
    reader.read_exact(&mut preamble)?;

    if preamble[..4] != MAGIC {
        return Err(Error::Malformed("bad frame magic".to_string()));
    }

    let len = u32::from_be_bytes([preamble[4], preamble[5], preamble[6], preamble[7]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::Malformed(format!("frame of {len} bytes too large")));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(body)
}

pub fn write_message<W: Write>(writer: &mut W, message: &EncryptedMessage) -> Result<()> {
    write_frame(writer, &message.to_bytes()?)
}

pub fn read_message<R: Read>(reader: &mut R) -> Result<EncryptedMessage> {
    EncryptedMessage::from_bytes(&read_frame(reader)?)
}

/// An outgoing message before signing
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub header: Header,
    pub kind: WireType,
    pub payload: Vec<u8>,
}

impl RawMessage {
    pub fn new<T: Serialize>(header: Header, kind: WireType, body: &T) -> Result<Self> {
        Ok(Self {
            header,
            kind,
            payload: wire::encode(body)?,
        })
    }

    /// Sign with `key`, encrypting for `seal_for` when its key is known
    pub fn seal(self, key: &Identity, seal_for: Option<&Address>) -> Result<EncryptedMessage> {
        SignedMessage::sign(self.header, self.kind, self.payload, key)?.seal(seal_for)
    }
}

/// Sign, seal and write one message to an open connection
pub fn sign_and_send<W: Write>(
    message: RawMessage,
    key: &Identity,
    seal_for: Option<&Address>,
    conn: &mut W,
) -> Result<()> {
    write_message(conn, &message.seal(key, seal_for)?)
}

/// Read one message and open it with `key`
pub fn receive<R: Read>(conn: &mut R, key: &Identity) -> Result<SignedMessage> {
    read_message(conn)?.open(key)
}

/// One request, one reply, on a fresh connection to `location`
///
/// The connection is closed when this returns.
pub fn send_and_receive(
    message: RawMessage,
    key: &Identity,
    location: &str,
    seal_for: Option<&Address>,
) -> Result<SignedMessage> {
    debug!("Sending {:?} to {}", message.kind, location);
    let mut conn = connect(location)?;
    sign_and_send(message, key, seal_for, &mut conn)?;
    receive(&mut conn, key)
}

/// Decode a reply, surfacing an embedded remote error first
pub fn decode_reply<T: DeserializeOwned>(reply: &SignedMessage, expected: WireType) -> Result<T> {
    check_for_error(reply)?;
    reply.decode(expected)
}

/// Turn an error-typed reply into [`Error::Remote`]
pub fn check_for_error(reply: &SignedMessage) -> Result<()> {
    if reply.kind != WireType::Error {
        return Ok(());
    }
    let err: ErrorPayload = wire::decode(&reply.payload)?;
    Err(Error::Remote {
        code: err.code,
        description: err.description,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Response;
    use std::io::Cursor;

    #[test]
    fn test_frame_round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").unwrap();
        write_frame(&mut buf, b"").unwrap();

        let mut reader = Cursor::new(buf);
        assert_eq!(read_frame(&mut reader).unwrap(), b"hello");
        assert!(read_frame(&mut reader).unwrap().is_empty());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut reader = Cursor::new(b"XXXX\0\0\0\x01a".to_vec());
        assert!(matches!(read_frame(&mut reader), Err(Error::Malformed(_))));
    }

    #[test]
    fn test_oversized_length_rejected_before_read() {
        let mut frame = MAGIC.to_vec();
        frame.extend_from_slice(&u32::MAX.to_be_bytes());
        let mut reader = Cursor::new(frame);
        assert!(matches!(read_frame(&mut reader), Err(Error::Malformed(_))));
    }

    #[test]
    fn test_short_read_is_transport_error() {
        let mut frame = MAGIC.to_vec();
        frame.extend_from_slice(&10u32.to_be_bytes());
        frame.extend_from_slice(b"abc");
        let mut reader = Cursor::new(frame);
        assert!(matches!(read_frame(&mut reader), Err(Error::Transport(_))));
    }

    #[test]
    fn test_error_reply_takes_precedence() {
        let server = Identity::create();
        let client = Identity::create();
        let payload = ErrorPayload {
            code: wire::codes::NOT_FOUND,
            description: "no such message".to_string(),
        };
        let header = Header::new(&server.address, &client.address);
        let reply = SignedMessage::sign(header, WireType::Error, wire::encode(&payload).unwrap(), &server)
            .unwrap();

        let err = decode_reply::<Response>(&reply, WireType::Response).unwrap_err();
        assert!(matches!(err, Error::Remote { code, .. } if code == wire::codes::NOT_FOUND));
    }
}
