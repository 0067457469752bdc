//! SNI (Server Name Indication) extraction from TLS ClientHello.
//!
//! The first TLS record of a connection is peeked, never read, so the exact
//! bytes remain available for the tunnel. Parsing is a pure function over
//! that record: nothing is written back to the client and no handshake state
//! is created.

use tokio::io::AsyncRead;
use tracing::debug;

use super::peek::PeekReader;
use crate::error::ProxyError;

/// TLS record header length: type (1), version (2), length (2).
pub const RECORD_HEADER_LEN: usize = 5;

/// Record content type for handshake messages.
pub const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;

const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// Result of SNI inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniResult {
    /// Successfully extracted SNI hostname (normalized to lowercase).
    Found(String),
    /// TLS ClientHello present but no SNI extension.
    NoSni,
    /// Data is not a TLS handshake record carrying a ClientHello.
    NotTls,
    /// ClientHello is malformed or does not fit in the first record.
    Malformed,
}

impl SniResult {
    /// The hostname, if one was found.
    pub fn hostname(&self) -> Option<&str> {
        match self {
            SniResult::Found(hostname) => Some(hostname),
            _ => None,
        }
    }
}

/// Peek the first TLS record from `reader` and extract its server name.
///
/// Only byte 0 of the record header gates parsing: anything other than a
/// handshake record yields [`SniResult::NotTls`] before the length is read.
/// A declared length larger than what the peer sends fails with
/// [`ProxyError::PeekShortRead`].
pub async fn sniff_server_name<S: AsyncRead + Unpin>(
    reader: &mut PeekReader<S>,
) -> Result<SniResult, ProxyError> {
    let header = reader.peek(RECORD_HEADER_LEN).await?;
    if header[0] != CONTENT_TYPE_HANDSHAKE {
        debug!(content_type = header[0], "Not a TLS handshake record");
        return Ok(SniResult::NotTls);
    }

    let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
    let record = reader.peek(RECORD_HEADER_LEN + record_len).await?;

    Ok(parse_sni(record))
}

/// Parse SNI from a complete TLS record (header included).
///
/// TLS Record structure:
/// - byte 0: record type (0x16 = Handshake)
/// - bytes 1-2: version
/// - bytes 3-4: record length
/// - bytes 5+: handshake message
///
/// Handshake ClientHello:
/// - byte 0: handshake type (0x01 = ClientHello)
/// - bytes 1-3: length
/// - 2 bytes: client version
/// - 32 bytes: random
/// - u8-prefixed session ID
/// - u16-prefixed cipher suites
/// - u8-prefixed compression methods
/// - u16-prefixed extensions (optional)
pub fn parse_sni(data: &[u8]) -> SniResult {
    if data.len() < RECORD_HEADER_LEN {
        return SniResult::Malformed;
    }
    if data[0] != CONTENT_TYPE_HANDSHAKE {
        return SniResult::NotTls;
    }

    let record_len = u16::from_be_bytes([data[3], data[4]]) as usize;
    let Some(body) = data.get(RECORD_HEADER_LEN..RECORD_HEADER_LEN + record_len) else {
        return SniResult::Malformed;
    };

    parse_handshake(body).unwrap_or(SniResult::Malformed)
}

/// Returns `None` when the message is truncated or inconsistent.
fn parse_handshake(body: &[u8]) -> Option<SniResult> {
    let mut handshake = Cursor::new(body);
    if handshake.u8()? != HANDSHAKE_TYPE_CLIENT_HELLO {
        return Some(SniResult::NotTls);
    }
    let len = handshake.u24()?;
    let mut hello = Cursor::new(handshake.take(len)?);

    hello.take(2)?; // client version
    hello.take(32)?; // random
    hello.vec_u8()?; // session id
    hello.vec_u16()?; // cipher suites
    hello.vec_u8()?; // compression methods

    if hello.is_empty() {
        return Some(SniResult::NoSni);
    }

    let mut extensions = Cursor::new(hello.vec_u16()?);
    while !extensions.is_empty() {
        let ext_type = extensions.u16()?;
        let ext_data = extensions.vec_u16()?;
        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name_extension(ext_data);
        }
    }

    Some(SniResult::NoSni)
}

/// Parse the SNI extension value.
///
/// SNI extension structure:
/// - 2 bytes: list length
/// - for each entry:
///   - 1 byte: name type (0 = hostname)
///   - 2 bytes: name length
///   - variable: name
fn parse_server_name_extension(data: &[u8]) -> Option<SniResult> {
    let mut ext = Cursor::new(data);
    let mut list = Cursor::new(ext.vec_u16()?);

    while !list.is_empty() {
        let name_type = list.u8()?;
        let name = list.vec_u16()?;
        if name_type != NAME_TYPE_HOST_NAME {
            continue;
        }

        let hostname = std::str::from_utf8(name).ok()?;
        if hostname.is_empty() || hostname.ends_with('.') {
            return None;
        }
        return Some(SniResult::Found(normalize_hostname(hostname)));
    }

    Some(SniResult::NoSni)
}

/// Lowercase a server name as sent by the client.
pub fn normalize_hostname(hostname: &str) -> String {
    hostname.to_lowercase()
}

/// Bounds-checked big-endian reader over a byte slice.
struct Cursor<'a> {
    data: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if n > self.data.len() {
            return None;
        }
        let (head, rest) = self.data.split_at(n);
        self.data = rest;
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        self.take(3)
            .map(|b| ((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize)
    }

    fn vec_u8(&mut self) -> Option<&'a [u8]> {
        let len = self.u8()? as usize;
        self.take(len)
    }

    fn vec_u16(&mut self) -> Option<&'a [u8]> {
        let len = self.u16()? as usize;
        self.take(len)
    }
}
