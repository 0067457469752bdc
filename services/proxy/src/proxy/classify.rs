//! Connection classification from the first bytes of a stream.

use tokio::io::AsyncRead;
use tracing::debug;

use super::peek::PeekReader;
use super::sni::{sniff_server_name, SniResult};
use crate::error::ProxyError;

/// Number of bytes inspected to tell HTTP from anything else.
pub const CLASSIFY_PREFIX_LEN: usize = 3;

/// Wire protocol guessed from the first bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// A `GET` or `POST` request line.
    Http,
    /// Anything else; attempted as TLS.
    Opaque,
}

/// Classify a 3-byte prefix.
pub fn classify_prefix(prefix: &[u8]) -> Protocol {
    match prefix {
        b"GET" | b"POS" => Protocol::Http,
        _ => Protocol::Opaque,
    }
}

/// Outcome of connection classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sniff {
    PlaintextHttp,
    TlsWithHostname(String),
    TlsWithoutHostname,
    Unclassifiable,
}

/// Peek at the start of `reader` and decide how the session is handled.
///
/// Nothing is consumed: every peeked byte stays buffered in `reader`.
pub async fn classify<S: AsyncRead + Unpin>(
    reader: &mut PeekReader<S>,
) -> Result<Sniff, ProxyError> {
    let prefix = reader.peek(CLASSIFY_PREFIX_LEN).await?;
    if classify_prefix(prefix) == Protocol::Http {
        return Ok(Sniff::PlaintextHttp);
    }

    let sniff = match sniff_server_name(reader).await? {
        SniResult::Found(hostname) => Sniff::TlsWithHostname(hostname),
        SniResult::NoSni => Sniff::TlsWithoutHostname,
        SniResult::Malformed => {
            debug!("Malformed TLS ClientHello");
            Sniff::TlsWithoutHostname
        }
        SniResult::NotTls => Sniff::Unclassifiable,
    };
    Ok(sniff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tokio_test::io::Builder;

    #[test]
    fn test_classify_known_prefixes() {
        assert_eq!(classify_prefix(b"GET"), Protocol::Http);
        assert_eq!(classify_prefix(b"POS"), Protocol::Http);
        assert_eq!(classify_prefix(b"PUT"), Protocol::Opaque);
        assert_eq!(classify_prefix(b"get"), Protocol::Opaque);
        assert_eq!(classify_prefix(&[0x16, 0x03, 0x01]), Protocol::Opaque);
    }

    proptest! {
        #[test]
        fn prop_classification_is_deterministic(prefix in proptest::array::uniform3(any::<u8>())) {
            let expected = if &prefix == b"GET" || &prefix == b"POS" {
                Protocol::Http
            } else {
                Protocol::Opaque
            };
            prop_assert_eq!(classify_prefix(&prefix), expected);
            prop_assert_eq!(classify_prefix(&prefix), classify_prefix(&prefix));
        }

        #[test]
        fn prop_http_tokens_always_http(suffix in proptest::collection::vec(any::<u8>(), 0..64)) {
            for token in [&b"GET"[..], &b"POST"[..]] {
                let mut stream = token.to_vec();
                stream.extend_from_slice(&suffix);
                prop_assert_eq!(classify_prefix(&stream[..3]), Protocol::Http);
            }
        }
    }

    #[tokio::test]
    async fn test_classify_http() {
        let mock = Builder::new().read(b"GET / HTTP/1.1\r\n").build();
        let mut reader = PeekReader::new(mock);

        assert_eq!(classify(&mut reader).await.unwrap(), Sniff::PlaintextHttp);
        assert_eq!(reader.buffered(), b"GET / HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn test_classify_unclassifiable() {
        let mock = Builder::new().read(b"SSH-2.0-OpenSSH\r\n").build();
        let mut reader = PeekReader::new(mock);

        assert_eq!(classify(&mut reader).await.unwrap(), Sniff::Unclassifiable);
    }

    #[tokio::test]
    async fn test_classify_short_stream() {
        let mock = Builder::new().read(b"\x16").build();
        let mut reader = PeekReader::new(mock);

        let err = classify(&mut reader).await.unwrap_err();
        assert!(matches!(err, ProxyError::PeekShortRead { wanted: 3, got: 1 }));
    }

    #[tokio::test]
    async fn test_classify_handshake_without_client_hello() {
        // Handshake record holding a ServerHello (type 2)
        let mock = Builder::new()
            .read(&[0x16, 0x03, 0x03, 0x00, 0x04, 0x02, 0x00, 0x00, 0x00])
            .build();
        let mut reader = PeekReader::new(mock);

        assert_eq!(classify(&mut reader).await.unwrap(), Sniff::Unclassifiable);
    }
}
