//! Bidirectional byte splicing between client and origin.
//!
//! Each direction runs as its own task. When a direction's source reaches end
//! of stream (or errors), that task shuts down the write half of its
//! destination and exits; the opposite direction keeps draining until it ends
//! on its own. The tunnel is finished only when both tasks have joined.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::peek::PeekReader;
use crate::error::ProxyError;

/// Per-read buffer size for each direction.
const COPY_BUF_LEN: usize = 8192;

/// Bytes relayed in each direction over the life of a tunnel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TunnelStats {
    pub client_to_origin: u64,
    pub origin_to_client: u64,
}

/// Splice a classified client connection to its origin.
///
/// Bytes still buffered in `client` from classification are written to the
/// origin before anything else read from the client socket.
pub async fn tunnel(
    client: PeekReader<TcpStream>,
    origin: TcpStream,
    idle_timeout: Option<Duration>,
) -> TunnelStats {
    let (client, replay) = client.into_parts();
    debug!(replay_bytes = replay.len(), "Replaying peeked bytes to origin");

    let (client_read, client_write) = client.into_split();
    let client_read = PeekReader::from_parts(client_read, replay);
    let (origin_read, origin_write) = origin.into_split();

    splice(
        client_read,
        client_write,
        origin_read,
        origin_write,
        idle_timeout,
    )
    .await
}

/// Run both copy directions concurrently and wait for both to finish.
pub async fn splice<CR, CW, OR, OW>(
    client_read: CR,
    client_write: CW,
    origin_read: OR,
    origin_write: OW,
    idle_timeout: Option<Duration>,
) -> TunnelStats
where
    CR: AsyncRead + Unpin + Send + 'static,
    CW: AsyncWrite + Unpin + Send + 'static,
    OR: AsyncRead + Unpin + Send + 'static,
    OW: AsyncWrite + Unpin + Send + 'static,
{
    let upstream = tokio::spawn(pump(
        client_read,
        origin_write,
        idle_timeout,
        "client_to_origin",
    ));
    let downstream = tokio::spawn(pump(
        origin_read,
        client_write,
        idle_timeout,
        "origin_to_client",
    ));

    let (upstream, downstream) = tokio::join!(upstream, downstream);

    TunnelStats {
        client_to_origin: upstream.unwrap_or_default(),
        origin_to_client: downstream.unwrap_or_default(),
    }
}

/// Copy `src` into `dst` until `src` ends, then half-close `dst`.
///
/// Returns the number of bytes written to `dst`.
async fn pump<R, W>(
    mut src: R,
    mut dst: W,
    idle_timeout: Option<Duration>,
    direction: &'static str,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; COPY_BUF_LEN];

    let result: Result<(), ProxyError> = async {
        loop {
            let n = read_with_idle(&mut src, &mut buf, idle_timeout)
                .await
                .map_err(ProxyError::RelayIo)?;
            if n == 0 {
                break;
            }
            dst.write_all(&buf[..n])
                .await
                .map_err(ProxyError::RelayIo)?;
            total += n as u64;
        }
        Ok(())
    }
    .await;

    if let Err(e) = result {
        debug!(
            direction,
            bytes = total,
            error = %e,
            reason = e.reason_code(),
            "Relay direction failed"
        );
    }

    if let Err(e) = dst.shutdown().await {
        debug!(direction, error = %e, "Half-close failed");
    }

    debug!(direction, bytes = total, "Relay direction finished");
    total
}

async fn read_with_idle<R: AsyncRead + Unpin>(
    src: &mut R,
    buf: &mut [u8],
    idle_timeout: Option<Duration>,
) -> io::Result<usize> {
    match idle_timeout {
        Some(idle) => match tokio::time::timeout(idle, src.read(buf)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
        },
        None => src.read(buf).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::io::duplex;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_replay_then_stream_is_exact() {
        let (mut test_client, proxy_client) = duplex(4096);
        let (proxy_origin, mut test_origin) = duplex(4096);

        let (client_read, client_write) = tokio::io::split(proxy_client);
        let client_read =
            PeekReader::from_parts(client_read, Bytes::from_static(b"\x16\x03\x01hello"));
        let (origin_read, origin_write) = tokio::io::split(proxy_origin);

        let handle = tokio::spawn(splice(
            client_read,
            client_write,
            origin_read,
            origin_write,
            None,
        ));

        test_client.write_all(b" world").await.unwrap();
        test_client.shutdown().await.unwrap();

        let mut at_origin = Vec::new();
        test_origin.read_to_end(&mut at_origin).await.unwrap();
        assert_eq!(at_origin, b"\x16\x03\x01hello world");

        test_origin.write_all(b"reply").await.unwrap();
        test_origin.shutdown().await.unwrap();

        let mut at_client = Vec::new();
        test_client.read_to_end(&mut at_client).await.unwrap();
        assert_eq!(at_client, b"reply");

        let stats = handle.await.unwrap();
        assert_eq!(stats.client_to_origin, 14);
        assert_eq!(stats.origin_to_client, 5);
    }

    #[tokio::test]
    async fn test_half_close_keeps_other_direction_open() {
        let (mut test_client, proxy_client) = duplex(4096);
        let (proxy_origin, mut test_origin) = duplex(4096);

        let (client_read, client_write) = tokio::io::split(proxy_client);
        let (origin_read, origin_write) = tokio::io::split(proxy_origin);

        let handle = tokio::spawn(splice(
            client_read,
            client_write,
            origin_read,
            origin_write,
            None,
        ));

        test_client.write_all(b"request").await.unwrap();
        test_client.shutdown().await.unwrap();

        // Origin sees the client's end of stream...
        let mut at_origin = Vec::new();
        test_origin.read_to_end(&mut at_origin).await.unwrap();
        assert_eq!(at_origin, b"request");

        // ...but the tunnel stays up for the response
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        test_origin.write_all(b"late response").await.unwrap();
        let mut buf = [0u8; 13];
        test_client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"late response");

        test_origin.shutdown().await.unwrap();
        let stats = handle.await.unwrap();
        assert_eq!(stats.client_to_origin, 7);
        assert_eq!(stats.origin_to_client, 13);
    }

    #[tokio::test]
    async fn test_read_error_ends_only_that_direction() {
        let client_read = Builder::new()
            .read(b"abc")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let (proxy_origin, mut test_origin) = duplex(4096);
        let (origin_read, origin_write) = tokio::io::split(proxy_origin);

        let handle = tokio::spawn(splice(
            client_read,
            tokio::io::sink(),
            origin_read,
            origin_write,
            None,
        ));

        // The failed direction still half-closes the origin
        let mut at_origin = Vec::new();
        test_origin.read_to_end(&mut at_origin).await.unwrap();
        assert_eq!(at_origin, b"abc");

        test_origin.write_all(b"bye").await.unwrap();
        test_origin.shutdown().await.unwrap();

        let stats = handle.await.unwrap();
        assert_eq!(stats.client_to_origin, 3);
        assert_eq!(stats.origin_to_client, 3);
    }

    #[tokio::test]
    async fn test_idle_timeout_ends_direction() {
        let (_test_client, proxy_client) = duplex(64);
        let (proxy_origin, _test_origin) = duplex(64);

        let (client_read, client_write) = tokio::io::split(proxy_client);
        let (origin_read, origin_write) = tokio::io::split(proxy_origin);

        let stats = tokio::time::timeout(
            Duration::from_secs(2),
            splice(
                client_read,
                client_write,
                origin_read,
                origin_write,
                Some(Duration::from_millis(50)),
            ),
        )
        .await
        .expect("idle tunnel should close");

        assert_eq!(stats, TunnelStats::default());
    }
}
