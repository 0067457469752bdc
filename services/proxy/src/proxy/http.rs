//! Plaintext HTTP forwarding.
//!
//! Used only when classification sees a `GET`/`POST` request line. The request
//! is parsed out of the peeking reader, re-issued through `reqwest` and the
//! upstream response is streamed back over the client socket, which is then
//! closed. No connection is reused across requests.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::peek::PeekReader;

/// Largest request head accepted, in bytes.
pub const MAX_HEAD_LEN: usize = 64 * 1024;

/// Largest request body accepted, in bytes.
pub const MAX_BODY_LEN: usize = 16 * 1024 * 1024;

const MAX_HEADERS: usize = 64;

/// Headers that describe the client hop rather than the request.
const HOP_HEADERS: &[&str] = &[
    "connection",
    "content-length",
    "host",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
];

/// Failures on the HTTP path. Each maps to the status sent to the client.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("request head exceeds {} bytes", MAX_HEAD_LEN)]
    HeadTooLarge,

    #[error("request body exceeds {} bytes", MAX_BODY_LEN)]
    BodyTooLarge,

    #[error("connection closed before request was complete")]
    Incomplete,

    #[error("missing Host header")]
    MissingHost,

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl RequestError {
    /// Status code returned to the client.
    pub fn status(&self) -> StatusCode {
        match self {
            RequestError::HeadTooLarge => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            RequestError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            RequestError::Upstream(_) => StatusCode::BAD_GATEWAY,
            RequestError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RequestError::Malformed(_) | RequestError::Incomplete | RequestError::MissingHost => {
                StatusCode::BAD_REQUEST
            }
        }
    }

    /// Short stable code for access logs.
    pub fn code(&self) -> &'static str {
        match self {
            RequestError::Malformed(_) => "malformed_request",
            RequestError::HeadTooLarge => "head_too_large",
            RequestError::BodyTooLarge => "body_too_large",
            RequestError::Incomplete => "incomplete_request",
            RequestError::MissingHost => "missing_host",
            RequestError::Upstream(_) => "upstream_failed",
            RequestError::Io(_) => "io_error",
        }
    }
}

/// A fully read HTTP/1.x request.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Vec<u8>,
}

impl ParsedRequest {
    /// Value of the first header named `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    pub fn host(&self) -> Option<&str> {
        self.header("host")
            .and_then(|v| std::str::from_utf8(v).ok())
            .map(str::trim)
            .filter(|h| !h.is_empty())
    }

    /// Absolute URL to request: the URI itself when absolute, otherwise the
    /// URI resolved against `Host`.
    pub fn target_url(&self) -> Result<String, RequestError> {
        let lower = self.uri.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            return Ok(self.uri.clone());
        }
        let host = self.host().ok_or(RequestError::MissingHost)?;
        Ok(format!("http://{}{}", host, self.uri))
    }
}

/// Request line and headers, before the body is read.
struct RequestHead {
    len: usize,
    method: String,
    uri: String,
    headers: Vec<(String, Vec<u8>)>,
}

/// Read one complete request from `reader`, consuming exactly its bytes.
///
/// Anything the client sent after the request stays buffered.
pub async fn read_request<S: AsyncRead + Unpin>(
    reader: &mut PeekReader<S>,
) -> Result<ParsedRequest, RequestError> {
    let head = loop {
        if let Some(head) = parse_head(reader.buffered())? {
            break head;
        }
        if reader.buffered().len() >= MAX_HEAD_LEN {
            return Err(RequestError::HeadTooLarge);
        }
        fill_more(reader).await?;
    };
    reader.consume(head.len);

    let mut request = ParsedRequest {
        method: head.method,
        uri: head.uri,
        headers: head.headers,
        body: Vec::new(),
    };

    let chunked = request
        .header("transfer-encoding")
        .map(|v| String::from_utf8_lossy(v).to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);

    if chunked {
        request.body = read_chunked_body(reader).await?;
    } else if let Some(value) = request.header("content-length") {
        let len: usize = std::str::from_utf8(value)
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| RequestError::Malformed("invalid Content-Length".into()))?;
        if len > MAX_BODY_LEN {
            return Err(RequestError::BodyTooLarge);
        }
        let body = reader
            .peek(len)
            .await
            .map_err(|_| RequestError::Incomplete)?
            .to_vec();
        reader.consume(len);
        request.body = body;
    }

    Ok(request)
}

fn parse_head(buf: &[u8]) -> Result<Option<RequestHead>, RequestError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => Ok(Some(RequestHead {
            len,
            method: req.method.unwrap_or("").to_string(),
            uri: req.path.unwrap_or("").to_string(),
            headers: req
                .headers
                .iter()
                .map(|h| (h.name.to_string(), h.value.to_vec()))
                .collect(),
        })),
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(RequestError::Malformed(e.to_string())),
    }
}

async fn read_chunked_body<S: AsyncRead + Unpin>(
    reader: &mut PeekReader<S>,
) -> Result<Vec<u8>, RequestError> {
    let mut body = Vec::new();

    loop {
        let (consumed, size) = loop {
            match httparse::parse_chunk_size(reader.buffered()) {
                Ok(httparse::Status::Complete(parsed)) => break parsed,
                Ok(httparse::Status::Partial) => fill_more(reader).await?,
                Err(_) => return Err(RequestError::Malformed("invalid chunk size".into())),
            }
        };
        reader.consume(consumed);

        if size == 0 {
            skip_trailers(reader).await?;
            return Ok(body);
        }

        let size = usize::try_from(size).map_err(|_| RequestError::BodyTooLarge)?;
        if size > MAX_BODY_LEN - body.len() {
            return Err(RequestError::BodyTooLarge);
        }

        let chunk = reader
            .peek(size + 2)
            .await
            .map_err(|_| RequestError::Incomplete)?;
        if &chunk[size..] != b"\r\n" {
            return Err(RequestError::Malformed("chunk missing CRLF".into()));
        }
        body.extend_from_slice(&chunk[..size]);
        reader.consume(size + 2);
    }
}

/// Consume trailer lines up to and including the terminating empty line.
async fn skip_trailers<S: AsyncRead + Unpin>(
    reader: &mut PeekReader<S>,
) -> Result<(), RequestError> {
    loop {
        match reader.buffered().windows(2).position(|w| w == b"\r\n") {
            Some(0) => {
                reader.consume(2);
                return Ok(());
            }
            Some(line_len) => reader.consume(line_len + 2),
            None => {
                if reader.buffered().len() >= MAX_HEAD_LEN {
                    return Err(RequestError::HeadTooLarge);
                }
                fill_more(reader).await?;
            }
        }
    }
}

async fn fill_more<S: AsyncRead + Unpin>(reader: &mut PeekReader<S>) -> Result<(), RequestError> {
    if reader.fill().await? == 0 {
        return Err(RequestError::Incomplete);
    }
    Ok(())
}

/// Upstream body, pulled chunk by chunk while it is written to the client.
pub type BodyStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Response received from the origin. Only the head is buffered.
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BodyStream,
    /// Response to a HEAD request (or a status that never carries a body).
    pub bodiless: bool,
}

impl fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("bodiless", &self.bodiless)
            .finish_non_exhaustive()
    }
}

/// Re-issues parsed requests through a generic HTTP client.
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    client: reqwest::Client,
}

impl HttpForwarder {
    /// Build a forwarder that never follows redirects or keeps idle
    /// connections.
    pub fn new(connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(0)
            .no_proxy()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client })
    }

    /// Send `request` to its target and return the response head with its
    /// body still unread.
    pub async fn forward(&self, request: ParsedRequest) -> Result<UpstreamResponse, RequestError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|e| RequestError::Malformed(e.to_string()))?;
        let url = request.target_url()?;

        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            if HOP_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
                continue;
            }
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| RequestError::Malformed(e.to_string()))?;
            let value = HeaderValue::from_bytes(value)
                .map_err(|e| RequestError::Malformed(e.to_string()))?;
            headers.append(name, value);
        }

        debug!(method = %method, url = %url, body_len = request.body.len(), "Forwarding request");

        let bodiless_request = method == Method::HEAD;
        let mut builder = self.client.request(method, &url).headers(headers);
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| RequestError::Upstream(e.to_string()))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body: BodyStream = Box::pin(response.bytes_stream().map_err(io::Error::other));

        Ok(UpstreamResponse {
            bodiless: bodiless_request
                || status.is_informational()
                || status == StatusCode::NO_CONTENT
                || status == StatusCode::NOT_MODIFIED,
            status,
            headers,
            body,
        })
    }
}

/// Write `response` as an HTTP/1.1 message that closes the connection.
///
/// The body is copied chunk by chunk. An upstream `content-length` is passed
/// on; without one the body is delimited by closing the connection.
/// Returns the number of body bytes written.
pub async fn write_response<W: AsyncWrite + Unpin>(
    out: &mut W,
    response: UpstreamResponse,
) -> io::Result<u64> {
    let UpstreamResponse {
        status,
        headers,
        mut body,
        bodiless,
    } = response;

    let mut head = status_line(status).into_bytes();
    for (name, value) in headers.iter() {
        let keep_length = *name == reqwest::header::CONTENT_LENGTH;
        if HOP_HEADERS.contains(&name.as_str()) && !keep_length {
            continue;
        }
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"connection: close\r\n\r\n");
    out.write_all(&head).await?;

    let mut written = 0u64;
    if !bodiless {
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
    }
    out.flush().await?;
    Ok(written)
}

/// Write a plain-text error response with `reason` as the body.
pub async fn write_error<W: AsyncWrite + Unpin>(
    out: &mut W,
    status: StatusCode,
    reason: &str,
) -> io::Result<()> {
    let body = format!("{}\n", reason);
    let message = format!(
        "{}content-type: text/plain; charset=utf-8\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        status_line(status),
        body.len(),
        body
    );
    out.write_all(message.as_bytes()).await?;
    out.flush().await
}

fn status_line(status: StatusCode) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    )
}
