//! HTTP/1.1 request type and incremental head parsing.
//!
//! The head is read line by line off the wire: one request line of exactly
//! three tokens, then header lines until a blank line. Anything outside that
//! shape invalidates the request and the connection is dropped without a
//! response.

use std::io;

use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use url::Url;

use super::{Body, Headers, Method};
use crate::server::wire::{WireError, WireStream};

/// Errors produced when consuming a request body.
#[derive(Debug, Error)]
pub enum JsonError {
    /// The spooled body could not be read back.
    #[error("failed to read request body: {0}")]
    Io(#[from] io::Error),

    /// The body was not valid JSON for the target type.
    #[error("failed to deserialize request body: {0}")]
    Parse(#[from] serde_json::Error),
}

/// A parsed HTTP/1.1 request.
///
/// Constructed fresh for each request on a connection. The body, if any, has
/// been spooled to a temporary file by the time the handler sees the request;
/// the spool file is deleted when the request slot is cleared.
#[derive(Debug, Default)]
pub struct Request {
    version: String,
    method: Option<Method>,
    url: Option<Url>,
    headers: Headers,
    body: Body,
}

impl Request {
    /// Returns the HTTP method, or `None` before the first request has been
    /// parsed on the connection.
    pub fn method(&self) -> Option<Method> {
        self.method
    }

    /// Returns the HTTP version string from the request line, e.g. `HTTP/1.1`.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Returns the request URL.
    ///
    /// The scheme reflects the transport (`http`/`https`, or `ws`/`wss` for
    /// an upgrade request) and the authority comes from the `Host` header,
    /// falling back to the listener's bind address.
    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    /// Returns the request path, or `/` if no request has been parsed.
    pub fn path(&self) -> &str {
        self.url.as_ref().map(Url::path).unwrap_or("/")
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.url.as_ref().and_then(Url::query)
    }

    /// Returns a decoded query parameter value by key.
    pub fn query_param(&self, key: &str) -> Option<String> {
        self.url.as_ref().and_then(|url| {
            url.query_pairs()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.into_owned())
        })
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the request body.
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Reads the full body contents into memory.
    pub async fn body_bytes(&self) -> io::Result<bytes::Bytes> {
        self.body.bytes().await
    }

    /// Deserializes the body as JSON.
    pub async fn json<T: DeserializeOwned>(&self) -> Result<T, JsonError> {
        let bytes = self.body.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Returns the value of the `Content-Length` header parsed as a `u64`.
    pub fn content_length(&self) -> Option<u64> {
        self.headers.get("content-length")?.trim().parse().ok()
    }

    /// Returns `true` if the request's `Connection` header asks for reuse:
    /// it lists `keep-alive` and does not list `close`.
    pub fn wants_keep_alive(&self) -> bool {
        self.headers.contains_token("connection", "keep-alive")
            && !self.headers.contains_token("connection", "close")
    }

    pub(crate) fn set_body(&mut self, body: Body) {
        self.body = body;
    }

    /// Resets the slot for the next request on the connection. Dropping the
    /// old body deletes its spool file.
    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Result of reading one request head off the wire.
#[derive(Debug)]
pub(crate) enum HeadOutcome {
    /// A plain request; the body (if the method carries one) has not been
    /// read yet.
    Request(Request),
    /// A `GET` with `Upgrade: websocket`; divert to the upgrade path.
    Upgrade(Request),
    /// The peer is done: EOF at a request boundary or a blank line.
    EndOfStream,
    /// The head was malformed or the method unrecognized; drop the
    /// connection without a response.
    Invalid,
}

/// Reads and parses one request head.
///
/// `default_host` is the listener's bind address, used as the URL authority
/// until a `Host` header overrides it. `secure` selects the URL scheme.
pub(crate) async fn read_head<S>(
    wire: &mut WireStream<S>,
    default_host: &str,
    secure: bool,
) -> Result<HeadOutcome, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let line = match wire.read_line().await {
        Ok(line) => line,
        Err(WireError::ConnectionClosed) => return Ok(HeadOutcome::EndOfStream),
        Err(err) => return Err(err),
    };
    if line.trim().is_empty() {
        return Ok(HeadOutcome::EndOfStream);
    }

    let Some((method, target, version)) = parse_request_line(&line) else {
        return Ok(HeadOutcome::Invalid);
    };

    let mut headers = Headers::new();
    loop {
        let line = wire.read_line().await?;
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Ok(HeadOutcome::Invalid);
        };
        headers.insert(name.trim(), value.trim());
    }

    let upgrade = method == Method::Get
        && headers
            .get("upgrade")
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));

    let host = headers.get("host").unwrap_or(default_host);
    let Some(mut url) = build_url(&target, host, secure) else {
        return Ok(HeadOutcome::Invalid);
    };
    if upgrade {
        let scheme = if secure { "wss" } else { "ws" };
        if url.set_scheme(scheme).is_err() {
            return Ok(HeadOutcome::Invalid);
        }
    }

    let request = Request {
        version,
        method: Some(method),
        url: Some(url),
        headers,
        body: Body::Empty,
    };
    Ok(if upgrade {
        HeadOutcome::Upgrade(request)
    } else {
        HeadOutcome::Request(request)
    })
}

/// Splits a request line into method, target, and version.
///
/// Exactly three tokens are required; the version must carry an `HTTP/`
/// prefix. Returns `None` on any violation, including an unknown method.
fn parse_request_line(line: &str) -> Option<(Method, String, String)> {
    let mut tokens = line.split_whitespace();
    let method = tokens.next()?;
    let target = tokens.next()?;
    let version = tokens.next()?;
    if tokens.next().is_some() || !version.starts_with("HTTP/") {
        return None;
    }
    let method: Method = method.parse().ok()?;
    Some((method, target.to_owned(), version.to_owned()))
}

/// Builds the request URL from the target and effective host.
///
/// Origin-form targets are joined onto the transport scheme and host;
/// absolute-form targets are parsed as-is.
fn build_url(target: &str, host: &str, secure: bool) -> Option<Url> {
    if target.starts_with('/') {
        let scheme = if secure { "https" } else { "http" };
        Url::parse(&format!("{scheme}://{host}{target}")).ok()
    } else {
        Url::parse(target).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    async fn wire_with(input: &[u8]) -> WireStream<DuplexStream> {
        let (mut client, server) = duplex(64 * 1024);
        client.write_all(input).await.unwrap();
        drop(client);
        WireStream::new(server, 1024)
    }

    async fn head(input: &[u8]) -> HeadOutcome {
        let mut wire = wire_with(input).await;
        read_head(&mut wire, "127.0.0.1:8000", false).await.unwrap()
    }

    #[tokio::test]
    async fn parses_simple_get() {
        let outcome = head(b"GET /hello?name=world HTTP/1.1\r\nHost: example.com\r\n\r\n").await;
        let HeadOutcome::Request(req) = outcome else {
            panic!("expected request, got {outcome:?}");
        };
        assert_eq!(req.method(), Some(Method::Get));
        assert_eq!(req.version(), "HTTP/1.1");
        assert_eq!(req.path(), "/hello");
        assert_eq!(req.query_string(), Some("name=world"));
        assert_eq!(req.query_param("name").as_deref(), Some("world"));
        assert_eq!(req.url().unwrap().host_str(), Some("example.com"));
        assert_eq!(req.headers().get("host"), Some("example.com"));
    }

    #[tokio::test]
    async fn host_falls_back_to_bind_address() {
        let outcome = head(b"GET / HTTP/1.1\r\n\r\n").await;
        let HeadOutcome::Request(req) = outcome else {
            panic!("expected request");
        };
        assert_eq!(req.url().unwrap().host_str(), Some("127.0.0.1"));
        assert_eq!(req.url().unwrap().port(), Some(8000));
    }

    #[tokio::test]
    async fn repeated_headers_accumulate() {
        let outcome =
            head(b"GET / HTTP/1.1\r\nX-Tag: one\r\nX-Tag: two\r\nHost: h\r\n\r\n").await;
        let HeadOutcome::Request(req) = outcome else {
            panic!("expected request");
        };
        let tags: Vec<_> = req.headers().get_all("x-tag").collect();
        assert_eq!(tags, vec!["one", "two"]);
        // Last-inserted wins on plain lookup.
        assert_eq!(req.headers().get("x-tag"), Some("two"));
    }

    #[tokio::test]
    async fn detects_websocket_upgrade() {
        let outcome = head(
            b"GET /chat HTTP/1.1\r\nHost: h\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
        )
        .await;
        let HeadOutcome::Upgrade(req) = outcome else {
            panic!("expected upgrade, got {outcome:?}");
        };
        assert_eq!(req.url().unwrap().scheme(), "ws");
    }

    #[tokio::test]
    async fn upgrade_requires_get() {
        let outcome =
            head(b"POST /chat HTTP/1.1\r\nHost: h\r\nUpgrade: websocket\r\n\r\n").await;
        assert!(matches!(outcome, HeadOutcome::Request(_)));
    }

    #[tokio::test]
    async fn unknown_method_is_invalid() {
        assert!(matches!(
            head(b"BREW / HTTP/1.1\r\nHost: h\r\n\r\n").await,
            HeadOutcome::Invalid
        ));
    }

    #[tokio::test]
    async fn wrong_token_count_is_invalid() {
        assert!(matches!(
            head(b"GET / extra HTTP/1.1\r\n\r\n").await,
            HeadOutcome::Invalid
        ));
        assert!(matches!(head(b"GET /\r\n\r\n").await, HeadOutcome::Invalid));
    }

    #[tokio::test]
    async fn header_without_colon_is_invalid() {
        assert!(matches!(
            head(b"GET / HTTP/1.1\r\nbogus header line\r\n\r\n").await,
            HeadOutcome::Invalid
        ));
    }

    #[tokio::test]
    async fn blank_line_ends_stream() {
        assert!(matches!(head(b"\r\n").await, HeadOutcome::EndOfStream));
    }

    #[tokio::test]
    async fn immediate_eof_ends_stream() {
        assert!(matches!(head(b"").await, HeadOutcome::EndOfStream));
    }

    #[tokio::test]
    async fn content_length_parsed() {
        let outcome =
            head(b"POST /x HTTP/1.1\r\nHost: h\r\nContent-Length: 3\r\n\r\n").await;
        let HeadOutcome::Request(req) = outcome else {
            panic!("expected request");
        };
        assert_eq!(req.content_length(), Some(3));
    }

    #[tokio::test]
    async fn keep_alive_tokens() {
        let outcome = head(
            b"GET / HTTP/1.1\r\nHost: h\r\nConnection: Keep-Alive\r\n\r\n",
        )
        .await;
        let HeadOutcome::Request(req) = outcome else {
            panic!("expected request");
        };
        assert!(req.wants_keep_alive());

        let outcome = head(
            b"GET / HTTP/1.1\r\nHost: h\r\nConnection: keep-alive, close\r\n\r\n",
        )
        .await;
        let HeadOutcome::Request(req) = outcome else {
            panic!("expected request");
        };
        assert!(!req.wants_keep_alive());
    }
}
