//! HTTP/1.1 response type and wire serialization.
//!
//! The header block is emitted in a fixed order: status line, `Server`,
//! `Date`, `Connection`, `Content-Length`, then handler-supplied headers in
//! insertion order, then the blank separator line.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::Utc;

use super::{Headers, StatusCode};

/// The `Server` header value this library identifies itself with.
pub const SERVER_IDENT: &str = "Swell (Rust)";

/// Returns the current time formatted for the `Date` header (RFC 1123, GMT).
pub(crate) fn http_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// An HTTP/1.1 response, populated by the handler and serialized by the
/// connection's send operation.
///
/// The slot is zeroed before each request on a persistent connection.
///
/// # Examples
///
/// ```
/// use swell::http::{Response, StatusCode};
///
/// let mut response = Response::new();
/// response.status = StatusCode::Ok;
/// response.headers.insert("Content-Type", "text/plain");
/// response.set_body("Halo");
/// assert_eq!(response.body(), b"Halo");
/// ```
#[derive(Debug)]
pub struct Response {
    /// Status code sent on the status line.
    pub status: StatusCode,
    /// Handler-supplied headers, emitted after the fixed block.
    pub headers: Headers,
    body: Bytes,
}

impl Response {
    /// Creates an empty `200 OK` response.
    pub fn new() -> Self {
        Self {
            status: StatusCode::Ok,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Sets the response body.
    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }

    /// Builder-style status setter.
    #[must_use]
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// Builder-style header append. Multiple calls with the same name are
    /// additive.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Builder-style body setter.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns the response body bytes.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Zeroes the slot for the next request on the connection.
    pub(crate) fn clear(&mut self) {
        self.status = StatusCode::Ok;
        self.headers.clear();
        self.body = Bytes::new();
    }

    /// Serializes the response for the wire.
    ///
    /// `keep_alive` selects the `Connection` header value. For a HEAD
    /// request (`head_only`) the body is omitted and no `Content-Length` is
    /// synthesized; otherwise `Content-Length` is always present, computed
    /// from the body unless the handler set its own.
    pub(crate) fn to_bytes(&self, keep_alive: bool, head_only: bool) -> BytesMut {
        let mut buf = BytesMut::with_capacity(256 + self.headers.len() * 64 + self.body.len());

        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );
        buf.put(format!("Server: {SERVER_IDENT}\r\n").as_bytes());
        buf.put(format!("Date: {}\r\n", http_date()).as_bytes());
        buf.put(
            format!(
                "Connection: {}\r\n",
                if keep_alive { "keep-alive" } else { "close" }
            )
            .as_bytes(),
        );
        if !head_only && !self.headers.contains("content-length") {
            buf.put(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        for (name, value) in self.headers.iter() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }
        buf.put(&b"\r\n"[..]);

        if !head_only {
            buf.put(self.body.as_ref());
        }
        buf
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_string(bytes: BytesMut) -> String {
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn simple_ok_response() {
        let mut r = Response::new();
        r.set_body("Hello");
        let s = to_string(r.to_bytes(false, false));
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("Server: Swell (Rust)\r\n"));
        assert!(s.contains("Date: "));
        assert!(s.contains("Connection: close\r\n"));
        assert!(s.contains("Content-Length: 5\r\n"));
        assert!(s.ends_with("\r\n\r\nHello"));
    }

    #[test]
    fn fixed_header_order() {
        let mut r = Response::new();
        r.headers.insert("X-First", "1");
        r.headers.insert("X-Second", "2");
        let s = to_string(r.to_bytes(true, false));
        let server = s.find("Server: ").unwrap();
        let date = s.find("Date: ").unwrap();
        let conn = s.find("Connection: keep-alive").unwrap();
        let len = s.find("Content-Length: ").unwrap();
        let first = s.find("X-First: 1").unwrap();
        let second = s.find("X-Second: 2").unwrap();
        assert!(server < date && date < conn && conn < len);
        assert!(len < first && first < second);
    }

    #[test]
    fn handler_content_length_respected() {
        let mut r = Response::new();
        r.headers.insert("Content-Length", "99");
        r.set_body("x");
        let s = to_string(r.to_bytes(false, false));
        assert_eq!(s.matches("Content-Length:").count(), 1);
        assert!(s.contains("Content-Length: 99\r\n"));
    }

    #[test]
    fn head_omits_body_and_length() {
        let mut r = Response::new();
        r.set_body("payload");
        let s = to_string(r.to_bytes(false, true));
        assert!(!s.contains("Content-Length"));
        assert!(s.ends_with("\r\n\r\n"));
        assert!(!s.contains("payload"));
    }

    #[test]
    fn date_is_rfc1123_gmt() {
        let date = http_date();
        assert!(date.ends_with(" GMT"));
        // e.g. "Sun, 02 Aug 2026 12:00:00 GMT"
        assert_eq!(date.len(), 29);
        assert_eq!(&date[3..5], ", ");
    }

    #[test]
    fn builder_helpers() {
        let r = Response::new()
            .with_status(StatusCode::NotFound)
            .with_header("X-Request-Id", "abc-123")
            .with_body("Not Found");
        let s = to_string(r.to_bytes(false, false));
        assert!(s.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(s.contains("X-Request-Id: abc-123\r\n"));
        assert!(s.ends_with("Not Found"));
    }

    #[test]
    fn error_status_line() {
        let mut r = Response::new();
        r.status = StatusCode::LengthRequired;
        let s = to_string(r.to_bytes(false, false));
        assert!(s.starts_with("HTTP/1.1 411 Length Required\r\n"));
    }
}
