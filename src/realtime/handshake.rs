//! WebSocket upgrade handshake (RFC 6455 §4).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{BufMut, BytesMut};
use sha1::{Digest, Sha1};

use crate::http::headers::Headers;
use crate::http::response::{http_date, SERVER_IDENT};

/// The protocol GUID appended to the client key before hashing.
pub const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Derives the `Sec-WebSocket-Accept` value from the client's
/// `Sec-WebSocket-Key`: `Base64(SHA1(key || GUID))`.
pub fn derive_accept_key(client_key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(client_key.as_bytes());
    sha1.update(GUID.as_bytes());
    BASE64.encode(sha1.finalize())
}

/// Serializes the `101 Switching Protocols` response block.
///
/// Handler-supplied headers are appended after the fixed upgrade headers.
pub(crate) fn response_bytes(accept_key: &str, extra_headers: &Headers) -> BytesMut {
    let mut buf = BytesMut::with_capacity(256 + extra_headers.len() * 64);
    buf.put(&b"HTTP/1.1 101 Switching Protocols\r\n"[..]);
    buf.put(format!("Server: {SERVER_IDENT}\r\n").as_bytes());
    buf.put(format!("Date: {}\r\n", http_date()).as_bytes());
    buf.put(&b"Connection: Upgrade\r\n"[..]);
    buf.put(&b"Upgrade: websocket\r\n"[..]);
    buf.put(format!("Sec-WebSocket-Accept: {accept_key}\r\n").as_bytes());
    for (name, value) in extra_headers.iter() {
        buf.put(format!("{name}: {value}\r\n").as_bytes());
    }
    buf.put(&b"\r\n"[..]);
    buf
}
