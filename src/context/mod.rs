//! Per-connection request/response context.
//!
//! One [`HttpContext`] exists per accepted connection. It owns the transport
//! and the current request/response pair, and is handed to the user callback
//! for every request (and, after an upgrade, for every inbound WebSocket
//! data frame). The callback populates the response and calls
//! [`send`](HttpContext::send) exactly once, then returns the context so the
//! connection can continue.

use std::io;
use std::sync::Arc;

use tracing::warn;

use crate::http::{Method, Request, Response};
use crate::realtime::{Frame, FrameError, WebSocket};
use crate::server::stream::MaybeTlsStream;
use crate::server::wire::WireStream;
use crate::server::ServerConfig;

/// The request/response context for one connection.
///
/// Between keep-alive requests the request and response slots are cleared;
/// dropping the old request deletes its body spool file.
pub struct HttpContext {
    wire: WireStream<MaybeTlsStream>,
    /// The current request. Rebuilt for each request on the connection.
    pub request: Request,
    /// The response under construction. Zeroed before each request.
    pub response: Response,
    /// WebSocket state, present from upgrade detection until teardown.
    pub websocket: Option<WebSocket>,
    /// Cleared by the server or handler to force the connection closed
    /// after the current response.
    pub keep_alive: bool,
    is_secure: bool,
    response_sent: bool,
    config: Arc<ServerConfig>,
}

impl HttpContext {
    pub(crate) fn new(stream: MaybeTlsStream, config: Arc<ServerConfig>) -> Self {
        let is_secure = stream.is_secure();
        Self {
            wire: WireStream::new(stream, config.read_body_buffer),
            request: Request::default(),
            response: Response::new(),
            websocket: None,
            keep_alive: true,
            is_secure,
            response_sent: false,
            config,
        }
    }

    /// Returns `true` if the connection arrived over TLS.
    ///
    /// Reflects the transport at accept time; immutable for the connection's
    /// lifetime.
    pub fn is_secure(&self) -> bool {
        self.is_secure
    }

    /// Writes the response to the peer.
    ///
    /// The connection is reused only when the server has keep-alive enabled,
    /// the context still allows it, and the request asked for it
    /// (`Connection` lists `keep-alive` and not `close`); otherwise the
    /// stream is closed after the write. For a HEAD request only the header
    /// block is written.
    ///
    /// Must be called exactly once per request; extra calls are ignored with
    /// a warning.
    pub async fn send(&mut self) -> io::Result<()> {
        if self.response_sent {
            warn!("send called more than once for this request; ignoring");
            return Ok(());
        }
        let reuse =
            self.config.keep_alive && self.keep_alive && self.request.wants_keep_alive();
        let head_only = self.request.method() == Some(Method::Head);
        let bytes = self.response.to_bytes(reuse, head_only);
        self.wire.write_all(&bytes).await?;
        self.wire.flush().await?;
        self.response_sent = true;
        self.keep_alive = reuse;
        if !reuse {
            let _ = self.wire.shutdown().await;
        }
        Ok(())
    }

    /// Writes a WebSocket frame to the peer immediately.
    ///
    /// Frames are written to completion, so concurrent outbound frames on
    /// the same connection never interleave.
    pub async fn ws_send(&mut self, frame: Frame) -> Result<(), FrameError> {
        frame.write_to(self.wire.inner_mut()).await
    }

    /// Sends a Ping carrying the connection's nonce. The peer's Pong echoing
    /// the nonce is absorbed by the frame loop.
    pub async fn ws_ping(&mut self) -> Result<(), FrameError> {
        let Some(nonce) = self
            .websocket
            .as_ref()
            .map(|ws| bytes::Bytes::copy_from_slice(ws.nonce()))
        else {
            return Ok(());
        };
        Frame::ping(nonce).write_to(self.wire.inner_mut()).await
    }

    pub(crate) fn wire(&mut self) -> &mut WireStream<MaybeTlsStream> {
        &mut self.wire
    }

    pub(crate) fn response_sent(&self) -> bool {
        self.response_sent
    }

    pub(crate) fn trace(&self) -> bool {
        self.config.trace
    }

    pub(crate) fn max_body_length(&self) -> u64 {
        self.config.max_body_length
    }

    /// Clears transient state ahead of the next request on this connection.
    /// Dropping the old request releases its spooled body file.
    pub(crate) fn reset(&mut self) {
        self.request.clear();
        self.response.clear();
        self.response_sent = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn send_writes_close_response_by_default() {
        let (mut client, server) = pair().await;
        let config = Arc::new(ServerConfig::new());
        let mut ctx = HttpContext::new(MaybeTlsStream::Plain(server), config);
        ctx.response.set_body("Halo");
        ctx.send().await.unwrap();
        assert!(!ctx.keep_alive);

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("Halo"));
    }

    #[tokio::test]
    async fn second_send_is_ignored() {
        let (mut client, server) = pair().await;
        let config = Arc::new(ServerConfig::new());
        let mut ctx = HttpContext::new(MaybeTlsStream::Plain(server), config);
        ctx.response.set_body("once");
        ctx.send().await.unwrap();
        ctx.send().await.unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 1);
    }

    #[tokio::test]
    async fn reset_clears_request_and_response() {
        let (_client, server) = pair().await;
        let config = Arc::new(ServerConfig::new());
        let mut ctx = HttpContext::new(MaybeTlsStream::Plain(server), config);
        ctx.response.set_body("stale");
        ctx.reset();
        assert!(ctx.response.body().is_empty());
        assert!(!ctx.response_sent());
        assert!(ctx.request.body().is_empty());
    }
}
