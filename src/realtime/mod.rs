//! Real-time communication — the WebSocket (RFC 6455) upgrade path.
//!
//! A `GET` request carrying `Upgrade: websocket` diverts the connection out
//! of the HTTP request loop after its headers: the handshake response is
//! sent, then the connection becomes a frame loop. Inbound data frames are
//! dispatched to the same user callback as HTTP requests, with the frame
//! exposed on the context's [`WebSocket`]; control frames are handled here.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use tracing::{debug, error};

pub mod frame;
pub mod handshake;

pub use frame::{Frame, FrameError, Opcode};
pub use handshake::derive_accept_key;

use crate::context::HttpContext;

/// WebSocket connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsState {
    /// Upgrade requested, handshake response not yet sent.
    HandShake,
    /// Handshake complete; exactly one handshake response has been sent.
    Open,
    /// Terminal.
    Close,
}

/// WebSocket status codes (RFC 6455 §7.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum WsStatus {
    /// 1000, normal closure.
    Ok = 1000,
    /// 1001, endpoint going away.
    GoingAway = 1001,
    /// 1002, protocol error.
    BadProtocol = 1002,
    /// 1003, unacceptable data.
    UnknownOpcode = 1003,
    /// 1007, payload inconsistent with its type.
    BadPayload = 1007,
    /// 1008, policy violation.
    ViolatesPolicy = 1008,
    /// 1009, message too big to process.
    PayloadTooBig = 1009,
    /// 1010, handshake could not be completed.
    HandShakeFailed = 1010,
    /// 1011, unexpected condition.
    UnexpectedClose = 1011,
}

impl WsStatus {
    /// Returns the numeric close code.
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Per-connection WebSocket state.
///
/// Created when an upgrade request is detected and owned by the
/// [`HttpContext`] for the rest of the connection. The frame loop places
/// each inbound data frame in [`in_frame`](Self::in_frame) before invoking
/// the user callback; a frame left in [`out_frame`](Self::out_frame) when
/// the callback returns is written to the peer.
#[derive(Debug)]
pub struct WebSocket {
    /// Connection state.
    pub state: WsState,
    /// Most recent status code.
    pub status: WsStatus,
    /// The inbound frame being dispatched, payload already unmasked.
    pub in_frame: Option<Frame>,
    /// Outbound frame staged by the handler.
    pub out_frame: Option<Frame>,
    /// Headers of the request that initiated the upgrade.
    pub request_headers: crate::http::Headers,
    /// Extra headers to include in the handshake response.
    pub response_headers: crate::http::Headers,
    nonce: Bytes,
}

impl WebSocket {
    pub(crate) fn new(request_headers: crate::http::Headers) -> Self {
        Self {
            state: WsState::HandShake,
            status: WsStatus::Ok,
            in_frame: None,
            out_frame: None,
            request_headers,
            response_headers: crate::http::Headers::new(),
            nonce: Bytes::copy_from_slice(&rand::random::<[u8; 16]>()),
        }
    }

    /// The connection's ping nonce. A Pong carrying exactly these bytes is
    /// recognized as the reply to a server-sent ping.
    pub fn nonce(&self) -> &[u8] {
        &self.nonce
    }

    /// Stages a frame to be sent after the current callback returns.
    pub fn stage(&mut self, frame: Frame) {
        self.out_frame = Some(frame);
    }
}

/// Drives an upgraded connection: handshake, then the frame loop.
///
/// Never hands the context back to the HTTP request loop; when this returns,
/// the connection is finished.
pub(crate) async fn serve<H, F>(mut ctx: HttpContext, handler: Arc<H>) -> Result<(), FrameError>
where
    H: Fn(HttpContext) -> F + Send + Sync + 'static,
    F: Future<Output = HttpContext> + Send + 'static,
{
    let trace = ctx.trace();
    let max_payload = ctx.max_body_length();

    // Handshake.
    let Some(ws) = ctx.websocket.as_mut() else {
        return Ok(());
    };
    let client_key = ws
        .request_headers
        .get("sec-websocket-key")
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_owned);
    let Some(client_key) = client_key else {
        ws.status = WsStatus::HandShakeFailed;
        ws.state = WsState::Close;
        if trace {
            debug!("websocket upgrade without Sec-WebSocket-Key; dropping connection");
        }
        let _ = ctx.wire().shutdown().await;
        return Ok(());
    };
    let accept_key = derive_accept_key(&client_key);
    let block = handshake::response_bytes(&accept_key, &ws.response_headers);
    ctx.wire().write_all(&block).await?;
    ctx.wire().flush().await?;
    if let Some(ws) = ctx.websocket.as_mut() {
        ws.state = WsState::Open;
    }
    if trace {
        debug!("websocket open");
    }

    // Frame loop.
    loop {
        let frame = match Frame::read_from(ctx.wire(), max_payload).await {
            Ok(frame) => frame,
            Err(FrameError::PayloadTooBig { len, max }) => {
                if trace {
                    debug!(len, max, "websocket payload over limit; closing");
                }
                close_with(&mut ctx, WsStatus::PayloadTooBig).await;
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        match frame.opcode {
            Opcode::Text | Opcode::Binary | Opcode::Continuation => {
                if let Some(ws) = ctx.websocket.as_mut() {
                    ws.in_frame = Some(frame);
                }
                ctx = match AssertUnwindSafe(handler(ctx)).catch_unwind().await {
                    Ok(ctx) => ctx,
                    Err(_) => {
                        error!("websocket handler panicked; connection dropped");
                        return Ok(());
                    }
                };
                let staged = ctx
                    .websocket
                    .as_mut()
                    .and_then(|ws| ws.out_frame.take());
                if let Some(out) = staged {
                    ctx.ws_send(out).await?;
                }
                if let Some(ws) = ctx.websocket.as_mut() {
                    ws.in_frame = None;
                }
            }
            Opcode::Ping => {
                Frame::pong(frame.payload().clone())
                    .write_to(ctx.wire().inner_mut())
                    .await?;
            }
            Opcode::Pong => {
                let expected = ctx
                    .websocket
                    .as_ref()
                    .is_some_and(|ws| frame.payload().as_ref() == ws.nonce());
                if !expected {
                    if trace {
                        debug!("unsolicited pong; closing");
                    }
                    close_with(&mut ctx, WsStatus::UnknownOpcode).await;
                    return Ok(());
                }
            }
            Opcode::Close => {
                if let Some(ws) = ctx.websocket.as_mut() {
                    ws.status = WsStatus::UnexpectedClose;
                    ws.state = WsState::Close;
                }
                let _ = ctx.wire().shutdown().await;
                return Ok(());
            }
            Opcode::Reserved(bits) => {
                if trace {
                    debug!(opcode = bits, "ignoring frame with reserved opcode");
                }
            }
        }
    }
}

/// Records the status, sends a close frame carrying it, and shuts the
/// stream down.
///
/// Pending inbound bytes are discarded for a short grace period first, so
/// the close frame is not destroyed by a reset when the socket drops with
/// unread data.
async fn close_with(ctx: &mut HttpContext, status: WsStatus) {
    if let Some(ws) = ctx.websocket.as_mut() {
        ws.status = status;
        ws.state = WsState::Close;
    }
    let _ = Frame::close(status).write_to(ctx.wire().inner_mut()).await;
    let _ = tokio::time::timeout(std::time::Duration::from_millis(100), async {
        while ctx.wire().read_chunk(4096).await.is_ok() {}
    })
    .await;
    let _ = ctx.wire().shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_rfc() {
        assert_eq!(WsStatus::Ok.as_u16(), 1000);
        assert_eq!(WsStatus::GoingAway.as_u16(), 1001);
        assert_eq!(WsStatus::BadProtocol.as_u16(), 1002);
        assert_eq!(WsStatus::UnknownOpcode.as_u16(), 1003);
        assert_eq!(WsStatus::BadPayload.as_u16(), 1007);
        assert_eq!(WsStatus::ViolatesPolicy.as_u16(), 1008);
        assert_eq!(WsStatus::PayloadTooBig.as_u16(), 1009);
        assert_eq!(WsStatus::HandShakeFailed.as_u16(), 1010);
        assert_eq!(WsStatus::UnexpectedClose.as_u16(), 1011);
    }

    #[test]
    fn new_connection_state() {
        let ws = WebSocket::new(crate::http::Headers::new());
        assert_eq!(ws.state, WsState::HandShake);
        assert_eq!(ws.status, WsStatus::Ok);
        assert_eq!(ws.nonce().len(), 16);
        assert!(ws.in_frame.is_none());
        assert!(ws.out_frame.is_none());
    }

    #[test]
    fn staged_frame_parked_in_out_slot() {
        let mut ws = WebSocket::new(crate::http::Headers::new());
        ws.stage(Frame::text("reply"));
        assert_eq!(
            ws.out_frame.take().unwrap().payload_text(),
            Some("reply")
        );
    }
}
