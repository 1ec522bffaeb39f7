//! Per-connection request loop.
//!
//! One task drives one connection: parse a request head, apply the body size
//! policy and spool the body, dispatch to the user callback, then either
//! loop for the next request (keep-alive) or tear the connection down. A
//! detected WebSocket upgrade leaves this loop for the frame loop and never
//! comes back.
//!
//! All failures are contained to the connection: malformed heads and
//! unknown methods drop it silently, I/O failures drop it with a trace log,
//! and a panicking callback is caught and logged.

use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use thiserror::Error;
use tracing::{debug, error};

use super::stream::MaybeTlsStream;
use super::wire::WireError;
use super::ServerConfig;
use crate::context::HttpContext;
use crate::http::request::{read_head, HeadOutcome};
use crate::http::{body, StatusCode};
use crate::realtime::{self, FrameError, WebSocket};

/// Failure of a single connection. Never crosses to other connections.
#[derive(Debug, Error)]
pub(crate) enum ConnError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Drives one accepted connection to completion.
pub(crate) async fn handle<H, F>(
    stream: MaybeTlsStream,
    peer_addr: SocketAddr,
    config: Arc<ServerConfig>,
    handler: Arc<H>,
) -> Result<(), ConnError>
where
    H: Fn(HttpContext) -> F + Send + Sync + 'static,
    F: Future<Output = HttpContext> + Send + 'static,
{
    let secure = stream.is_secure();
    let port = if secure {
        config.tls_settings.as_ref().map(|t| t.port).unwrap_or(8443)
    } else {
        config.port
    };
    let default_host = format!("{}:{}", config.address, port);

    let mut ctx = HttpContext::new(stream, Arc::clone(&config));

    loop {
        let outcome = match read_head(ctx.wire(), &default_host, secure).await {
            Ok(outcome) => outcome,
            Err(err @ (WireError::MalformedLine | WireError::LineTooLong { .. })) => {
                if config.trace {
                    debug!(peer = %peer_addr, error = %err, "unparseable request head; dropping connection");
                }
                break;
            }
            Err(err) => return Err(err.into()),
        };

        let (request, upgrade) = match outcome {
            HeadOutcome::EndOfStream => {
                if config.trace {
                    debug!(peer = %peer_addr, "peer finished");
                }
                break;
            }
            HeadOutcome::Invalid => {
                if config.trace {
                    debug!(peer = %peer_addr, "invalid request; dropping connection");
                }
                break;
            }
            HeadOutcome::Request(request) => (request, false),
            HeadOutcome::Upgrade(request) => (request, true),
        };

        // Replacing the slot drops the previous request and its spool file.
        ctx.request = request;

        if upgrade {
            if config.trace {
                debug!(peer = %peer_addr, "websocket upgrade requested");
            }
            ctx.websocket = Some(WebSocket::new(ctx.request.headers().clone()));
            return realtime::serve(ctx, handler).await.map_err(Into::into);
        }

        if ctx.request.method().is_some_and(|m| m.has_body()) {
            match ctx.request.content_length() {
                None => {
                    reject(
                        &mut ctx,
                        StatusCode::LengthRequired,
                        "Content-Length required".to_owned(),
                    )
                    .await?;
                    break;
                }
                Some(len) if len > config.max_body_length => {
                    let max_mb = config.max_body_length / (1024 * 1024);
                    reject(
                        &mut ctx,
                        StatusCode::PayloadTooLarge,
                        format!("request larger than {max_mb} MB not allowed."),
                    )
                    .await?;
                    break;
                }
                Some(len) => {
                    let spooled = body::spool(
                        ctx.wire(),
                        len,
                        config.read_body_buffer,
                        config.body_dir(),
                    )
                    .await?;
                    ctx.request.set_body(spooled);
                }
            }
        }

        if config.trace {
            debug!(
                peer = %peer_addr,
                method = ctx.request.method().map(|m| m.as_str()).unwrap_or("-"),
                path = ctx.request.path(),
                "dispatching request"
            );
        }

        ctx = match AssertUnwindSafe(handler(ctx)).catch_unwind().await {
            Ok(ctx) => ctx,
            Err(_) => {
                error!(peer = %peer_addr, "handler panicked; connection dropped");
                return Ok(());
            }
        };

        if !ctx.response_sent() {
            if config.trace {
                debug!(peer = %peer_addr, "handler returned without sending; closing");
            }
            break;
        }
        if !ctx.keep_alive {
            break;
        }
        ctx.reset();
    }

    let _ = ctx.wire().shutdown().await;
    Ok(())
}

/// Sends a server-generated error response without consulting the handler
/// and forces the connection closed.
async fn reject(
    ctx: &mut HttpContext,
    status: StatusCode,
    message: String,
) -> Result<(), ConnError> {
    ctx.keep_alive = false;
    ctx.response.status = status;
    ctx.response.set_body(message);
    ctx.send().await?;
    Ok(())
}
