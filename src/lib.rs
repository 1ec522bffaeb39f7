//! # swell
//!
//! A from-scratch async HTTP/1.1 origin server with persistent connections
//! and an integrated WebSocket (RFC 6455) upgrade path, over plain TCP or
//! TLS.
//!
//! Each accepted connection is one task that owns its stream. The server
//! parses requests, hands an [`HttpContext`] to a single user-supplied
//! callback, and writes the callback's response back on the same
//! connection, reusing it when both sides ask for keep-alive. A `GET`
//! carrying `Upgrade: websocket` switches the connection into a frame loop
//! that dispatches inbound data frames to the same callback.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use swell::{HttpContext, Server, ServerConfig, StatusCode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::new().port(8080).keep_alive(true);
//!     let server = Server::bind(config).await?;
//!     println!("Listening on http://127.0.0.1:8080");
//!     server
//!         .run(|mut ctx: HttpContext| async move {
//!             ctx.response.status = StatusCode::Ok;
//!             ctx.response.set_body("Hello, World!");
//!             let _ = ctx.send().await;
//!             ctx
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod context;
pub mod http;
pub mod realtime;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use context::HttpContext;
pub use http::{Body, Headers, Method, Request, Response, StatusCode};
pub use realtime::{Frame, FrameError, Opcode, WebSocket, WsState, WsStatus};
pub use server::{Server, ServerConfig, ServerError, TlsSettings};
