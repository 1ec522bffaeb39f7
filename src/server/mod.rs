//! The listener/acceptor and server configuration.
//!
//! [`Server::bind`] opens a plain TCP listener and, when TLS settings are
//! present and valid, a second TLS listener. [`Server::run`] accepts
//! connections on both and spawns one task per connection; the task owns the
//! stream for the connection's whole lifetime.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

pub(crate) mod conn;
pub(crate) mod stream;
pub(crate) mod tls;
pub(crate) mod wire;

use crate::context::HttpContext;
use stream::MaybeTlsStream;

/// Last site URL bound by any server in this process, for diagnostics only.
/// Overwritten on every successful bind.
static SITE_URL: Mutex<Option<String>> = Mutex::new(None);

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid bind address: {addr}")]
    Addr { addr: String },

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to read TLS file {path}: {source}")]
    TlsFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid TLS material in {path}: {detail}")]
    TlsMaterial { path: PathBuf, detail: &'static str },

    #[error("TLS configuration rejected: {0}")]
    TlsConfig(#[from] tokio_rustls::rustls::Error),
}

/// Settings for the optional TLS listener.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    /// PEM certificate chain file. Relative paths resolve against the
    /// working directory.
    pub cert_file: PathBuf,
    /// PEM PKCS#8 private key file.
    pub key_file: PathBuf,
    /// TLS listener port.
    pub port: u16,
    /// Require clients to present a certificate chaining to `cert_file`.
    pub verify_peer: bool,
}

impl TlsSettings {
    /// Creates settings with the default port (8443) and no peer
    /// verification.
    pub fn new(cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        Self {
            cert_file: cert_file.into(),
            key_file: key_file.into(),
            port: 8443,
            verify_peer: false,
        }
    }

    /// Sets the TLS listener port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Enables client certificate verification.
    #[must_use]
    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        self
    }
}

/// Server configuration. All options have defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address for both listeners.
    pub address: String,
    /// Plain listener port.
    pub port: u16,
    /// Emit per-connection diagnostic logs.
    pub trace: bool,
    /// Set `SO_REUSEADDR` on the listening sockets.
    pub reuse_address: bool,
    /// Set `SO_REUSEPORT` on the listening sockets (Unix only).
    pub reuse_port: bool,
    /// TLS listener settings; `None` disables the secure listener.
    pub tls_settings: Option<TlsSettings>,
    /// Reject request bodies whose declared length exceeds this.
    pub max_body_length: u64,
    /// Allow persistent connections.
    pub keep_alive: bool,
    /// Base directory for temporary files.
    pub tmp_dir: PathBuf,
    /// Directory for spooled request bodies; defaults to `tmp_dir`.
    pub tmp_body_dir: Option<PathBuf>,
    /// Chunk size for body reads and the connection read buffer.
    pub read_body_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_owned(),
            port: 8000,
            trace: false,
            reuse_address: true,
            reuse_port: false,
            tls_settings: None,
            max_body_length: 256 * 1024 * 1024,
            keep_alive: false,
            tmp_dir: std::env::temp_dir(),
            tmp_body_dir: None,
            read_body_buffer: 1024,
        }
    }
}

impl ServerConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the bind address.
    #[must_use]
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Sets the plain listener port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Enables per-connection diagnostic logging.
    #[must_use]
    pub fn trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    /// Controls `SO_REUSEADDR`.
    #[must_use]
    pub fn reuse_address(mut self, reuse: bool) -> Self {
        self.reuse_address = reuse;
        self
    }

    /// Controls `SO_REUSEPORT` (Unix only).
    #[must_use]
    pub fn reuse_port(mut self, reuse: bool) -> Self {
        self.reuse_port = reuse;
        self
    }

    /// Enables the TLS listener.
    #[must_use]
    pub fn tls_settings(mut self, settings: TlsSettings) -> Self {
        self.tls_settings = Some(settings);
        self
    }

    /// Sets the request-body size limit in bytes.
    #[must_use]
    pub fn max_body_length(mut self, max: u64) -> Self {
        self.max_body_length = max;
        self
    }

    /// Enables persistent connections.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Sets the base temporary directory.
    #[must_use]
    pub fn tmp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tmp_dir = dir.into();
        self
    }

    /// Sets the spool directory for request bodies.
    #[must_use]
    pub fn tmp_body_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tmp_body_dir = Some(dir.into());
        self
    }

    /// Sets the body read chunk size.
    #[must_use]
    pub fn read_body_buffer(mut self, size: usize) -> Self {
        self.read_body_buffer = size;
        self
    }

    /// The effective spool directory for request bodies.
    pub fn body_dir(&self) -> &std::path::Path {
        self.tmp_body_dir.as_deref().unwrap_or(&self.tmp_dir)
    }
}

/// The swell HTTP/1.1 + WebSocket origin server.
///
/// # Examples
///
/// ```rust,no_run
/// use swell::{HttpContext, Server, ServerConfig, StatusCode};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Server::bind(ServerConfig::new().port(8080)).await?;
///     server
///         .run(|mut ctx: HttpContext| async move {
///             ctx.response.status = StatusCode::Ok;
///             ctx.response.set_body("Hello!");
///             let _ = ctx.send().await;
///             ctx
///         })
///         .await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    config: Arc<ServerConfig>,
    plain: TcpListener,
    plain_addr: SocketAddr,
    secure: Option<(TcpListener, SocketAddr, TlsAcceptor)>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("plain", &self.plain)
            .field("plain_addr", &self.plain_addr)
            .field("secure", &self.secure.as_ref().map(|(l, a, _)| (l, a)))
            .finish()
    }
}

impl Server {
    /// Binds the configured listeners.
    ///
    /// A TLS listener that cannot be set up (missing or invalid certificate
    /// or key) is logged and disabled; the plain listener still runs.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the plain listener cannot be bound.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let addr: SocketAddr = format!("{}:{}", config.address, config.port)
            .parse()
            .map_err(|_| ServerError::Addr {
                addr: format!("{}:{}", config.address, config.port),
            })?;
        let plain = bind_socket(addr, &config).map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let plain_addr = plain.local_addr()?;

        let secure = match &config.tls_settings {
            Some(settings) => match tls::server_config(settings) {
                Ok(tls_config) => {
                    let tls_addr: SocketAddr =
                        format!("{}:{}", config.address, settings.port)
                            .parse()
                            .map_err(|_| ServerError::Addr {
                                addr: format!("{}:{}", config.address, settings.port),
                            })?;
                    let listener =
                        bind_socket(tls_addr, &config).map_err(|source| ServerError::Bind {
                            addr: tls_addr.to_string(),
                            source,
                        })?;
                    let tls_addr = listener.local_addr()?;
                    let acceptor = TlsAcceptor::from(Arc::new(tls_config));
                    Some((listener, tls_addr, acceptor))
                }
                Err(err) => {
                    error!(error = %err, "TLS listener disabled");
                    None
                }
            },
            None => None,
        };

        if let Ok(mut site_url) = SITE_URL.lock() {
            *site_url = Some(format!("http://{plain_addr}"));
        }

        Ok(Self {
            config: Arc::new(config),
            plain,
            plain_addr,
            secure,
        })
    }

    /// Returns the plain listener's local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.plain_addr
    }

    /// Returns the TLS listener's local address, if one is active.
    pub fn tls_local_addr(&self) -> Option<SocketAddr> {
        self.secure.as_ref().map(|(_, addr, _)| *addr)
    }

    /// The last site URL bound in this process. Diagnostic only — never
    /// used for request handling.
    pub fn site_url() -> Option<String> {
        SITE_URL.lock().ok().and_then(|url| url.clone())
    }

    /// Accepts connections and dispatches requests to `handler`.
    ///
    /// The handler receives the connection's [`HttpContext`], must populate
    /// the response and call [`HttpContext::send`] exactly once, and then
    /// return the context. It is shared across all connection tasks, so it
    /// must be `Send + Sync + 'static`.
    ///
    /// Runs until the process terminates.
    pub async fn run<H, F>(self, handler: H) -> Result<(), ServerError>
    where
        H: Fn(HttpContext) -> F + Send + Sync + 'static,
        F: Future<Output = HttpContext> + Send + 'static,
    {
        let handler = Arc::new(handler);
        info!(address = %self.plain_addr, "listening");

        match self.secure {
            Some((listener, addr, acceptor)) => {
                info!(address = %addr, "listening (TLS)");
                let secure_loop = accept_loop(
                    listener,
                    Some(acceptor),
                    Arc::clone(&self.config),
                    Arc::clone(&handler),
                );
                let plain_loop = accept_loop(self.plain, None, self.config, handler);
                tokio::join!(plain_loop, secure_loop);
            }
            None => accept_loop(self.plain, None, self.config, handler).await,
        }
        Ok(())
    }
}

fn bind_socket(addr: SocketAddr, config: &ServerConfig) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if config.reuse_address {
        socket.set_reuseaddr(true)?;
    }
    #[cfg(unix)]
    if config.reuse_port {
        socket.set_reuseport(true)?;
    }
    socket.bind(addr)?;
    socket.listen(1024)
}

/// Accepts connections on one listener forever.
///
/// Accept failures and per-connection failures are contained: they are
/// logged and never stop the loop or affect other connections.
async fn accept_loop<H, F>(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    config: Arc<ServerConfig>,
    handler: Arc<H>,
) where
    H: Fn(HttpContext) -> F + Send + Sync + 'static,
    F: Future<Output = HttpContext> + Send + 'static,
{
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                error!(error = %err, "failed to accept connection");
                continue;
            }
        };

        if config.trace {
            debug!(peer = %peer_addr, "connection accepted");
        }
        let acceptor = acceptor.clone();
        let config = Arc::clone(&config);
        let handler = Arc::clone(&handler);

        tokio::spawn(async move {
            let stream = match wrap_stream(stream, acceptor, &config, peer_addr).await {
                Some(stream) => stream,
                None => return,
            };
            if let Err(err) = conn::handle(stream, peer_addr, Arc::clone(&config), handler).await
            {
                if config.trace {
                    warn!(peer = %peer_addr, error = %err, "connection closed with error");
                }
            }
        });
    }
}

/// Performs the TLS handshake when the listener is secure.
async fn wrap_stream(
    stream: TcpStream,
    acceptor: Option<TlsAcceptor>,
    config: &ServerConfig,
    peer_addr: SocketAddr,
) -> Option<MaybeTlsStream> {
    match acceptor {
        None => Some(MaybeTlsStream::Plain(stream)),
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls) => Some(MaybeTlsStream::from(tls)),
            Err(err) => {
                if config.trace {
                    debug!(peer = %peer_addr, error = %err, "TLS handshake failed");
                }
                None
            }
        },
    }
}
