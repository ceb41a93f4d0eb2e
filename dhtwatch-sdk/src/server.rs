//! HTTP serving of the latest snapshot.
//!
//! Serves the snapshot as JSON on a single read endpoint, with gzip when the
//! client asks for it, and supports graceful draining via [`Drain`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use dhtwatch_sdk::server::{DataServer, ServerConfig};
//! use dhtwatch_sdk::{Poller, ShutdownOrchestrator, SimulatedSampler};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let lifetime = CancellationToken::new();
//!     let poller = Poller::builder(SimulatedSampler::new())
//!         .lifetime(lifetime.clone())
//!         .build();
//!     poller.start();
//!
//!     let config = ServerConfig::builder()
//!         .listen_addr("0.0.0.0:8080")
//!         .data_path("/data")
//!         .build();
//!
//!     let server = DataServer::bind(config).await?.serve(poller.clone());
//!
//!     // Latest reading available at http://localhost:8080/data
//!
//!     let mut orchestrator = ShutdownOrchestrator::new(lifetime);
//!     orchestrator.register(server);
//!     orchestrator.attach_poller(poller);
//!     orchestrator.run_until(dhtwatch_sdk::termination_signal()).await;
//!     Ok(())
//! }
//! ```

use std::convert::Infallible;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE, VARY};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::server::graceful::GracefulShutdown;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{DrainError, ServerError};
use crate::poller::SnapshotSource;
use crate::shutdown::Drain;

/// Cap on buffered request data, which bounds the request head. hyper does
/// not accept anything smaller.
const MAX_BUF_SIZE: usize = 8192;

/// Configuration for the data server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "0.0.0.0:8080")
    pub listen_addr: String,
    /// Path of the snapshot endpoint (e.g., "/data")
    pub data_path: String,
    /// Time allowed for a client to send its request headers
    pub header_read_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            data_path: "/data".to_string(),
            header_read_timeout: Duration::from_secs(15),
        }
    }
}

impl ServerConfig {
    /// Create a new builder for ServerConfig.
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }
}

/// Builder for ServerConfig.
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    listen_addr: Option<String>,
    data_path: Option<String>,
    header_read_timeout: Option<Duration>,
}

impl ServerConfigBuilder {
    /// Set the listen address.
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = Some(addr.into());
        self
    }

    /// Set the snapshot endpoint path.
    pub fn data_path(mut self, path: impl Into<String>) -> Self {
        self.data_path = Some(path.into());
        self
    }

    /// Set the request header read timeout.
    pub fn header_read_timeout(mut self, timeout: Duration) -> Self {
        self.header_read_timeout = Some(timeout);
        self
    }

    /// Build the ServerConfig.
    pub fn build(self) -> ServerConfig {
        let defaults = ServerConfig::default();
        ServerConfig {
            listen_addr: self.listen_addr.unwrap_or(defaults.listen_addr),
            data_path: self.data_path.unwrap_or(defaults.data_path),
            header_read_timeout: self
                .header_read_timeout
                .unwrap_or(defaults.header_read_timeout),
        }
    }
}

/// A bound, not yet serving, data server.
#[derive(Debug)]
pub struct DataServer {
    config: ServerConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl DataServer {
    /// Bind the listener described by `config`.
    ///
    /// Port `0` picks a free port; see [`local_addr`](Self::local_addr).
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let addr: SocketAddr =
            config
                .listen_addr
                .parse()
                .map_err(|source| ServerError::Address {
                    addr: config.listen_addr.clone(),
                    source,
                })?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.listen_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            config,
            listener,
            local_addr,
        })
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start serving snapshots from `source` on a background task.
    pub fn serve<S: SnapshotSource>(self, source: S) -> ServerHandle {
        let shutdown = CancellationToken::new();
        let local_addr = self.local_addr;
        let task = tokio::spawn(run_server(
            self.listener,
            Arc::new(self.config),
            Arc::new(source),
            shutdown.clone(),
        ));

        info!(addr = %local_addr, "sensor data server listening");

        ServerHandle {
            local_addr,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }
}

/// Handle to a running data server. Register it with a
/// [`ShutdownOrchestrator`](crate::ShutdownOrchestrator) to drain it on
/// shutdown.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ServerHandle {
    /// The address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Drain for ServerHandle {
    fn name(&self) -> String {
        self.local_addr.to_string()
    }

    async fn drain(&self, timeout: Duration) -> Result<(), DrainError> {
        self.shutdown.cancel();

        let Some(mut task) = self.task.lock().take() else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(DrainError::Aborted(e.to_string())),
            Err(_) => {
                // Dropping the server task drops its connections.
                task.abort();
                Err(DrainError::Timeout(timeout))
            }
        }
    }
}

async fn run_server(
    listener: TcpListener,
    config: Arc<ServerConfig>,
    source: Arc<dyn SnapshotSource>,
    shutdown: CancellationToken,
) {
    let graceful = GracefulShutdown::new();
    let mut connections = JoinSet::new();
    let mut backoff = AcceptBackoff::default();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => {
                        backoff.reset();
                        accepted
                    }
                    Err(e) => {
                        let delay = backoff.next_delay();
                        warn!(error = %e, retry_in = ?delay, "failed to accept connection");
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(delay) => continue,
                        }
                    }
                };

                let header_read_timeout = config.header_read_timeout;
                let config = config.clone();
                let source = source.clone();
                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let response = handle_request(&req, &config, source.as_ref());
                    async move { Ok::<_, Infallible>(response) }
                });

                let conn = http1::Builder::new()
                    .timer(TokioTimer::new())
                    .header_read_timeout(header_read_timeout)
                    .max_buf_size(MAX_BUF_SIZE)
                    .serve_connection(TokioIo::new(stream), service);
                let conn = graceful.watch(conn);

                connections.spawn(async move {
                    if let Err(e) = conn.await {
                        debug!(peer = %peer, error = %e, "connection error");
                    }
                });
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    debug!(open = connections.len(), "listener closed, draining connections");

    graceful.shutdown().await;
    while connections.join_next().await.is_some() {}
}

/// Pause between failed accepts, e.g. while out of file descriptors.
#[derive(Debug, Default)]
struct AcceptBackoff {
    current: Option<Duration>,
}

impl AcceptBackoff {
    const INITIAL: Duration = Duration::from_millis(5);
    const MAX: Duration = Duration::from_secs(1);

    fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            None => Self::INITIAL,
            Some(current) => (current * 2).min(Self::MAX),
        };
        self.current = Some(delay);
        delay
    }

    fn reset(&mut self) {
        self.current = None;
    }
}

fn handle_request<B>(
    req: &Request<B>,
    config: &ServerConfig,
    source: &dyn SnapshotSource,
) -> Response<Full<Bytes>> {
    let path = req.uri().path();
    let gzip = accepts_gzip(req);

    if path == config.data_path {
        if req.method() != Method::GET {
            let body = format!("{} not allowed. {} accepted.\n", req.method(), Method::GET);
            return text_response(StatusCode::METHOD_NOT_ALLOWED, body, gzip);
        }

        match serde_json::to_vec(&source.latest()) {
            Ok(mut json) => {
                json.push(b'\n');
                respond(
                    StatusCode::OK,
                    "application/json; charset=utf-8",
                    json,
                    gzip,
                )
            }
            Err(e) => {
                error!(error = %e, "could not encode JSON response");
                text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error\n".to_string(),
                    gzip,
                )
            }
        }
    } else if path == "/health" || path == "/healthz" {
        text_response(StatusCode::OK, "OK".to_string(), gzip)
    } else {
        text_response(StatusCode::NOT_FOUND, "Not Found".to_string(), gzip)
    }
}

fn text_response(status: StatusCode, body: String, gzip: bool) -> Response<Full<Bytes>> {
    respond(status, "text/plain; charset=utf-8", body.into_bytes(), gzip)
}

fn respond(
    status: StatusCode,
    content_type: &'static str,
    body: Vec<u8>,
    gzip: bool,
) -> Response<Full<Bytes>> {
    let (body, encoded) = if gzip {
        match compress_gzip(&body) {
            Ok(compressed) => (compressed, true),
            Err(e) => {
                warn!(error = %e, "gzip encoding failed, sending identity");
                (body, false)
            }
        }
    } else {
        (body, false)
    };

    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    headers.insert(VARY, HeaderValue::from_static("Accept-Encoding"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    if encoded {
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    }

    response
}

/// Whether the request's `Accept-Encoding` mentions gzip.
fn accepts_gzip<B>(req: &Request<B>) -> bool {
    req.headers()
        .get_all(ACCEPT_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.to_ascii_lowercase().contains("gzip"))
}

fn compress_gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}
