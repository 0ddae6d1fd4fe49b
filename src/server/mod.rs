//! Server half: validates, authenticates and dispatches inbound streams.
//!
//! [`InterstellarServer`] owns the HTTP/2 listener and hands every request to
//! a shared [`RequestHandler`]. The health service is always registered next
//! to the local services.

pub mod access_log;
pub mod deadline;
pub mod framing;
pub mod handler;
pub mod health;
pub mod service;
pub mod stream;

pub use access_log::{AccessLogSink, AccessRecord, MemoryAccessLog, TracingAccessLog};
pub use handler::{CallContext, RequestHandler, ResponseBody};
pub use service::{HandlerProvider, MethodHandler, ServerMethod, ServiceDefinition};
pub use stream::ServerStream;

use crate::auth::{Authenticator, TokenDecoder};
use crate::config::Settings;
use crate::error::{ConfigurationError, Result};
use hyper::body::Incoming;
use hyper::server::conn::http2;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::Mutex;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Collaborators a server can be given instead of the defaults.
#[derive(Clone, Default)]
pub struct ServerOptions {
    /// Defaults to [`TracingAccessLog`]
    pub access_log: Option<Arc<dyn AccessLogSink>>,
    /// Required by the bearer-token scheme
    pub token_decoder: Option<Arc<dyn TokenDecoder>>,
}

struct Running {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept: JoinHandle<()>,
}

pub struct InterstellarServer {
    handler: Arc<RequestHandler>,
    running: Mutex<Option<Running>>,
}

impl InterstellarServer {
    pub fn new(settings: &Settings, provider: &dyn HandlerProvider) -> Result<Self> {
        Self::with_options(settings, provider, ServerOptions::default())
    }

    pub fn with_options(settings: &Settings, provider: &dyn HandlerProvider, options: ServerOptions) -> Result<Self> {
        let mut services = provider.services();
        if services.is_empty() {
            warn!("No local services configured; only the health service will be served");
        }
        let names = services.iter().map(|s| s.name().to_string()).collect();
        services.push(health::service(names));

        let authenticator = Authenticator::new(settings, options.token_decoder)?;
        let sink = options
            .access_log
            .unwrap_or_else(|| Arc::new(TracingAccessLog));
        let handler = RequestHandler::new(settings, services, authenticator, sink)?;

        Ok(Self {
            handler: Arc::new(handler),
            running: Mutex::new(None),
        })
    }

    pub fn handler(&self) -> &Arc<RequestHandler> {
        &self.handler
    }

    /// Bind `host:port` and start serving. Port 0 picks a free port; the
    /// bound address is returned.
    pub async fn start(&self, host: &str, port: u16) -> Result<SocketAddr> {
        if self.running.lock().is_some() {
            return Err(ConfigurationError::Invalid("Server is already running".to_string()).into());
        }

        let listener = TcpListener::bind((host, port)).await?;
        let addr = listener.local_addr()?;
        let (shutdown, signal) = watch::channel(false);

        let mut running = self.running.lock();
        if running.is_some() {
            return Err(ConfigurationError::Invalid("Server is already running".to_string()).into());
        }
        let accept = tokio::spawn(accept_loop(listener, Arc::clone(&self.handler), signal));
        *running = Some(Running {
            addr,
            shutdown,
            accept,
        });
        drop(running);

        info!(
            "Interstellar server listening on {} ({} services)",
            addr,
            self.handler.services().len()
        );
        Ok(addr)
    }

    /// Stop accepting, let open connections drain and wait for them.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };

        let _ = running.shutdown.send(true);
        if let Err(e) = running.accept.await {
            warn!("Accept loop ended abnormally: {}", e);
        }
        info!("Interstellar server on {} stopped", running.addr);
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|running| running.addr)
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }
}

async fn accept_loop(listener: TcpListener, handler: Arc<RequestHandler>, mut shutdown: watch::Receiver<bool>) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    connections.spawn(serve_connection(stream, remote, Arc::clone(&handler), shutdown.clone()));
                }
                Err(e) => warn!("Failed to accept connection: {}", e),
            },
            _ = shutdown.changed() => break,
        }
    }

    debug!("Draining {} connections", connections.len());
    while connections.join_next().await.is_some() {}
}

async fn serve_connection(
    stream: TcpStream,
    remote: SocketAddr,
    handler: Arc<RequestHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", remote, e);
    }

    let service = service_fn(move |request: http::Request<Incoming>| {
        let handler = Arc::clone(&handler);
        async move { Ok::<_, Infallible>(handler.handle(request, Some(remote)).await) }
    });

    let connection = http2::Builder::new(TokioExecutor::new()).serve_connection(TokioIo::new(stream), service);
    tokio::pin!(connection);

    tokio::select! {
        result = connection.as_mut() => {
            if let Err(e) = result {
                debug!("Connection from {} ended: {}", remote, e);
            }
        }
        _ = shutdown.changed() => {
            connection.as_mut().graceful_shutdown();
            if let Err(e) = connection.await {
                debug!("Connection from {} ended during shutdown: {}", remote, e);
            }
        }
    }
}
