//! Intercepting proxy server.
//!
//! Binds a loopback listener and runs every accepted connection through a
//! [`ConnectionHandler`] on its own task.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use ordertap_core::{AppRegistry, ApplicationParser, LoggingUplink, OrderUplink, SensitiveDataFilter};

use crate::ca::CertificateAuthority;
use crate::capture::DEFAULT_CAPTURE_LIMIT;
use crate::domains::DomainAllowList;
use crate::error::{ProxyError, Result};
use crate::handler::{ConnectionHandler, HandlerConfig};
use crate::tls::{build_client_config, UpstreamTrust};
use crate::DEFAULT_PROXY_PORT;

/// Default idle timeout for proxied sockets.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a stopping proxy waits for order submissions to finish.
const SUBMISSION_GRACE: Duration = Duration::from_secs(5);

/// Proxy server configuration.
#[derive(Clone)]
pub struct ProxyConfig {
    /// Address to bind the proxy to.
    pub addr: SocketAddr,
    /// Root authority used to issue leaf certificates.
    pub authority: Arc<CertificateAuthority>,
    /// Hosts whose traffic is decrypted.
    pub allow_list: DomainAllowList,
    /// Apps the parser recognizes.
    pub registry: AppRegistry,
    /// Receives extracted orders.
    pub uplink: Arc<dyn OrderUplink>,
    /// How origin certificates are verified.
    pub upstream_trust: UpstreamTrust,
    /// Idle timeout for every socket of a connection.
    pub idle_timeout: Duration,
    /// Largest response body kept for parsing.
    pub capture_limit: usize,
    /// Mask sensitive values in the raw body before submission.
    pub redact: bool,
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("addr", &self.addr)
            .field("authority", &self.authority)
            .field("allow_list", &self.allow_list)
            .field("apps", &self.registry.len())
            .field("uplink", &"OrderUplink")
            .field("upstream_trust", &self.upstream_trust)
            .field("idle_timeout", &self.idle_timeout)
            .field("capture_limit", &self.capture_limit)
            .field("redact", &self.redact)
            .finish()
    }
}

impl ProxyConfig {
    /// Creates a configuration with the bundled apps, their domains and a
    /// logging uplink, listening on `127.0.0.1:8888`.
    pub fn new(authority: Arc<CertificateAuthority>) -> Self {
        let registry = AppRegistry::with_defaults();
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PROXY_PORT)),
            authority,
            allow_list: DomainAllowList::from_registry(&registry),
            registry,
            uplink: Arc::new(LoggingUplink),
            upstream_trust: UpstreamTrust::default(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            capture_limit: DEFAULT_CAPTURE_LIMIT,
            redact: true,
        }
    }

    /// Sets the listen address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the port (uses 127.0.0.1 as host).
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr = SocketAddr::from(([127, 0, 0, 1], port));
        self
    }

    /// Sets the interception allow-list.
    pub fn with_allow_list(mut self, allow_list: DomainAllowList) -> Self {
        self.allow_list = allow_list;
        self
    }

    /// Sets the app registry. The allow-list is left unchanged.
    pub fn with_registry(mut self, registry: AppRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Sets the order uplink.
    pub fn with_uplink(mut self, uplink: Arc<dyn OrderUplink>) -> Self {
        self.uplink = uplink;
        self
    }

    /// Sets how origin certificates are verified.
    pub fn with_upstream_trust(mut self, trust: UpstreamTrust) -> Self {
        self.upstream_trust = trust;
        self
    }

    /// Sets the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets the capture limit.
    pub fn with_capture_limit(mut self, limit: usize) -> Self {
        self.capture_limit = limit;
        self
    }

    /// Enables or disables raw-body redaction.
    pub fn with_redaction(mut self, redact: bool) -> Self {
        self.redact = redact;
        self
    }

    fn handler_config(&self) -> Result<HandlerConfig> {
        if self.idle_timeout.is_zero() {
            return Err(ProxyError::Config("idle timeout must be positive".into()));
        }
        let redactor = if self.redact {
            Some(SensitiveDataFilter::new().map_err(|e| ProxyError::Config(e.to_string()))?)
        } else {
            None
        };

        Ok(HandlerConfig {
            authority: Arc::clone(&self.authority),
            allow_list: self.allow_list.clone(),
            parser: ApplicationParser::new(self.registry.clone()),
            uplink: Arc::clone(&self.uplink),
            redactor,
            client_tls: build_client_config(&self.upstream_trust)?,
            idle_timeout: self.idle_timeout,
            capture_limit: self.capture_limit,
        })
    }
}

/// Intercepting proxy server.
#[derive(Debug)]
pub struct ProxyServer {
    config: ProxyConfig,
}

impl ProxyServer {
    /// Creates a new proxy server with the given configuration.
    pub fn new(config: ProxyConfig) -> Self {
        Self { config }
    }

    /// Returns the address the proxy is configured to listen on.
    pub fn addr(&self) -> SocketAddr {
        self.config.addr
    }

    /// Returns the CA certificate path for user installation.
    pub fn ca_cert_path(&self) -> std::path::PathBuf {
        self.config.authority.cert_path()
    }

    /// Binds the listener and starts accepting connections in the background.
    ///
    /// Fails if the address is in use or the configuration is invalid.
    pub async fn start(self) -> Result<ProxyHandle> {
        let handler = ConnectionHandler::new(self.config.handler_config()?);

        let addr = self.config.addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        let active = Arc::new(AtomicUsize::new(0));

        tracing::info!("Starting proxy on {}", local_addr);
        tracing::info!("CA certificate: {:?}", self.ca_cert_path());
        tracing::debug!("Intercepting {} domains", self.config.allow_list.len());

        let handle = tokio::spawn(accept_loop(listener, handler, shutdown_rx, Arc::clone(&active)));

        Ok(ProxyHandle {
            shutdown_tx,
            addr: local_addr,
            active,
            handle,
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: ConnectionHandler,
    mut shutdown_rx: broadcast::Receiver<()>,
    active: Arc<AtomicUsize>,
) {
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                tracing::info!("Proxy shutdown signal received");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    let handler = handler.clone();
                    let guard = ActiveGuard::new(&active);
                    tasks.spawn(async move {
                        let _guard = guard;
                        handler.handle(stream, peer).await;
                    });
                }
                Err(e) => {
                    // Back off, e.g. on descriptor exhaustion.
                    tracing::warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        tracing::error!("Connection task panicked: {}", e);
                    }
                }
            }
        }
    }

    drop(listener);
    let in_flight = tasks.len();
    tasks.shutdown().await;
    handler.drain_submissions(SUBMISSION_GRACE).await;
    tracing::info!("Proxy server stopped ({} connections closed)", in_flight);
}

/// Counts a connection as active for as long as it lives.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(active: &Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(active))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Handle for controlling a running proxy server.
#[derive(Debug)]
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    active: Arc<AtomicUsize>,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// Returns the address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of connections currently being served.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Signals the proxy to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the proxy to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Closes the listener and aborts every in-flight connection. Order
    /// submissions already started get a short grace period to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}
