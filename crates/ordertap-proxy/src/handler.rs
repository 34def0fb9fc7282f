//! Per-connection state machine.
//!
//! ```text
//! read request head ─┬─ CONNECT host:port ─→ 200 ─┬─ allow-listed ─→ intercept ─→ forward loop
//!                    │                            └─ otherwise ────→ tunnel
//!                    └─ absolute URI ─────────────→ plain relay (one exchange)
//! ```
//!
//! Interception issues the leaf first, then completes the origin handshake,
//! then the client handshake. Any failure before the client handshake leaves
//! the client's bytes untouched and the connection degrades to a tunnel. So
//! does a client whose first byte is not a TLS handshake record. A client
//! handshake that fails after that point closes the connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use http::uri::{Authority, Scheme};
use http::Uri;
use parking_lot::Mutex;
use rustls::ClientConfig;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use ordertap_core::{ApplicationParser, InterceptedExchange, OrderUplink, SensitiveDataFilter};

use crate::ca::CertificateAuthority;
use crate::capture::{self, CaptureBuffer};
use crate::codec::{self, BodyFraming, RequestHead, ResponseHead};
use crate::domains::DomainAllowList;
use crate::error::{CodecError, ProxyError, Result};
use crate::io::{self as proxy_io, IdleClock, TimedStream};
use crate::tls;

/// Client connection before any TLS.
type ClientConn = BufReader<TimedStream<TcpStream>>;

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Content type of a TLS handshake record.
const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// Handler configuration.
pub struct HandlerConfig {
    /// Issues leaf certificates for intercepted hosts.
    pub authority: Arc<CertificateAuthority>,
    /// Hosts to decrypt.
    pub allow_list: DomainAllowList,
    /// Turns captured bodies into orders.
    pub parser: ApplicationParser,
    /// Receives extracted orders.
    pub uplink: Arc<dyn OrderUplink>,
    /// Applied to each order's raw body before submission.
    pub redactor: Option<SensitiveDataFilter>,
    /// TLS client configuration toward origins.
    pub client_tls: Arc<ClientConfig>,
    /// Idle timeout for every socket of a connection.
    pub idle_timeout: Duration,
    /// Largest body kept for parsing.
    pub capture_limit: usize,
}

impl std::fmt::Debug for HandlerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerConfig")
            .field("authority", &self.authority)
            .field("allow_list", &self.allow_list)
            .field("apps", &self.parser.registry().len())
            .field("redactor", &self.redactor.is_some())
            .field("idle_timeout", &self.idle_timeout)
            .field("capture_limit", &self.capture_limit)
            .finish()
    }
}

/// What happens to the connection after an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    KeepAlive,
    Close,
    /// `101 Switching Protocols`: relay the rest blindly.
    Upgraded,
}

/// Handles proxy connections. Cheap to clone.
#[derive(Clone, Debug)]
pub struct ConnectionHandler {
    config: Arc<HandlerConfig>,
    /// Order submissions still in flight.
    submissions: Arc<Mutex<JoinSet<()>>>,
}

impl ConnectionHandler {
    /// Creates a new handler with the given configuration.
    pub fn new(config: HandlerConfig) -> Self {
        Self {
            config: Arc::new(config),
            submissions: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    /// Waits up to `grace` for in-flight submissions, then aborts the rest.
    pub async fn drain_submissions(&self, grace: Duration) {
        let mut submissions = std::mem::take(&mut *self.submissions.lock());
        if submissions.is_empty() {
            return;
        }

        let pending = submissions.len();
        let drained = tokio::time::timeout(grace, async {
            while submissions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                "Aborting {} of {} order submissions after {:?}",
                submissions.len(),
                pending,
                grace
            );
            submissions.shutdown().await;
        }
    }

    /// Serves one accepted connection to completion.
    ///
    /// Errors end only this connection and are logged here.
    pub async fn handle(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = self.serve(stream).await {
            match &e {
                ProxyError::Io(io) if is_disconnect(io) => {
                    tracing::trace!("Connection from {} closed: {}", peer, e)
                }
                _ => tracing::debug!("Connection from {} ended: {}", peer, e),
            }
        }
    }

    async fn serve(&self, stream: TcpStream) -> Result<()> {
        let clock = IdleClock::new(self.config.idle_timeout);
        let mut client = BufReader::new(clock.wrap(stream));

        let head = match codec::read_request_head(&mut client).await {
            Ok(Some(head)) => head,
            Ok(None) => return Ok(()),
            Err(CodecError::StartLine(line)) => {
                tracing::debug!("Ignoring malformed request line {:?}", line);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if head.is_connect() {
            self.connect(client, head, clock).await
        } else {
            self.relay_plain(client, head, clock).await
        }
    }

    // =========================================================================
    // CONNECT
    // =========================================================================

    async fn connect(&self, mut client: ClientConn, head: RequestHead, clock: IdleClock) -> Result<()> {
        let Some((host, port)) = parse_connect_target(&head.target) else {
            tracing::debug!("Rejecting CONNECT to {:?}", head.target);
            write_status(&mut client, "400 Bad Request").await?;
            return Ok(());
        };

        client.write_all(CONNECT_ESTABLISHED).await?;
        client.flush().await?;

        if self.config.allow_list.contains(&host) {
            tracing::debug!("Intercepting {}:{}", host, port);
            self.intercept(client, host, port, clock).await
        } else {
            tracing::trace!("Tunneling {}:{}", host, port);
            self.blind_tunnel(client, &host, port, &clock).await
        }
    }

    async fn blind_tunnel(
        &self,
        mut client: ClientConn,
        host: &str,
        port: u16,
        clock: &IdleClock,
    ) -> Result<()> {
        let mut origin = clock.wrap(connect_origin(host, port, clock).await?);
        let (up, down) = proxy_io::tunnel(&mut client, &mut origin).await?;
        tracing::trace!("Tunnel to {}:{} closed ({} up, {} down)", host, port, up, down);
        Ok(())
    }

    async fn intercept(&self, mut client: ClientConn, host: String, port: u16, clock: IdleClock) -> Result<()> {
        let authority = Arc::clone(&self.config.authority);
        let leaf_host = host.clone();
        let leaf = match tokio::task::spawn_blocking(move || authority.issue_leaf(&leaf_host)).await {
            Ok(Ok(leaf)) => leaf,
            Ok(Err(e)) => {
                tracing::warn!("No certificate for {}, tunneling: {}", host, e);
                return self.blind_tunnel(client, &host, port, &clock).await;
            }
            Err(e) => {
                tracing::warn!("Certificate task for {} failed, tunneling: {}", host, e);
                return self.blind_tunnel(client, &host, port, &clock).await;
            }
        };

        let origin = match self.connect_origin_tls(&host, port, &clock).await {
            Ok(origin) => origin,
            Err(e) => {
                tracing::debug!("Origin handshake with {} failed, tunneling: {}", host, e);
                return self.blind_tunnel(client, &host, port, &clock).await;
            }
        };

        // Peeked bytes stay buffered for whichever path consumes them.
        let first = client.fill_buf().await?;
        if first.is_empty() {
            return Ok(());
        }
        if !looks_like_tls(first) {
            drop(origin);
            tracing::debug!("Client of {} did not start TLS, tunneling", host);
            return self.blind_tunnel(client, &host, port, &clock).await;
        }

        let acceptor = TlsAcceptor::from(leaf.server_config());
        let client = match acceptor.accept(client).await {
            Ok(tls) => tls,
            Err(e) => {
                tracing::debug!("Client handshake for {} failed: {}", host, e);
                return Ok(());
            }
        };

        let mut client = BufReader::new(client);
        let mut origin = BufReader::new(origin);
        self.forward_loop(&mut client, &mut origin, &host).await?;
        let _ = client.shutdown().await;
        Ok(())
    }

    async fn connect_origin_tls(
        &self,
        host: &str,
        port: u16,
        clock: &IdleClock,
    ) -> Result<tokio_rustls::client::TlsStream<TimedStream<TcpStream>>> {
        let server_name = tls::server_name(host)?;
        let tcp = connect_origin(host, port, clock).await?;
        let connector = TlsConnector::from(Arc::clone(&self.config.client_tls));
        connector
            .connect(server_name, clock.wrap(tcp))
            .await
            .map_err(|e| ProxyError::Handshake {
                leg: "origin",
                reason: e.to_string(),
            })
    }

    /// Relays request/response pairs until either side closes.
    async fn forward_loop<C, O>(&self, client: &mut C, origin: &mut O, host: &str) -> Result<()>
    where
        C: AsyncBufRead + AsyncWrite + Unpin,
        O: AsyncBufRead + AsyncWrite + Unpin,
    {
        loop {
            let Some(request) = codec::read_request_head(client).await? else {
                return Ok(());
            };
            origin.write_all(request.raw()).await?;

            let path = request_path(&request.target);
            match self.exchange(client, origin, host, &path, &request).await? {
                Outcome::KeepAlive => continue,
                Outcome::Close => return Ok(()),
                Outcome::Upgraded => {
                    proxy_io::tunnel(client, origin).await?;
                    return Ok(());
                }
            }
        }
    }

    // =========================================================================
    // Plain HTTP
    // =========================================================================

    async fn relay_plain(&self, mut client: ClientConn, head: RequestHead, clock: IdleClock) -> Result<()> {
        let Some(target) = PlainTarget::parse(&head.target) else {
            tracing::debug!("Rejecting {} {:?}", head.method, head.target);
            write_status(&mut client, "400 Bad Request").await?;
            return Ok(());
        };

        let origin = match connect_origin(&target.host, target.port, &clock).await {
            Ok(origin) => origin,
            Err(e) => {
                tracing::debug!("Cannot reach {}:{}: {}", target.host, target.port, e);
                write_status(&mut client, "502 Bad Gateway").await?;
                return Ok(());
            }
        };
        let mut origin = BufReader::new(clock.wrap(origin));
        origin
            .write_all(&head.encode_with_target(&target.path))
            .await?;

        if self
            .exchange(&mut client, &mut origin, &target.host, &target.path, &head)
            .await?
            == Outcome::Upgraded
        {
            proxy_io::tunnel(&mut client, &mut origin).await?;
        }
        let _ = client.shutdown().await;
        Ok(())
    }

    // =========================================================================
    // Exchange
    // =========================================================================

    /// Relays the rest of one request (its head is already sent) and the
    /// response(s) to it, capturing the final response when eligible.
    async fn exchange<C, O>(
        &self,
        client: &mut C,
        origin: &mut O,
        host: &str,
        path: &str,
        request: &RequestHead,
    ) -> Result<Outcome>
    where
        C: AsyncBufRead + AsyncWrite + Unpin,
        O: AsyncBufRead + AsyncWrite + Unpin,
    {
        let request_framing = BodyFraming::for_request(request)?;
        let mut body_pending = request_framing != BodyFraming::Empty;

        if body_pending && request.headers.has_token("expect", "100-continue") {
            // Wait for the origin's answer, or for a client that sends the
            // body without waiting.
            origin.flush().await?;
            let origin_first = tokio::select! {
                biased;
                ready = origin.fill_buf() => ready.map(|_| true)?,
                ready = client.fill_buf() => ready.map(|_| false)?,
            };
            if !origin_first {
                codec::relay_body(client, origin, request_framing, &mut CaptureBuffer::disabled()).await?;
                body_pending = false;
            }
        } else if body_pending {
            codec::relay_body(client, origin, request_framing, &mut CaptureBuffer::disabled()).await?;
            body_pending = false;
        }
        origin.flush().await?;

        loop {
            let response = codec::read_response_head(origin)
                .await?
                .ok_or(CodecError::UnexpectedEof)?;
            client.write_all(response.raw()).await?;

            if response.status == 101 {
                client.flush().await?;
                return Ok(Outcome::Upgraded);
            }
            if response.is_interim() {
                client.flush().await?;
                if body_pending && response.status == 100 {
                    codec::relay_body(client, origin, request_framing, &mut CaptureBuffer::disabled()).await?;
                    origin.flush().await?;
                    body_pending = false;
                }
                continue;
            }

            let framing = BodyFraming::for_response(&response, &request.method)?;
            let mut capture = if self.config.allow_list.contains(host)
                && capture::wants_body(response.headers.get("content-type"))
            {
                CaptureBuffer::new(self.config.capture_limit)
            } else {
                CaptureBuffer::disabled()
            };

            codec::relay_body(origin, client, framing, &mut capture).await?;
            client.flush().await?;

            if capture.is_truncated() {
                tracing::debug!(
                    "Response from {}{} exceeds {} bytes, not captured",
                    host,
                    path,
                    self.config.capture_limit
                );
            }
            if let Some(body) = capture.into_body() {
                self.capture(host, path, request, &response, body);
            }

            // A body the origin never asked for leaves the client stream unframed.
            let close = body_pending
                || request.wants_close()
                || response.wants_close()
                || framing == BodyFraming::UntilEof;
            return Ok(if close { Outcome::Close } else { Outcome::KeepAlive });
        }
    }

    /// Parses a captured response and hands any order to the uplink.
    fn capture(&self, host: &str, path: &str, request: &RequestHead, response: &ResponseHead, body: Vec<u8>) {
        let Some(body) = capture::decode_content(
            response.headers.get("content-encoding"),
            body,
            self.config.capture_limit,
        ) else {
            return;
        };
        let content_type = response.headers.get("content-type");
        if !capture::is_capturable(content_type, &body) {
            tracing::trace!("Response from {}{} is not JSON", host, path);
            return;
        }

        let exchange = InterceptedExchange {
            hostname: host.to_string(),
            path: path.to_string(),
            method: request.method.clone(),
            request_headers: request.headers.to_vec(),
            status: response.status,
            response_headers: response.headers.to_vec(),
            body,
            timestamp: Utc::now(),
        };

        let Some(mut order) = self.config.parser.parse_exchange(&exchange) else {
            return;
        };
        if let Some(redactor) = &self.config.redactor {
            order.raw_body = redactor.redact_json_text(&order.raw_body);
        }

        tracing::info!(
            "Captured {} order {} from {}{} ({})",
            order.source_app,
            order.order_id,
            host,
            path,
            order.status
        );

        let uplink = Arc::clone(&self.config.uplink);
        let mut submissions = self.submissions.lock();
        while submissions.try_join_next().is_some() {}
        submissions.spawn(async move {
            if let Err(e) = uplink.submit(order).await {
                tracing::warn!("Failed to submit order: {}", e);
            }
        });
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Target of a plain-HTTP proxy request.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PlainTarget {
    host: String,
    port: u16,
    /// Origin-form target (path and query).
    path: String,
}

impl PlainTarget {
    /// Parses an absolute `http://` URI.
    fn parse(target: &str) -> Option<Self> {
        let uri: Uri = target.parse().ok()?;
        if uri.scheme() != Some(&Scheme::HTTP) {
            return None;
        }
        let host = strip_brackets(uri.host()?);
        if host.is_empty() {
            return None;
        }
        Some(Self {
            host: host.to_string(),
            port: uri.port_u16().unwrap_or(80),
            path: uri
                .path_and_query()
                .map(|pq| pq.as_str())
                .filter(|pq| !pq.is_empty())
                .unwrap_or("/")
                .to_string(),
        })
    }
}

/// Parses `host:port` from a CONNECT request. The port defaults to 443.
fn parse_connect_target(target: &str) -> Option<(String, u16)> {
    let authority: Authority = target.parse().ok()?;
    let host = strip_brackets(authority.host());
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), authority.port_u16().unwrap_or(443)))
}

/// True if `first` starts a TLS handshake record.
fn looks_like_tls(first: &[u8]) -> bool {
    first.first() == Some(&TLS_HANDSHAKE_RECORD)
}

fn strip_brackets(host: &str) -> &str {
    host.trim_start_matches('[').trim_end_matches(']')
}

/// Path and query of a request target, whatever its form.
fn request_path(target: &str) -> String {
    if target.starts_with('/') {
        return target.to_string();
    }
    target
        .parse::<Uri>()
        .ok()
        .and_then(|uri| uri.path_and_query().map(|pq| pq.as_str().to_string()))
        .filter(|pq| pq.starts_with('/'))
        .unwrap_or_else(|| "/".to_string())
}

async fn connect_origin(host: &str, port: u16, clock: &IdleClock) -> std::io::Result<TcpStream> {
    let stream = tokio::time::timeout(clock.timeout(), TcpStream::connect((host, port)))
        .await
        .map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect to {}:{} timed out", host, port),
            )
        })??;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Writes a minimal response and leaves the connection to be closed.
async fn write_status<W>(writer: &mut W, status: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        status.len(),
        status
    );
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await
}

fn is_disconnect(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_target_parsing() {
        assert_eq!(
            parse_connect_target("api.jahez.net:443"),
            Some(("api.jahez.net".to_string(), 443))
        );
        assert_eq!(
            parse_connect_target("api.jahez.net"),
            Some(("api.jahez.net".to_string(), 443))
        );
        assert_eq!(
            parse_connect_target("[::1]:8443"),
            Some(("::1".to_string(), 8443))
        );
        assert_eq!(parse_connect_target("a b:443"), None);
        assert_eq!(parse_connect_target(""), None);
    }

    #[test]
    fn plain_target_parsing() {
        assert_eq!(
            PlainTarget::parse("http://example.com/a/b?c=1"),
            Some(PlainTarget {
                host: "example.com".into(),
                port: 80,
                path: "/a/b?c=1".into(),
            })
        );
        assert_eq!(
            PlainTarget::parse("http://example.com:8080"),
            Some(PlainTarget {
                host: "example.com".into(),
                port: 8080,
                path: "/".into(),
            })
        );
        assert_eq!(PlainTarget::parse("/relative"), None);
        assert_eq!(PlainTarget::parse("https://example.com/"), None);
    }

    #[test]
    fn request_path_forms() {
        assert_eq!(request_path("/orders?id=1"), "/orders?id=1");
        assert_eq!(request_path("https://api.jahez.net/orders"), "/orders");
        assert_eq!(request_path("*"), "/");
        assert_eq!(request_path("api.jahez.net:443"), "/");
        assert_eq!(request_path("http://api.jahez.net"), "/");
    }

    #[test]
    fn tls_record_detection() {
        assert!(looks_like_tls(&[0x16, 0x03, 0x01, 0x02, 0x00]));
        assert!(!looks_like_tls(b"GET / HTTP/1.1\r\n"));
        assert!(!looks_like_tls(&[0x15, 0x03, 0x03]));
        assert!(!looks_like_tls(&[]));
    }
}
