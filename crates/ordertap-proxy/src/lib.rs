//! Ordertap Proxy - TLS-intercepting HTTP/1.1 proxy for delivery apps.
//!
//! Accepts `CONNECT` and plain absolute-URI requests on a loopback port.
//! Traffic to allow-listed delivery domains is decrypted with per-host
//! certificates signed by a local root, relayed verbatim, and JSON
//! responses are handed to the [`ApplicationParser`](ordertap_core::ApplicationParser).
//! Orders it extracts go to an [`OrderUplink`](ordertap_core::OrderUplink).
//!
//! ## Architecture
//!
//! ```text
//! Client → Acceptor → Handler ─┬─ allow-listed ─→ Leaf (CA) → TLS ⇄ TLS → Relay ─→ Parser → Uplink
//!                              └─ otherwise ────→ Tunnel
//! ```
//!
//! Everything else is relayed byte-for-byte. No certificate work is done for
//! hosts outside the allow-list.

mod ca;
mod capture;
mod codec;
mod domains;
mod error;
mod handler;
mod io;
mod proxy;
mod tls;

pub use ca::{CertificateAuthority, HostCertificate, CA_CERT_FILE, CA_KEY_FILE};
pub use capture::{decode_content, is_capturable, wants_body, CaptureBuffer, DEFAULT_CAPTURE_LIMIT};
pub use codec::{
    read_body, read_request_head, read_response_head, relay_body, BodyFraming, Headers,
    RequestHead, ResponseHead, MAX_HEAD_SIZE,
};
pub use domains::{DomainAllowList, DELIVERY_DOMAINS};
pub use error::{CertificateError, CodecError, ProxyError, Result};
pub use handler::{ConnectionHandler, HandlerConfig};
pub use io::{tunnel, IdleClock, TimedStream};
pub use proxy::{ProxyConfig, ProxyHandle, ProxyServer, DEFAULT_IDLE_TIMEOUT};
pub use tls::{build_client_config, UpstreamTrust};

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 8888;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port() {
        assert_eq!(DEFAULT_PROXY_PORT, 8888);
    }
}
