//! Error types for the proxy.

use std::net::SocketAddr;

use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Certificate authority error.
    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS handshake failed on one leg of an intercepted connection.
    #[error("Handshake error ({leg}): {reason}")]
    Handshake {
        /// `client` or `origin`.
        leg: &'static str,
        /// Failure detail.
        reason: String,
    },

    /// Malformed HTTP framing.
    #[error("Connection error: {0}")]
    Codec(#[from] CodecError),

    /// The listening socket could not be bound.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Certificate authority error type.
#[derive(Debug, Error)]
pub enum CertificateError {
    /// Failed to generate a key or certificate.
    #[error("Failed to generate certificate: {0}")]
    Generation(String),

    /// Failed to read or write CA files.
    #[error("CA storage error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted CA material is unreadable.
    #[error("Failed to parse CA: {0}")]
    Parse(String),

    /// Only one of the certificate and key files exists.
    #[error("Incomplete CA storage: {0}")]
    Incomplete(String),

    /// The hostname cannot be placed in a certificate.
    #[error("Invalid hostname: {0}")]
    InvalidHost(String),

    /// Failed to build the TLS server configuration for a leaf.
    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),
}

/// HTTP/1.1 framing error type.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Start line plus headers exceeded the size limit.
    #[error("Message head exceeds {0} bytes")]
    HeadTooLarge(usize),

    /// Start line could not be parsed.
    #[error("Malformed start line: {0:?}")]
    StartLine(String),

    /// Header line could not be parsed.
    #[error("Malformed header: {0:?}")]
    Header(String),

    /// Content-Length is not a number or conflicts with another.
    #[error("Invalid Content-Length: {0:?}")]
    ContentLength(String),

    /// Chunk size line or chunk terminator is malformed.
    #[error("Invalid chunk: {0:?}")]
    Chunk(String),

    /// Decoded body exceeded the read limit.
    #[error("Body exceeds {0} bytes")]
    BodyTooLarge(usize),

    /// The peer closed the stream in the middle of a message.
    #[error("Unexpected end of stream")]
    UnexpectedEof,

    /// IO error while reading or writing a message.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
