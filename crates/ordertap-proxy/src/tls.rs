//! TLS client configuration for the origin leg.

use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::error::{ProxyError, Result};

/// How the proxy verifies origin certificates.
#[derive(Debug, Clone, Default)]
pub enum UpstreamTrust {
    /// Bundled Mozilla root set.
    #[default]
    WebPki,
    /// Bundled roots plus these extra roots.
    WithRoots(Vec<CertificateDer<'static>>),
    /// Accept any certificate.
    AcceptAny,
}

impl UpstreamTrust {
    /// Adds the certificates of a PEM file to the bundled roots.
    pub fn with_pem_file(path: impl AsRef<Path>) -> Result<Self> {
        let pem = std::fs::read(path.as_ref())?;
        let roots = rustls_pemfile::certs(&mut pem.as_slice()).collect::<std::io::Result<Vec<_>>>()?;
        if roots.is_empty() {
            return Err(ProxyError::Config(format!(
                "no certificates in {:?}",
                path.as_ref()
            )));
        }
        Ok(Self::WithRoots(roots))
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Builds the client configuration used toward origins.
///
/// Only `http/1.1` is offered over ALPN.
pub fn build_client_config(trust: &UpstreamTrust) -> Result<Arc<ClientConfig>> {
    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Config(e.to_string()))?;

    let mut config = match trust {
        UpstreamTrust::AcceptAny => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_no_client_auth(),
        UpstreamTrust::WebPki | UpstreamTrust::WithRoots(_) => {
            let mut roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            if let UpstreamTrust::WithRoots(extra) = trust {
                for cert in extra {
                    roots
                        .add(cert.clone())
                        .map_err(|e| ProxyError::Config(format!("invalid root: {}", e)))?;
                }
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        }
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// SNI for the origin handshake.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string()).map_err(|_| ProxyError::Handshake {
        leg: "origin",
        reason: format!("invalid server name {:?}", host),
    })
}

#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_each_trust_mode() {
        for trust in [
            UpstreamTrust::WebPki,
            UpstreamTrust::AcceptAny,
            UpstreamTrust::WithRoots(Vec::new()),
        ] {
            let config = build_client_config(&trust).unwrap();
            assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
        }
    }

    #[test]
    fn pem_file_without_certificates_is_rejected() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("roots.pem");
        std::fs::write(&path, "nothing here").unwrap();
        assert!(matches!(
            UpstreamTrust::with_pem_file(&path),
            Err(ProxyError::Config(_))
        ));
    }

    #[test]
    fn server_name_accepts_dns_and_ip() {
        assert!(server_name("api.jahez.net").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("bad host").is_err());
    }
}
