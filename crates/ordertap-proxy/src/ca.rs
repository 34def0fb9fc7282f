//! Certificate authority for TLS interception.
//!
//! Owns the root CA used to sign per-host leaf certificates. The root is
//! generated on first run and persisted as two PEM files; later runs load it.
//! Leaves are issued lazily, once per hostname, and cached for the life of the
//! process together with a ready-to-use rustls server configuration.

use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType, PKCS_RSA_SHA256,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use time::{Duration, OffsetDateTime};

use ordertap_core::normalize_host;

use crate::error::CertificateError;

/// File name of the persisted root certificate.
pub const CA_CERT_FILE: &str = "ordertap-ca.crt";
/// File name of the persisted root private key.
pub const CA_KEY_FILE: &str = "ordertap-ca.key";

const ROOT_COMMON_NAME: &str = "Ordertap Root CA";
const ROOT_ORGANIZATION: &str = "Ordertap Agent";
const ROOT_COUNTRY: &str = "SA";

const ROOT_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 365;
/// Backdating for clients with a slow clock.
const NOT_BEFORE_SKEW: Duration = Duration::minutes(5);

type CertResult<T> = std::result::Result<T, CertificateError>;

/// A leaf certificate issued for one hostname.
#[derive(Debug)]
pub struct HostCertificate {
    hostname: String,
    cert_der: CertificateDer<'static>,
    server_config: Arc<ServerConfig>,
}

impl HostCertificate {
    /// Returns the hostname the certificate was issued for.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Returns the leaf certificate in DER form.
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// Returns the TLS server configuration presenting this leaf and the root.
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.server_config)
    }
}

/// Root CA plus the per-host leaf cache.
pub struct CertificateAuthority {
    ca_dir: PathBuf,
    issuer: Issuer<'static, KeyPair>,
    root_der: CertificateDer<'static>,
    leaves: RwLock<HashMap<String, Arc<HostCertificate>>>,
    /// Serializes leaf generation.
    issuing: Mutex<()>,
    leaves_issued: AtomicU64,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("ca_dir", &self.ca_dir)
            .field("cached_leaves", &self.cached_leaf_count())
            .field("leaves_issued", &self.leaves_issued())
            .finish()
    }
}

impl CertificateAuthority {
    /// Loads the root CA from `ca_dir`, generating and persisting it if absent.
    ///
    /// Fails if only one of the two files exists or if either is unreadable.
    pub fn initialize(ca_dir: impl AsRef<Path>) -> CertResult<Self> {
        let ca_dir = ca_dir.as_ref().to_path_buf();
        let cert_path = ca_dir.join(CA_CERT_FILE);
        let key_path = ca_dir.join(CA_KEY_FILE);

        let (issuer, root_der) = match (cert_path.exists(), key_path.exists()) {
            (true, true) => {
                let loaded = load_root(&cert_path, &key_path)?;
                tracing::info!("Loaded CA certificate from {:?}", cert_path);
                loaded
            }
            (false, false) => {
                fs::create_dir_all(&ca_dir)?;
                let generated = generate_root(&cert_path, &key_path)?;
                tracing::info!("Generated new CA certificate at {:?}", cert_path);
                generated
            }
            (true, false) => {
                return Err(CertificateError::Incomplete(format!(
                    "{:?} exists without {:?}",
                    cert_path, key_path
                )))
            }
            (false, true) => {
                return Err(CertificateError::Incomplete(format!(
                    "{:?} exists without {:?}",
                    key_path, cert_path
                )))
            }
        };

        Ok(Self {
            ca_dir,
            issuer,
            root_der,
            leaves: RwLock::new(HashMap::new()),
            issuing: Mutex::new(()),
            leaves_issued: AtomicU64::new(0),
        })
    }

    /// Returns the path to the CA certificate file.
    pub fn cert_path(&self) -> PathBuf {
        self.ca_dir.join(CA_CERT_FILE)
    }

    /// Returns the path to the CA private key file.
    pub fn key_path(&self) -> PathBuf {
        self.ca_dir.join(CA_KEY_FILE)
    }

    /// Returns the root certificate in DER form.
    pub fn root_der(&self) -> &CertificateDer<'static> {
        &self.root_der
    }

    /// Returns the root certificate as PEM, for installation on clients.
    pub fn export_root_pem(&self) -> String {
        let block = pem::Pem::new("CERTIFICATE", self.root_der.to_vec());
        pem::encode_config(
            &block,
            pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
        )
    }

    /// Writes the root certificate PEM to `path`.
    pub fn export_root_pem_to(&self, path: impl AsRef<Path>) -> CertResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.export_root_pem())?;
        tracing::info!("Exported CA certificate to {:?}", path);
        Ok(())
    }

    /// Returns the leaf for `hostname`, issuing it on first use.
    ///
    /// At most one leaf is ever generated per hostname, even when many
    /// connections ask for it at once. This call does blocking key generation;
    /// async callers should run it on the blocking pool.
    pub fn issue_leaf(&self, hostname: &str) -> CertResult<Arc<HostCertificate>> {
        let hostname = normalize_host(hostname);
        if hostname.is_empty() {
            return Err(CertificateError::InvalidHost(hostname));
        }

        if let Some(leaf) = self.leaves.read().get(&hostname) {
            return Ok(Arc::clone(leaf));
        }

        let _issuing = self.issuing.lock();
        if let Some(leaf) = self.leaves.read().get(&hostname) {
            return Ok(Arc::clone(leaf));
        }

        let leaf = Arc::new(self.sign_leaf(&hostname)?);
        self.leaves_issued.fetch_add(1, Ordering::Relaxed);
        self.leaves
            .write()
            .insert(hostname.clone(), Arc::clone(&leaf));
        tracing::debug!("Issued leaf certificate for {}", hostname);

        Ok(leaf)
    }

    /// Number of leaf signing operations performed.
    pub fn leaves_issued(&self) -> u64 {
        self.leaves_issued.load(Ordering::Relaxed)
    }

    /// Number of hostnames with a cached leaf.
    pub fn cached_leaf_count(&self) -> usize {
        self.leaves.read().len()
    }

    fn sign_leaf(&self, hostname: &str) -> CertResult<HostCertificate> {
        let params = leaf_params(hostname)?;
        let key_pair = KeyPair::generate_for(&PKCS_RSA_SHA256)
            .map_err(|e| CertificateError::Generation(e.to_string()))?;
        let cert = params
            .signed_by(&key_pair, &self.issuer)
            .map_err(|e| CertificateError::Generation(e.to_string()))?;

        let cert_der = cert.der().clone();
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let chain = vec![cert_der.clone(), self.root_der.clone()];

        let mut server_config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::aws_lc_rs::default_provider(),
        ))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(chain, key_der)?;
        server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(HostCertificate {
            hostname: hostname.to_string(),
            cert_der,
            server_config: Arc::new(server_config),
        })
    }
}

fn root_params() -> CertificateParams {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, ROOT_COMMON_NAME);
    dn.push(DnType::OrganizationName, ROOT_ORGANIZATION);
    dn.push(DnType::CountryName, ROOT_COUNTRY);
    params.distinguished_name = dn;

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params.serial_number = Some(random_serial().into());

    let now = OffsetDateTime::now_utc();
    params.not_before = now - NOT_BEFORE_SKEW;
    params.not_after = now + Duration::days(ROOT_VALIDITY_DAYS);
    params
}

fn leaf_params(hostname: &str) -> CertResult<CertificateParams> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    params.distinguished_name = dn;

    params.subject_alt_names = match hostname.parse::<IpAddr>() {
        Ok(ip) => vec![SanType::IpAddress(ip)],
        Err(_) => vec![SanType::DnsName(
            hostname
                .try_into()
                .map_err(|_| CertificateError::InvalidHost(hostname.to_string()))?,
        )],
    };

    params.is_ca = IsCa::NoCa;
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.serial_number = Some(random_serial().into());

    let now = OffsetDateTime::now_utc();
    params.not_before = now - NOT_BEFORE_SKEW;
    params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);
    Ok(params)
}

/// Positive 63-bit serial.
fn random_serial() -> u64 {
    rand::thread_rng().gen_range(1..=i64::MAX as u64)
}

fn generate_root(
    cert_path: &Path,
    key_path: &Path,
) -> CertResult<(Issuer<'static, KeyPair>, CertificateDer<'static>)> {
    let key_pair = KeyPair::generate_for(&PKCS_RSA_SHA256)
        .map_err(|e| CertificateError::Generation(e.to_string()))?;
    let params = root_params();
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertificateError::Generation(e.to_string()))?;

    fs::write(cert_path, cert.pem())?;
    write_private(key_path, key_pair.serialize_pem().as_bytes())?;

    let root_der = cert.der().clone();
    Ok((Issuer::new(params, key_pair), root_der))
}

fn load_root(
    cert_path: &Path,
    key_path: &Path,
) -> CertResult<(Issuer<'static, KeyPair>, CertificateDer<'static>)> {
    let cert_pem = fs::read(cert_path)?;
    let key_pem = fs::read_to_string(key_path)?;

    let root_der = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .next()
        .ok_or_else(|| CertificateError::Parse(format!("no certificate in {:?}", cert_path)))?
        .map_err(|e| CertificateError::Parse(e.to_string()))?;

    let key_pair = KeyPair::from_pem(&key_pem).map_err(|e| CertificateError::Parse(e.to_string()))?;
    let issuer = Issuer::from_ca_cert_der(&root_der, key_pair)
        .map_err(|e| CertificateError::Parse(e.to_string()))?;

    Ok((issuer, root_der))
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    fs::write(path, contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use x509_parser::extensions::GeneralName;
    use x509_parser::parse_x509_certificate;

    fn authority(dir: &TempDir) -> CertificateAuthority {
        CertificateAuthority::initialize(dir.path().join("ca")).unwrap()
    }

    #[test]
    fn paths_use_ca_dir() {
        let temp_dir = TempDir::new().unwrap();
        let ca = authority(&temp_dir);
        assert_eq!(ca.cert_path(), temp_dir.path().join("ca/ordertap-ca.crt"));
        assert_eq!(ca.key_path(), temp_dir.path().join("ca/ordertap-ca.key"));
        assert!(ca.cert_path().exists());
        assert!(ca.key_path().exists());
    }

    #[test]
    fn root_is_rsa_ca() {
        let temp_dir = TempDir::new().unwrap();
        let ca = authority(&temp_dir);
        let (_, root) = parse_x509_certificate(ca.root_der()).unwrap();

        assert!(root.is_ca());
        let cn = root.subject().iter_common_name().next().unwrap();
        assert_eq!(cn.as_str().unwrap(), ROOT_COMMON_NAME);

        let usage = root.key_usage().unwrap().unwrap().value;
        assert!(usage.key_cert_sign());
        assert!(usage.crl_sign());

        let validity = root.validity().time_to_expiration().unwrap();
        assert!(validity.whole_days() > 3600);

        // RSA-2048 modulus
        let key = root.public_key().parsed().unwrap();
        assert_eq!(key.key_size(), 2048);
    }

    #[test]
    fn reload_keeps_identity() {
        let temp_dir = TempDir::new().unwrap();
        let first = authority(&temp_dir);
        let first_der = first.root_der().clone();
        drop(first);

        let second = authority(&temp_dir);
        let (_, a) = parse_x509_certificate(&first_der).unwrap();
        let (_, b) = parse_x509_certificate(second.root_der()).unwrap();

        assert_eq!(a.raw_serial(), b.raw_serial());
        assert_eq!(a.subject().to_string(), b.subject().to_string());
        assert_eq!(a.public_key().raw, b.public_key().raw);
    }

    #[test]
    fn reloaded_root_signs_verifiable_leaves() {
        let temp_dir = TempDir::new().unwrap();
        drop(authority(&temp_dir));
        let ca = authority(&temp_dir);

        let leaf = ca.issue_leaf("api.jahez.net").unwrap();
        let (_, root) = parse_x509_certificate(ca.root_der()).unwrap();
        let (_, cert) = parse_x509_certificate(leaf.cert_der()).unwrap();
        assert!(cert.verify_signature(Some(root.public_key())).is_ok());
        assert_eq!(cert.issuer().to_string(), root.subject().to_string());
    }

    #[test]
    fn incomplete_storage_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let ca = authority(&temp_dir);
        fs::remove_file(ca.key_path()).unwrap();

        let result = CertificateAuthority::initialize(temp_dir.path().join("ca"));
        assert!(matches!(result, Err(CertificateError::Incomplete(_))));
    }

    #[test]
    fn corrupt_storage_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let ca = authority(&temp_dir);
        fs::write(ca.cert_path(), "not a certificate").unwrap();

        let result = CertificateAuthority::initialize(temp_dir.path().join("ca"));
        assert!(matches!(result, Err(CertificateError::Parse(_))));
    }

    #[test]
    fn export_root_pem_round_trips() {
        let temp_dir = TempDir::new().unwrap();
        let ca = authority(&temp_dir);

        let exported = ca.export_root_pem();
        assert!(exported.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(exported.trim_end().ends_with("-----END CERTIFICATE-----"));

        let parsed = pem::parse(&exported).unwrap();
        assert_eq!(parsed.contents(), ca.root_der().as_ref());

        let out = temp_dir.path().join("export/root.pem");
        ca.export_root_pem_to(&out).unwrap();
        assert_eq!(fs::read_to_string(out).unwrap(), exported);
    }

    #[test]
    fn distinct_hosts_get_distinct_leaves() {
        let temp_dir = TempDir::new().unwrap();
        let ca = authority(&temp_dir);
        let (_, root) = parse_x509_certificate(ca.root_der()).unwrap();

        let a = ca.issue_leaf("a.example").unwrap();
        let b = ca.issue_leaf("b.example").unwrap();
        assert_ne!(a.cert_der(), b.cert_der());
        assert_eq!(ca.leaves_issued(), 2);

        for (leaf, host) in [(&a, "a.example"), (&b, "b.example")] {
            let (_, cert) = parse_x509_certificate(leaf.cert_der()).unwrap();
            assert!(cert.verify_signature(Some(root.public_key())).is_ok());
            assert!(!cert.is_ca());

            let cn = cert.subject().iter_common_name().next().unwrap();
            assert_eq!(cn.as_str().unwrap(), host);

            let san = cert.subject_alternative_name().unwrap().unwrap();
            assert!(san
                .value
                .general_names
                .iter()
                .any(|name| matches!(name, GeneralName::DNSName(dns) if *dns == host)));

            let days = cert.validity().time_to_expiration().unwrap().whole_days();
            assert!((360..=366).contains(&days));
        }
    }

    #[test]
    fn leaf_cache_normalizes_hostnames() {
        let temp_dir = TempDir::new().unwrap();
        let ca = authority(&temp_dir);

        let a = ca.issue_leaf("API.Jahez.net").unwrap();
        let b = ca.issue_leaf("api.jahez.net").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.hostname(), "api.jahez.net");
        assert_eq!(ca.cached_leaf_count(), 1);
        assert_eq!(ca.leaves_issued(), 1);
    }

    #[test]
    fn ip_hosts_get_ip_san() {
        let temp_dir = TempDir::new().unwrap();
        let ca = authority(&temp_dir);

        let leaf = ca.issue_leaf("127.0.0.1").unwrap();
        let (_, cert) = parse_x509_certificate(leaf.cert_der()).unwrap();
        let san = cert.subject_alternative_name().unwrap().unwrap();
        assert!(san
            .value
            .general_names
            .iter()
            .any(|name| matches!(name, GeneralName::IPAddress(ip) if *ip == [127, 0, 0, 1])));
    }

    #[test]
    fn empty_host_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let ca = authority(&temp_dir);
        assert!(matches!(
            ca.issue_leaf(""),
            Err(CertificateError::InvalidHost(_))
        ));
        assert_eq!(ca.leaves_issued(), 0);
    }

    #[test]
    fn concurrent_first_use_issues_once() {
        let temp_dir = TempDir::new().unwrap();
        let ca = authority(&temp_dir);

        let leaves: Vec<Arc<HostCertificate>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| ca.issue_leaf("api.toyou.io").unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(ca.leaves_issued(), 1);
        assert_eq!(ca.cached_leaf_count(), 1);
        for leaf in &leaves[1..] {
            assert!(Arc::ptr_eq(&leaves[0], leaf));
            assert_eq!(leaves[0].cert_der(), leaf.cert_der());
        }
    }
}
