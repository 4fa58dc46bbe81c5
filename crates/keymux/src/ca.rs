//! The MITM certificate authority.
//!
//! A long-lived self-signed root is loaded from disk at startup, or
//! generated on first run and written atomically with restrictive key
//! permissions. Per-host leaf certificates are minted on demand, wrapped in
//! a ready-to-serve `rustls::ServerConfig` whose chain is `[leaf, root]`,
//! and memoized by hostname. The operator installs the root certificate
//! into client trust stores.
//!
//! Root and leaves both use RSA-2048, matching the PEM material the
//! deployment contract expects on disk (`CERTIFICATE` and
//! `RSA PRIVATE KEY` blocks).

use crate::error::{ProxyError, Result};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Root certificate file name inside the CA directory.
const CA_CERT_FILE: &str = "goproxy_ca_cert.pem";
/// Root private key file name inside the CA directory.
const CA_KEY_FILE: &str = "goproxy_ca_key.pem";

/// Root validity: 10 years.
const ROOT_VALIDITY_DAYS: i64 = 3650;
/// Leaf validity: 1 year, backdated 1 hour for client clock skew.
const LEAF_VALIDITY_DAYS: i64 = 365;
const LEAF_BACKDATE_HOURS: i64 = 1;

const RSA_BITS: usize = 2048;

/// Loads or mints the root, issues per-host leaves, memoizes them.
pub struct CertificateAuthority {
    root: rcgen::Certificate,
    root_key: KeyPair,
    root_der: CertificateDer<'static>,
    root_pem: String,
    leaf_cache: Mutex<HashMap<String, Arc<ServerConfig>>>,
}

impl CertificateAuthority {
    /// Load the root from `dir`, generating and persisting one when the
    /// directory holds no material yet. Present-but-corrupt material is a
    /// hard error so the process refuses to start rather than silently
    /// minting a second root.
    pub fn open(dir: &Path) -> Result<Self> {
        let cert_path = dir.join(CA_CERT_FILE);
        let key_path = dir.join(CA_KEY_FILE);

        if cert_path.exists() || key_path.exists() {
            Self::load(&cert_path, &key_path)
        } else {
            Self::generate(dir, &cert_path, &key_path)
        }
    }

    fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = fs::read_to_string(cert_path)
            .map_err(|e| ProxyError::Ca(format!("cannot read {}: {}", cert_path.display(), e)))?;
        let key_pem = Zeroizing::new(
            fs::read_to_string(key_path)
                .map_err(|e| ProxyError::Ca(format!("cannot read {}: {}", key_path.display(), e)))?,
        );

        let rsa_key = RsaPrivateKey::from_pkcs1_pem(key_pem.trim())
            .map_err(|e| ProxyError::Ca(format!("corrupt CA key material: {}", e)))?;
        let root_key = rcgen_key(&rsa_key)?;

        let params = CertificateParams::from_ca_cert_pem(&cert_pem)
            .map_err(|e| ProxyError::Ca(format!("corrupt CA certificate: {}", e)))?;
        let root = params
            .self_signed(&root_key)
            .map_err(|e| ProxyError::Ca(format!("CA certificate does not match key: {}", e)))?;

        // Present the exact bytes from disk in every chain, not the
        // re-signed in-memory copy.
        let root_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .transpose()
            .map_err(|e| ProxyError::Ca(format!("corrupt CA certificate PEM: {}", e)))?
            .ok_or_else(|| ProxyError::Ca("no CERTIFICATE block in CA file".to_string()))?;

        info!(path = %cert_path.display(), "loaded existing root CA");
        Ok(Self {
            root,
            root_key,
            root_der,
            root_pem: cert_pem,
            leaf_cache: Mutex::new(HashMap::new()),
        })
    }

    fn generate(dir: &Path, cert_path: &Path, key_path: &Path) -> Result<Self> {
        info!(dir = %dir.display(), "no CA material found, generating a new root");
        fs::create_dir_all(dir)
            .map_err(|e| ProxyError::Ca(format!("cannot create {}: {}", dir.display(), e)))?;

        let rsa_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, RSA_BITS)
            .map_err(|e| ProxyError::Ca(format!("RSA key generation failed: {}", e)))?;
        let root_key = rcgen_key(&rsa_key)?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, "Keymux");
        dn.push(DnType::CommonName, "Keymux Root CA");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.serial_number = Some(random_serial()?);
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::days(ROOT_VALIDITY_DAYS);

        let root = params
            .self_signed(&root_key)
            .map_err(|e| ProxyError::Ca(format!("cannot self-sign root: {}", e)))?;

        let cert_pem = root.pem();
        let key_pem = rsa_key
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| ProxyError::Ca(format!("cannot encode CA key: {}", e)))?;

        write_atomic(cert_path, cert_pem.as_bytes(), 0o644)?;
        write_atomic(key_path, key_pem.as_bytes(), 0o600)?;
        info!(
            cert = %cert_path.display(),
            "root CA written; install the certificate into client trust stores"
        );

        let root_der = root.der().clone().into_owned();
        Ok(Self {
            root,
            root_key,
            root_der,
            root_pem: cert_pem,
            leaf_cache: Mutex::new(HashMap::new()),
        })
    }

    /// PEM of the root certificate, for exporting to clients.
    #[must_use]
    pub fn root_certificate_pem(&self) -> &str {
        &self.root_pem
    }

    /// Hostnames a leaf has been issued for so far.
    #[must_use]
    pub fn issued_hosts(&self) -> Vec<String> {
        lock_cache(&self.leaf_cache).keys().cloned().collect()
    }

    /// TLS server configuration presenting as `host`, chain `[leaf, root]`.
    ///
    /// Memoized per host. Concurrent first use for the same host may mint a
    /// duplicate leaf; the first insert wins and the spare is dropped.
    pub fn server_config_for(&self, host: &str) -> Result<Arc<ServerConfig>> {
        let host = host.to_ascii_lowercase();
        if let Some(hit) = lock_cache(&self.leaf_cache).get(&host) {
            debug!(host, "using cached leaf certificate");
            return Ok(Arc::clone(hit));
        }

        let config = self.issue(&host)?;
        let mut cache = lock_cache(&self.leaf_cache);
        let entry = cache.entry(host.clone()).or_insert(config);
        debug!(host, "issued leaf certificate");
        Ok(Arc::clone(entry))
    }

    fn issue(&self, host: &str) -> Result<Arc<ServerConfig>> {
        let rsa_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, RSA_BITS)
            .map_err(|e| ProxyError::Ca(format!("leaf key generation failed: {}", e)))?;
        let leaf_key = rcgen_key(&rsa_key)?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.serial_number = Some(random_serial()?);

        params.subject_alt_names = match host.parse::<IpAddr>() {
            Ok(ip) => vec![
                SanType::IpAddress(ip),
                SanType::DnsName(host.to_string().try_into().map_err(|_| {
                    ProxyError::Ca(format!("hostname not IA5: {}", host))
                })?),
            ],
            Err(_) => vec![SanType::DnsName(host.to_string().try_into().map_err(
                |_| ProxyError::Ca(format!("hostname not IA5: {}", host)),
            )?)],
        };

        let not_before =
            time::OffsetDateTime::now_utc() - time::Duration::hours(LEAF_BACKDATE_HOURS);
        params.not_before = not_before;
        params.not_after = not_before + time::Duration::days(LEAF_VALIDITY_DAYS);

        let leaf = params
            .signed_by(&leaf_key, &self.root, &self.root_key)
            .map_err(|e| ProxyError::Ca(format!("cannot sign leaf for {}: {}", host, e)))?;

        let key_der = rsa_key
            .to_pkcs8_der()
            .map_err(|e| ProxyError::Ca(format!("cannot encode leaf key: {}", e)))?;
        let private_key: PrivateKeyDer<'static> =
            PrivatePkcs8KeyDer::from(key_der.as_bytes().to_vec()).into();

        let chain = vec![leaf.der().clone().into_owned(), self.root_der.clone()];
        let config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Tls(format!("TLS server config: {}", e)))?
        .with_no_client_auth()
        .with_single_cert(chain, private_key)
        .map_err(|e| ProxyError::Tls(format!("leaf chain rejected: {}", e)))?;

        Ok(Arc::new(config))
    }
}

/// Import an RSA private key into rcgen for signing.
fn rcgen_key(key: &RsaPrivateKey) -> Result<KeyPair> {
    let der = key
        .to_pkcs8_der()
        .map_err(|e| ProxyError::Ca(format!("cannot encode RSA key: {}", e)))?;
    KeyPair::try_from(der.as_bytes())
        .map_err(|e| ProxyError::Ca(format!("rcgen rejected RSA key: {}", e)))
}

/// Random positive 128-bit serial.
fn random_serial() -> Result<SerialNumber> {
    let mut bytes = [0u8; 16];
    getrandom::fill(&mut bytes)
        .map_err(|e| ProxyError::Ca(format!("RNG failure: {}", e)))?;
    bytes[0] &= 0x7f;
    Ok(SerialNumber::from_slice(&bytes))
}

/// Write via a temp file and rename so a crash never leaves half a root.
fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let tmp: PathBuf = path.with_extension("tmp");
    fs::write(&tmp, contents)
        .map_err(|e| ProxyError::Ca(format!("cannot write {}: {}", tmp.display(), e)))?;
    set_mode(&tmp, mode)?;
    fs::rename(&tmp, path)
        .map_err(|e| ProxyError::Ca(format!("cannot rename into {}: {}", path.display(), e)))?;
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| ProxyError::Ca(format!("cannot chmod {}: {}", path.display(), e)))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

fn lock_cache(
    cache: &Mutex<HashMap<String, Arc<ServerConfig>>>,
) -> std::sync::MutexGuard<'_, HashMap<String, Arc<ServerConfig>>> {
    match cache.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // RSA-2048 generation makes these tests slow in debug builds but they
    // exercise the real deployment path.

    #[test]
    fn test_generate_then_reload_same_root() {
        let dir = TempDir::new().unwrap();
        let first = CertificateAuthority::open(dir.path()).unwrap();
        assert!(dir.path().join(CA_CERT_FILE).exists());
        assert!(dir.path().join(CA_KEY_FILE).exists());

        let second = CertificateAuthority::open(dir.path()).unwrap();
        assert_eq!(first.root_der.as_ref(), second.root_der.as_ref());
        assert_eq!(first.root_certificate_pem(), second.root_certificate_pem());
    }

    #[test]
    #[cfg(unix)]
    fn test_key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let _ca = CertificateAuthority::open(dir.path()).unwrap();
        let mode = fs::metadata(dir.path().join(CA_KEY_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
        let mode = fs::metadata(dir.path().join(CA_CERT_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn test_corrupt_material_refuses_to_start() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CA_CERT_FILE), "not a certificate").unwrap();
        fs::write(dir.path().join(CA_KEY_FILE), "not a key").unwrap();
        assert!(matches!(
            CertificateAuthority::open(dir.path()),
            Err(ProxyError::Ca(_))
        ));
    }

    #[test]
    fn test_missing_key_with_present_cert_is_fatal() {
        let dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::open(dir.path()).unwrap();
        drop(ca);
        fs::remove_file(dir.path().join(CA_KEY_FILE)).unwrap();
        assert!(CertificateAuthority::open(dir.path()).is_err());
    }

    #[test]
    fn test_leaf_issuance_and_memoization() {
        let dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::open(dir.path()).unwrap();

        let first = ca.server_config_for("example.com").unwrap();
        let again = ca.server_config_for("EXAMPLE.COM").unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        let other = ca.server_config_for("other.example").unwrap();
        assert!(!Arc::ptr_eq(&first, &other));

        let mut hosts = ca.issued_hosts();
        hosts.sort();
        assert_eq!(hosts, vec!["example.com", "other.example"]);
    }

    #[test]
    fn test_leaf_for_ip_literal() {
        let dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::open(dir.path()).unwrap();
        assert!(ca.server_config_for("127.0.0.1").is_ok());
    }
}
