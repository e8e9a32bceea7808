//! MITM root CA: generate-or-load a local root, issue per-host leaf certs
//! signed by it, and cache the resulting `rustls::ServerConfig` (§4.7).

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::ServerConfig;
use sniffler_core::Error;
use time::{Duration, OffsetDateTime};

/// Owns the locally-trusted root CA used to mint leaf certificates for
/// MITM'd hosts, plus a bounded cache of the per-host `ServerConfig`s built
/// from them. The root lives under the proxy's persistence root (§4.11:
/// "the generated root CA lives in the user data path").
pub struct RootCa {
    pub cert_pem: String,
    cert: Certificate,
    key: KeyPair,
    chain: Vec<CertificateDer<'static>>,
    server_configs: Mutex<ServerConfigCache>,
}

impl RootCa {
    /// Load the root from `storage_dir` if present, else generate and
    /// persist a fresh one. `server_config_cache_capacity` bounds the
    /// per-host TLS `ServerConfig` cache (`Settings::tls_cert_cache_capacity`);
    /// `0` disables caching, so every host lookup reissues a fresh leaf cert.
    pub fn load_or_generate(storage_dir: &Path, server_config_cache_capacity: usize) -> Result<Self, Error> {
        let cert_path = storage_dir.join("sniffler-root-ca.pem");
        let key_path = storage_dir.join("sniffler-root-ca.key");

        let (cert, key, cert_pem) = if cert_path.exists() && key_path.exists() {
            let cert_pem = std::fs::read_to_string(&cert_path).map_err(|e| Error::persistence(format!("reading root CA cert: {e}")))?;
            let key_pem = std::fs::read_to_string(&key_path).map_err(|e| Error::persistence(format!("reading root CA key: {e}")))?;

            let key = KeyPair::from_pem(&key_pem).map_err(|e| Error::persistence(format!("parsing root CA key: {e}")))?;
            let params = CertificateParams::from_ca_cert_pem(&cert_pem).map_err(|e| Error::persistence(format!("parsing root CA cert: {e}")))?;
            let cert = params
                .self_signed(&key)
                .map_err(|e| Error::persistence(format!("reconstructing root CA cert: {e}")))?;

            (cert, key, cert_pem)
        } else {
            let (cert, key) = generate_root();
            let cert_pem = cert.pem();
            let key_pem = key.serialize_pem();

            std::fs::create_dir_all(storage_dir).map_err(|e| Error::persistence(format!("creating CA storage dir: {e}")))?;
            std::fs::write(&cert_path, &cert_pem).map_err(|e| Error::persistence(format!("writing root CA cert: {e}")))?;
            std::fs::write(&key_path, &key_pem).map_err(|e| Error::persistence(format!("writing root CA key: {e}")))?;

            (cert, key, cert_pem)
        };

        let chain = vec![cert.der().clone()];
        Ok(Self {
            cert_pem,
            cert,
            key,
            chain,
            server_configs: Mutex::new(ServerConfigCache::new(server_config_cache_capacity)),
        })
    }

    /// A cached `ServerConfig` for terminating TLS on behalf of `host`,
    /// generating and caching a fresh leaf cert on first use.
    pub fn server_config_for_host(&self, host: &str) -> Result<Arc<ServerConfig>, Error> {
        let cache_key = host.to_ascii_lowercase();
        {
            let mut cache = self.server_configs.lock().expect("server config cache mutex poisoned");
            if let Some(config) = cache.get(&cache_key) {
                return Ok(config);
            }
        }

        let (chain, key) = self.issue_leaf_cert(host)?;
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| Error::internal(format!("building TLS server config for {host}: {e}")))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let config = Arc::new(config);
        self.server_configs.lock().expect("server config cache mutex poisoned").insert(cache_key, config.clone());
        Ok(config)
    }

    fn issue_leaf_cert(&self, host: &str) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), Error> {
        let mut params = CertificateParams::default();
        params.subject_alt_names = if let Ok(ip) = IpAddr::from_str(host) {
            vec![SanType::IpAddress(ip)]
        } else {
            let name = Ia5String::try_from(host).map_err(|_| Error::internal(format!("invalid hostname for MITM cert: {host}")))?;
            vec![SanType::DnsName(name)]
        };

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        dn.push(DnType::OrganizationName, "Sniffler MITM");
        params.distinguished_name = dn;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = OffsetDateTime::now_utc();
        params.not_before = now.checked_sub(Duration::hours(1)).unwrap_or(now);
        params.not_after = now.checked_add(Duration::days(365 * 2)).unwrap_or(now);

        let key_pair = KeyPair::generate().map_err(|e| Error::internal(format!("generating leaf key for {host}: {e}")))?;
        let cert = params
            .signed_by(&key_pair, &self.cert, &self.key)
            .map_err(|e| Error::internal(format!("signing leaf cert for {host}: {e}")))?;

        let mut chain = Vec::with_capacity(1 + self.chain.len());
        chain.push(cert.der().clone());
        chain.extend(self.chain.iter().cloned());

        let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        Ok((chain, key.clone_key()))
    }
}

fn generate_root() -> (Certificate, KeyPair) {
    let date_str = chrono::Utc::now().format("%Y-%m-%d").to_string();
    let common_name = format!("Sniffler Root CA ({date_str})");

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, "Sniffler");

    let mut params = CertificateParams::default();
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = OffsetDateTime::now_utc();
    params.not_before = now.checked_sub(Duration::hours(1)).unwrap_or(now);
    params.not_after = now.checked_add(Duration::days(365 * 10)).unwrap_or(now);

    let key_pair = KeyPair::generate().expect("failed to generate root CA key");
    let cert = params.self_signed(&key_pair).expect("failed to self-sign root CA cert");
    (cert, key_pair)
}

struct ServerConfigCache {
    map: HashMap<String, Arc<ServerConfig>>,
    order: VecDeque<String>,
    capacity: usize,
}

impl ServerConfigCache {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&mut self, key: &str) -> Option<Arc<ServerConfig>> {
        let found = self.map.get(key).cloned();
        if found.is_some() {
            self.promote(key);
        }
        found
    }

    fn insert(&mut self, key: String, config: Arc<ServerConfig>) {
        if self.capacity == 0 {
            return;
        }
        self.map.insert(key.clone(), config);
        self.promote(&key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }
    }

    fn promote(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.to_string());
    }
}

/// Where the root CA is stored, relative to a proxy's persistence root.
pub fn default_ca_storage_dir(persistence_root: &Path) -> PathBuf {
    persistence_root.join("ca")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn root_cert_persists_across_reloads() {
        let dir = tempdir().unwrap();

        let first_pem = RootCa::load_or_generate(dir.path(), 256).unwrap().cert_pem;
        let second_pem = RootCa::load_or_generate(dir.path(), 256).unwrap().cert_pem;

        assert_eq!(first_pem, second_pem);
    }

    #[test]
    fn issues_distinct_leaf_certs_per_host_and_caches() {
        let dir = tempdir().unwrap();
        let ca = RootCa::load_or_generate(dir.path(), 256).unwrap();

        let a = ca.server_config_for_host("api.example.com").unwrap();
        let a_again = ca.server_config_for_host("api.example.com").unwrap();
        assert!(Arc::ptr_eq(&a, &a_again));

        let b = ca.server_config_for_host("other.example.com").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn zero_capacity_disables_caching() {
        let dir = tempdir().unwrap();
        let ca = RootCa::load_or_generate(dir.path(), 0).unwrap();

        let a = ca.server_config_for_host("api.example.com").unwrap();
        let a_again = ca.server_config_for_host("api.example.com").unwrap();
        assert!(!Arc::ptr_eq(&a, &a_again));
    }
}
