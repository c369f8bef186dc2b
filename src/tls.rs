use std::{
    collections::HashMap,
    fs::File,
    io::BufReader,
    net::IpAddr,
    path::Path,
    sync::{Arc, Mutex},
};

use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
    ClientConfig, RootCertStore, ServerConfig,
};
use rustls_pemfile::certs;

use anyhow::{Context, Result};
use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair, SanType};

pub fn cert_reader<P: AsRef<Path>>(cert_path: P) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let cert_file = File::open(cert_path)?;
    let mut reader = BufReader::new(cert_file);
    let parsed = certs(&mut reader);

    let certs: Result<Vec<CertificateDer>, _> = parsed.collect();
    Ok(certs?)
}

/// TLS configuration for the upstream leg: web PKI roots, optionally
/// extended with a private CA file (test rigs, corporate roots).
pub fn build_upstream_config(extra_ca: Option<&Path>) -> Result<ClientConfig> {
    let mut root_store = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    if let Some(path) = extra_ca {
        let extra = cert_reader(path)
            .with_context(|| format!("loading extra CA from {}", path.display()))?;
        root_store.add_parsable_certificates(extra);
    }

    Ok(ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth())
}

/// The interception CA. Mints one leaf certificate per intercepted host,
/// signed by a CA the operator's clients trust, and caches the resulting
/// rustls server configs.
pub struct MitmAuthority {
    ca: Certificate,
    ca_der: CertificateDer<'static>,
    configs: Mutex<HashMap<String, Arc<ServerConfig>>>,
}

impl MitmAuthority {
    /// Load the signing CA from PEM files.
    pub fn load<P: AsRef<Path>>(ca_cert: P, ca_key: P) -> Result<MitmAuthority> {
        let cert_pem = std::fs::read_to_string(ca_cert.as_ref())
            .with_context(|| format!("reading {}", ca_cert.as_ref().display()))?;
        let key_pem = std::fs::read_to_string(ca_key.as_ref())
            .with_context(|| format!("reading {}", ca_key.as_ref().display()))?;
        let key_pair = KeyPair::from_pem(&key_pem).context("parsing CA key")?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem, key_pair)
            .context("parsing CA certificate")?;
        Self::from_params(params)
    }

    /// Generate a throwaway self-signed CA. Clients must be pointed at
    /// [`MitmAuthority::ca_cert_pem`] to trust it.
    pub fn generate() -> Result<MitmAuthority> {
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, "tollbooth interception CA");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        Self::from_params(params)
    }

    fn from_params(params: CertificateParams) -> Result<MitmAuthority> {
        let ca = Certificate::from_params(params).context("building CA certificate")?;
        let ca_der = CertificateDer::from(ca.serialize_der()?);
        Ok(MitmAuthority {
            ca,
            ca_der,
            configs: Mutex::new(HashMap::new()),
        })
    }

    pub fn ca_cert_pem(&self) -> Result<String> {
        Ok(self.ca.serialize_pem()?)
    }

    pub fn ca_cert_der(&self) -> CertificateDer<'static> {
        self.ca_der.clone()
    }

    /// Server config presenting a leaf for `host`, minting and caching it
    /// on first use.
    pub fn server_config_for(&self, host: &str) -> Result<Arc<ServerConfig>> {
        if let Some(config) = self.configs.lock().unwrap().get(host) {
            return Ok(config.clone());
        }

        let mut params = match host.parse::<IpAddr>() {
            Ok(ip) => {
                let mut params = CertificateParams::default();
                params.subject_alt_names = vec![SanType::IpAddress(ip)];
                params
            }
            Err(_) => CertificateParams::new(vec![host.to_string()]),
        };
        params.distinguished_name.push(DnType::CommonName, host);

        let leaf =
            Certificate::from_params(params).with_context(|| format!("building leaf for {host}"))?;
        let leaf_der = CertificateDer::from(leaf.serialize_der_with_signer(&self.ca)?);
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf.serialize_private_key_der()));

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![leaf_der, self.ca_der.clone()], key)
            .context("assembling leaf server config")?;

        let config = Arc::new(config);
        self.configs
            .lock()
            .unwrap()
            .insert(host.to_string(), config.clone());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mints_and_caches_leaf_configs() {
        let authority = MitmAuthority::generate().unwrap();
        let first = authority.server_config_for("example.org").unwrap();
        let second = authority.server_config_for("example.org").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        let other = authority.server_config_for("other.example").unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn mints_leaves_for_ip_literals() {
        let authority = MitmAuthority::generate().unwrap();
        authority.server_config_for("127.0.0.1").unwrap();
    }
}
