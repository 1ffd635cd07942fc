//! TLS material for MITM interception and upstream encryption

use crate::{Error, Result};
use parking_lot::RwLock;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

fn ca_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Relaygate Proxy CA");
    dn.push(DnType::OrganizationName, "Relaygate");
    params.distinguished_name = dn;
    params
}

/// Self-signed CA that mints leaf certificates per intercepted host.
pub struct CertificateAuthority {
    ca_cert: Certificate,
    ca_key: KeyPair,
    ca_cert_pem: String,
    /// host -> (leaf PEM, key PEM)
    cert_cache: RwLock<HashMap<String, (String, String)>>,
}

impl CertificateAuthority {
    /// Generate a fresh CA.
    pub fn new() -> Result<Self> {
        let key_pair = KeyPair::generate().map_err(|e| Error::tls(e.to_string()))?;
        let ca_cert = ca_params()
            .self_signed(&key_pair)
            .map_err(|e| Error::tls(e.to_string()))?;
        let ca_cert_pem = ca_cert.pem();

        Ok(CertificateAuthority {
            ca_cert,
            ca_key: key_pair,
            ca_cert_pem,
            cert_cache: RwLock::new(HashMap::new()),
        })
    }

    /// Rebuild the CA from a previously saved key pair.
    pub fn from_files<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Self> {
        let _cert_pem = fs::read_to_string(cert_path)?;
        let key_pem = fs::read_to_string(key_path)?;

        let key_pair = KeyPair::from_pem(&key_pem).map_err(|e| Error::tls(e.to_string()))?;
        let ca_cert = ca_params()
            .self_signed(&key_pair)
            .map_err(|e| Error::tls(e.to_string()))?;
        let ca_cert_pem = ca_cert.pem();

        Ok(CertificateAuthority {
            ca_cert,
            ca_key: key_pair,
            ca_cert_pem,
            cert_cache: RwLock::new(HashMap::new()),
        })
    }

    /// Persist the CA so clients only have to trust it once.
    pub fn save_to_files<P: AsRef<Path>>(&self, cert_path: P, key_path: P) -> Result<()> {
        fs::write(cert_path, self.ca_cert_pem.as_bytes())?;
        fs::write(key_path, self.ca_key.serialize_pem().as_bytes())?;
        Ok(())
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Leaf certificate and key for a host, cached per host.
    pub fn leaf_for(&self, host: &str) -> Result<(String, String)> {
        {
            let cache = self.cert_cache.read();
            if let Some((cert, key)) = cache.get(host) {
                return Ok((cert.clone(), key.clone()));
            }
        }

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.subject_alt_names = vec![SanType::DnsName(
            host.try_into().map_err(|_| Error::tls(format!("invalid host: {}", host)))?,
        )];
        if let Ok(ip) = host.parse::<std::net::IpAddr>() {
            params.subject_alt_names.push(SanType::IpAddress(ip));
        }

        let key_pair = KeyPair::generate().map_err(|e| Error::tls(e.to_string()))?;
        let cert = params
            .signed_by(&key_pair, &self.ca_cert, &self.ca_key)
            .map_err(|e| Error::tls(e.to_string()))?;

        let cert_pem = cert.pem();
        let key_pem = key_pair.serialize_pem();

        let mut cache = self.cert_cache.write();
        cache.insert(host.to_string(), (cert_pem.clone(), key_pem.clone()));
        Ok((cert_pem, key_pem))
    }

    /// Acceptor presenting a spoofed leaf for `host`, HTTP/1.1 only.
    pub fn acceptor_for(&self, host: &str) -> Result<TlsAcceptor> {
        let (cert_pem, key_pem) = self.leaf_for(host)?;

        let certs: Vec<CertificateDer<'static>> =
            CertificateDer::pem_slice_iter(cert_pem.as_bytes())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::tls(format!("failed to parse leaf: {:?}", e)))?;
        let key = PrivateKeyDer::from_pem_slice(key_pem.as_bytes())
            .map_err(|e| Error::tls(format!("failed to parse leaf key: {:?}", e)))?;

        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

/// Connector for upstream TLS legs. `skip_cert_verify` disables certificate
/// checking for chained proxies with private certificates.
pub fn client_connector(skip_cert_verify: bool) -> TlsConnector {
    let config = if skip_cert_verify {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
            .with_no_client_auth()
    } else {
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store())
            .with_no_client_auth()
    };
    TlsConnector::from(Arc::new(config))
}

/// `ServerName` for SNI, owned so it can cross tasks.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string()).map_err(|_| Error::tls(format!("invalid SNI: {}", host)))
}

fn root_store() -> rustls::RootCertStore {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    root_store
}

/// Certificate verifier that accepts any certificate
#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls_pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ca_creation() {
        let ca = CertificateAuthority::new();
        assert!(ca.is_ok());
    }

    #[test]
    fn test_leaf_generation_and_cache() {
        let ca = CertificateAuthority::new().unwrap();
        let (cert, key) = ca.leaf_for("example.com").unwrap();
        assert!(cert.contains("BEGIN CERTIFICATE"));
        assert!(key.contains("BEGIN PRIVATE KEY"));

        let (again, _) = ca.leaf_for("example.com").unwrap();
        assert_eq!(cert, again);
    }

    #[test]
    fn test_server_name() {
        assert!(server_name("example.com").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
    }
}
