//! TLS termination with SNI certificate selection.
//!
//! # Responsibilities
//! - Parse stored certificates into rustls `CertifiedKey`s
//! - Map domain names to certificates (exact, then wildcard)
//! - Build the server config with ALPN `h2` and `http/1.1`
//!
//! # Design Decisions
//! - The resolver holds one immutable table swapped on every backend reload,
//!   so handshakes never see a half-built mapping
//! - A certificate that fails to parse is skipped with a warning; the rest of
//!   the table still loads

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use thiserror::Error;

use crate::routing::matcher::{normalize_host, wildcard_name};
use crate::routing::{Certificate, Domain};

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("certificate {id}: {reason}")]
    Certificate { id: i64, reason: String },

    #[error("rustls: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Parse a PEM chain and private key into a signing-ready key.
pub fn certified_key(cert: &Certificate) -> Result<CertifiedKey, TlsError> {
    let invalid = |reason: String| TlsError::Certificate { id: cert.id, reason };

    let chain = rustls_pemfile::certs(&mut cert.cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| invalid(e.to_string()))?;
    if chain.is_empty() {
        return Err(invalid("no certificate in PEM".to_string()));
    }
    let key = rustls_pemfile::private_key(&mut cert.key_pem.as_bytes())
        .map_err(|e| invalid(e.to_string()))?
        .ok_or_else(|| invalid("no private key in PEM".to_string()))?;
    let signing_key =
        rustls::crypto::ring::sign::any_supported_type(&key).map_err(|e| invalid(e.to_string()))?;
    Ok(CertifiedKey::new(chain, signing_key))
}

#[derive(Debug, Default)]
struct CertTable {
    by_name: HashMap<String, Arc<CertifiedKey>>,
}

#[derive(Debug, Default)]
pub struct CertificateResolver {
    table: ArcSwap<CertTable>,
}

impl CertificateResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the name → certificate table. Returns how many names got a
    /// certificate.
    pub fn rebuild(&self, domains: &[Domain], certificates: &[Certificate]) -> usize {
        let mut keys = HashMap::with_capacity(certificates.len());
        for cert in certificates {
            match certified_key(cert) {
                Ok(key) => {
                    keys.insert(cert.id, Arc::new(key));
                }
                Err(e) => {
                    tracing::warn!(cert_id = cert.id, common_name = %cert.common_name, error = %e, "Skipping certificate");
                }
            }
        }
        self.install(domains, &keys)
    }

    /// Map domains onto already parsed keys by `cert_id`.
    pub fn install(&self, domains: &[Domain], keys: &HashMap<i64, Arc<CertifiedKey>>) -> usize {
        let by_name: HashMap<String, Arc<CertifiedKey>> = domains
            .iter()
            .filter(|d| d.cert_id != 0)
            .filter_map(|d| keys.get(&d.cert_id).map(|k| (d.name.to_ascii_lowercase(), k.clone())))
            .collect();
        let count = by_name.len();
        self.table.store(Arc::new(CertTable { by_name }));
        count
    }

    pub fn certificate_for(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        let name = normalize_host(server_name);
        let table = self.table.load();
        if let Some(key) = table.by_name.get(&name) {
            return Some(key.clone());
        }
        table.by_name.get(&wildcard_name(&name)?).cloned()
    }
}

impl ResolvesServerCert for CertificateResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name()?;
        let key = self.certificate_for(name);
        if key.is_none() {
            tracing::debug!(server_name = %name, "No certificate for SNI name");
        }
        key
    }
}

/// Server config resolving certificates through `resolver`.
pub fn server_config(resolver: Arc<CertificateResolver>) -> Result<ServerConfig, TlsError> {
    let mut config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed(id: i64, names: &[&str]) -> Certificate {
        let rcgen::CertifiedKey { cert, signing_key } =
            rcgen::generate_simple_self_signed(names.iter().map(|n| n.to_string()).collect::<Vec<_>>()).unwrap();
        Certificate {
            id,
            common_name: names[0].to_string(),
            cert_pem: cert.pem(),
            key_pem: signing_key.serialize_pem(),
            expire_time: 0,
        }
    }

    fn domain(name: &str, cert_id: i64) -> Domain {
        Domain {
            id: 0,
            name: name.into(),
            app_id: 1,
            cert_id,
            redirect: false,
            location: String::new(),
        }
    }

    #[test]
    fn test_exact_then_wildcard() {
        let resolver = CertificateResolver::new();
        let certs = vec![self_signed(1, &["shop.example.com"]), self_signed(2, &["any.example.com"])];
        let count = resolver.rebuild(
            &[domain("shop.example.com", 1), domain("*.example.com", 2), domain("plain.example.org", 0)],
            &certs,
        );
        assert_eq!(count, 2);

        let exact = resolver.certificate_for("SHOP.example.com").unwrap();
        let wildcard = resolver.certificate_for("blog.example.com").unwrap();
        assert!(!Arc::ptr_eq(&exact, &wildcard));
        assert!(resolver.certificate_for("plain.example.org").is_none());
        assert!(resolver.certificate_for("example.net").is_none());
    }

    #[test]
    fn test_bad_certificate_skipped() {
        let resolver = CertificateResolver::new();
        let broken = Certificate {
            id: 9,
            common_name: "broken".into(),
            cert_pem: "not a pem".into(),
            key_pem: String::new(),
            expire_time: 0,
        };
        let good = self_signed(1, &["ok.example.com"]);
        let count = resolver.rebuild(&[domain("broken.example.com", 9), domain("ok.example.com", 1)], &[broken, good]);

        assert_eq!(count, 1);
        assert!(resolver.certificate_for("broken.example.com").is_none());
        assert!(resolver.certificate_for("ok.example.com").is_some());
    }

    #[test]
    fn test_server_config_negotiates_h2() {
        let config = server_config(Arc::new(CertificateResolver::new())).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }
}
