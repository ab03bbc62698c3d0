//! Serving certificate selection by server name

use kproxy_cert::{CertError, LocalCa};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::sni::{local_proxy_wildcard_domain, remote_cluster_of};

/// Presents the `*.<remote cluster>` certificate matching the client's SNI
///
/// Remote cluster names are compared case-insensitively since server names
/// arrive lowercased.
#[derive(Debug)]
pub struct LocalCaCertResolver {
    certs: HashMap<String, Arc<CertifiedKey>>,
}

impl LocalCaCertResolver {
    /// Mint one wildcard serving certificate per remote cluster CA
    pub fn new(cas: &HashMap<String, LocalCa>) -> Result<Self, CertError> {
        let mut certs = HashMap::with_capacity(cas.len());

        for (remote_cluster, ca) in cas {
            let cert = ca.issue_server_cert(&[local_proxy_wildcard_domain(remote_cluster)])?;
            let key = rustls::crypto::ring::sign::any_supported_type(&cert.private_key)
                .map_err(|e| CertError::Key(format!("Unsupported serving key: {}", e)))?;

            certs.insert(
                remote_cluster.to_ascii_lowercase(),
                Arc::new(CertifiedKey::new(cert.cert_chain, key)),
            );
        }

        Ok(Self { certs })
    }

    /// Certificate for a server name, if its remote cluster is served
    pub fn lookup(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        let remote_cluster = remote_cluster_of(server_name)?.to_ascii_lowercase();
        self.certs.get(&remote_cluster).cloned()
    }

    /// Whether a certificate exists for `remote_cluster`
    pub fn serves(&self, remote_cluster: &str) -> bool {
        self.certs.contains_key(&remote_cluster.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }
}

impl ResolvesServerCert for LocalCaCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let Some(server_name) = client_hello.server_name() else {
            debug!("Client sent no server name; no certificate to present");
            return None;
        };

        let cert = self.lookup(server_name);
        if cert.is_none() {
            debug!("No local CA for server name {}", server_name);
        }
        cert
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use kproxy_cert::KeyPair;

    fn ca(domain: &str) -> LocalCa {
        LocalCa::generate(
            KeyPair::generate().unwrap(),
            domain,
            Utc::now() + Duration::days(1),
        )
        .unwrap()
    }

    #[test]
    fn test_lookup_by_remote_cluster() {
        let mut cas = HashMap::new();
        cas.insert("clusterA".to_string(), ca("*.clusterA"));
        cas.insert("clusterB".to_string(), ca("*.clusterB"));

        let resolver = LocalCaCertResolver::new(&cas).unwrap();
        assert_eq!(resolver.len(), 2);
        assert!(resolver.serves("CLUSTERA"));

        let cert = resolver.lookup("70726f64.clustera").unwrap();
        assert_eq!(cert.cert.len(), 2);
        assert!(resolver.lookup("70726f64.clusterB").is_some());
        assert!(resolver.lookup("70726f64.clusterC").is_none());
        assert!(resolver.lookup("clusterA").is_none());
    }

    #[test]
    fn test_serving_cert_covers_wildcard() {
        let mut cas = HashMap::new();
        cas.insert("clusterA".to_string(), ca("*.clusterA"));

        let resolver = LocalCaCertResolver::new(&cas).unwrap();
        let cert = resolver.lookup("00.clusterA").unwrap();
        let info = kproxy_cert::inspect(&cert.cert[0]).unwrap();
        assert_eq!(info.dns_names, vec!["*.clusterA".to_string()]);
    }
}
