//! Cached per-remote-cluster credential

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{CredentialError, CredentialRecord};

/// The client key for a remote cluster together with the sub-cluster
/// certificates issued for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub remote_cluster: String,
    pub private_key_pem: String,
    /// Sub-cluster name to PEM encoded client certificate
    #[serde(default)]
    pub kube_certs: BTreeMap<String, String>,
}

impl Credential {
    pub fn new(remote_cluster: impl Into<String>, private_key_pem: impl Into<String>) -> Self {
        Self {
            remote_cluster: remote_cluster.into(),
            private_key_pem: private_key_pem.into(),
            kube_certs: BTreeMap::new(),
        }
    }

    pub fn with_kube_cert(
        mut self,
        sub_cluster: impl Into<String>,
        cert_pem: impl Into<String>,
    ) -> Self {
        self.kube_certs.insert(sub_cluster.into(), cert_pem.into());
        self
    }

    /// Extract the record for one sub-cluster
    pub fn kube_record(&self, sub_cluster: &str) -> Result<CredentialRecord, CredentialError> {
        let cert_pem = self.kube_certs.get(sub_cluster).ok_or_else(|| {
            CredentialError::NotFound(format!(
                "no certificate for {} in {}",
                sub_cluster, self.remote_cluster
            ))
        })?;
        CredentialRecord::from_pem(cert_pem, &self.private_key_pem)
    }

    /// Fold `other` into this credential
    ///
    /// Certificates are merged when both share the same key; a different key
    /// replaces the credential wholesale since the old certificates no longer
    /// pair with it.
    pub fn merge(&mut self, other: Credential) {
        if self.private_key_pem == other.private_key_pem {
            self.kube_certs.extend(other.kube_certs);
        } else {
            *self = other;
        }
    }

    /// Classify the cached certificate for `sub_cluster` at `now`
    pub fn lookup(&self, sub_cluster: &str, now: DateTime<Utc>) -> CacheLookup {
        match self.kube_record(sub_cluster) {
            Ok(record) if record.is_reusable_at(now) => CacheLookup::Usable(record),
            Ok(record) => CacheLookup::Unusable {
                reason: format!("certificate expires at {}", record.not_after),
            },
            Err(e) => CacheLookup::Unusable {
                reason: e.to_string(),
            },
        }
    }
}

/// Outcome of consulting the credential store for one selector
#[derive(Debug)]
pub enum CacheLookup {
    /// A cached certificate with enough validity left
    Usable(CredentialRecord),
    /// A credential exists but the certificate is missing, broken or expiring
    Unusable { reason: String },
    /// Nothing cached for the remote cluster
    NotFound,
}

impl CacheLookup {
    pub fn is_usable(&self) -> bool {
        matches!(self, CacheLookup::Usable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use kproxy_cert::{KeyPair, LocalCa};

    fn signed(ca: &LocalCa, key: &KeyPair, sub: &str, ttl: Duration) -> String {
        ca.sign_client_cert(key, "alice", &[sub.to_string()], Utc::now() + ttl)
            .unwrap()
    }

    fn authority() -> LocalCa {
        LocalCa::generate(
            KeyPair::generate().unwrap(),
            "authority",
            Utc::now() + Duration::days(1),
        )
        .unwrap()
    }

    #[test]
    fn test_lookup_outcomes() {
        let ca = authority();
        let key = KeyPair::generate().unwrap();
        let credential = Credential::new("clusterA", key.serialize_pem())
            .with_kube_cert("prod", signed(&ca, &key, "prod", Duration::hours(1)))
            .with_kube_cert("staging", signed(&ca, &key, "staging", Duration::seconds(30)))
            .with_kube_cert("broken", "not a certificate");

        let now = Utc::now();
        assert!(credential.lookup("prod", now).is_usable());
        assert!(matches!(
            credential.lookup("staging", now),
            CacheLookup::Unusable { .. }
        ));
        assert!(matches!(
            credential.lookup("broken", now),
            CacheLookup::Unusable { .. }
        ));
        assert!(matches!(
            credential.lookup("dev", now),
            CacheLookup::Unusable { .. }
        ));
    }

    #[test]
    fn test_missing_sub_cluster_is_not_found() {
        let credential = Credential::new("clusterA", "key");
        assert!(credential.kube_record("prod").unwrap_err().is_not_found());
    }

    #[test]
    fn test_merge_keeps_certs_for_same_key() {
        let mut stored = Credential::new("clusterA", "key-1").with_kube_cert("prod", "a");
        stored.merge(Credential::new("clusterA", "key-1").with_kube_cert("staging", "b"));
        assert_eq!(stored.kube_certs.len(), 2);

        stored.merge(Credential::new("clusterA", "key-2").with_kube_cert("dev", "c"));
        assert_eq!(stored.private_key_pem, "key-2");
        assert_eq!(stored.kube_certs.keys().collect::<Vec<_>>(), vec!["dev"]);
    }
}
