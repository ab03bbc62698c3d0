//! Resolved credentials handed to the local proxy

use chrono::{DateTime, Utc};
use kproxy_cert::Certificate;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::{ClusterKey, CredentialError};

/// A cached certificate must outlive this window to be reused
pub const MIN_REMAINING_VALIDITY: Duration = Duration::from_secs(60);

/// Client certificate and key for one sub-cluster
///
/// Records are never updated in place; an expiring record is replaced.
#[derive(Debug, Clone)]
pub struct CredentialRecord {
    pub certificate: Certificate,
    pub not_after: DateTime<Utc>,
}

impl CredentialRecord {
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, CredentialError> {
        let certificate = Certificate::from_pem(cert_pem.as_bytes(), key_pem.as_bytes())?;
        let not_after = certificate.info()?.not_after;
        Ok(Self {
            certificate,
            not_after,
        })
    }

    /// Whether more than [`MIN_REMAINING_VALIDITY`] is left at `now`
    pub fn is_reusable_at(&self, now: DateTime<Utc>) -> bool {
        let remaining = self.not_after - now;
        match remaining.to_std() {
            Ok(remaining) => remaining > MIN_REMAINING_VALIDITY,
            Err(_) => false,
        }
    }
}

/// Credentials keyed by (remote cluster, sub-cluster)
#[derive(Debug, Clone, Default)]
pub struct CredentialSet {
    entries: BTreeMap<ClusterKey, CredentialRecord>,
}

impl CredentialSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: ClusterKey, record: CredentialRecord) {
        self.entries.insert(key, record);
    }

    pub fn get(&self, key: &ClusterKey) -> Option<&CredentialRecord> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ClusterKey> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ClusterKey, &CredentialRecord)> {
        self.entries.iter()
    }
}

impl IntoIterator for CredentialSet {
    type Item = (ClusterKey, CredentialRecord);
    type IntoIter = std::collections::btree_map::IntoIter<ClusterKey, CredentialRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
