//! Credential storage

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::{Credential, CredentialError};

/// Trait for caching credentials between runs
///
/// `get` returns `Ok(None)` when nothing is cached for the remote cluster;
/// any `Err` is treated as fatal by the resolver.
///
/// # Example
/// ```ignore
/// struct KeychainStore { service: String }
///
/// #[async_trait]
/// impl CredentialStore for KeychainStore {
///     async fn get(&self, remote_cluster: &str) -> Result<Option<Credential>, CredentialError> {
///         // Read from the OS keychain
///     }
///
///     async fn put(&self, remote_cluster: &str, credential: Credential) -> Result<(), CredentialError> {
///         // Merge into the OS keychain entry
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait CredentialStore: Send + Sync {
    /// Load the cached credential for a remote cluster
    async fn get(&self, remote_cluster: &str) -> Result<Option<Credential>, CredentialError>;

    /// Merge a freshly issued credential into the cache
    async fn put(&self, remote_cluster: &str, credential: Credential)
        -> Result<(), CredentialError>;
}

/// In-memory credential store
/// All data is lost when the process exits.
#[derive(Debug, Clone, Default)]
pub struct MemoryCredentialStore {
    credentials: Arc<Mutex<HashMap<String, Credential>>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, Credential>>, CredentialError> {
        self.credentials
            .lock()
            .map_err(|_| CredentialError::Store("credential store lock poisoned".to_string()))
    }
}

#[async_trait::async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, remote_cluster: &str) -> Result<Option<Credential>, CredentialError> {
        Ok(self.lock()?.get(remote_cluster).cloned())
    }

    async fn put(
        &self,
        remote_cluster: &str,
        credential: Credential,
    ) -> Result<(), CredentialError> {
        let mut credentials = self.lock()?;
        match credentials.get_mut(remote_cluster) {
            Some(existing) => existing.merge(credential),
            None => {
                credentials.insert(remote_cluster.to_string(), credential);
            }
        }
        Ok(())
    }
}
