//! Client credentials for Kubernetes clusters reached through the local proxy
//!
//! Decides, per selected cluster, whether a cached client certificate can be
//! reused or a new one must be issued by the remote authority, and produces
//! the [`CredentialSet`] the local proxy serves with.
//!
//! # Flow
//!
//! 1. One session to the remote authority is opened (re-authenticating once
//!    if the session has expired).
//! 2. For each [`ClusterSelector`], the [`CredentialStore`] is consulted.
//! 3. A cached certificate with more than a minute of validity left is reused.
//! 4. Otherwise the [`CredentialIssuer`] issues one, possibly after an MFA
//!    challenge, and the result is checked against the requested sub-cluster.
//! 5. Certificates issued without MFA are written back to the store.

pub mod credential;
pub mod disk;
pub mod http;
pub mod issuer;
pub mod record;
pub mod resolver;
pub mod selector;
pub mod store;

pub use credential::{CacheLookup, Credential};
pub use disk::{FileCredentialStore, KeyDir};
pub use http::{HttpAuthority, HttpAuthorityConfig, SessionTokens};
pub use issuer::{
    retry_with_relogin, AuthorityConnector, CredentialIssuer, IssuedCredential, MfaChallenge,
    MfaPrompt, MfaResponse,
};
pub use record::{CredentialRecord, CredentialSet, MIN_REMAINING_VALIDITY};
pub use resolver::{check_cluster_access, CredentialResolver};
pub use selector::{remote_clusters, ClusterKey, ClusterSelector};
pub use store::{CredentialStore, MemoryCredentialStore};

use thiserror::Error;

/// Credential errors
#[derive(Debug, Error)]
pub enum CredentialError {
    /// No cached credential, or none for the requested sub-cluster
    #[error("Not found: {0}")]
    NotFound(String),

    /// The issued certificate does not grant access to the requested sub-cluster
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// The session with the remote authority must be renewed
    #[error("Session expired: {0}")]
    SessionExpired(String),

    #[error("Credential store error: {0}")]
    Store(String),

    #[error("Issuance failed: {0}")]
    Issuance(String),

    #[error("MFA failed: {0}")]
    Mfa(String),

    #[error("Certificate error: {0}")]
    Certificate(#[from] kproxy_cert::CertError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CredentialError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CredentialError::NotFound(_))
    }

    pub fn is_session_expired(&self) -> bool {
        matches!(self, CredentialError::SessionExpired(_))
    }
}
