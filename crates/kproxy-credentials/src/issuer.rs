//! Remote issuance of sub-cluster certificates

use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::info;

use crate::{ClusterSelector, Credential, CredentialError};

/// MFA challenge sent by the remote authority
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MfaChallenge {
    /// Authority address the challenge came from, shown to the user
    #[serde(default)]
    pub proxy_addr: String,
    pub challenge_id: String,
    /// Accepted second factors, e.g. `totp`
    #[serde(default)]
    pub methods: Vec<String>,
}

/// Answer to an [`MfaChallenge`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MfaResponse {
    pub challenge_id: String,
    pub totp_code: String,
}

/// Interactive second-factor prompt
///
/// No timeout is applied by callers; the prompt decides how long to wait.
#[async_trait::async_trait]
pub trait MfaPrompt: Send + Sync {
    async fn prompt(&self, challenge: &MfaChallenge) -> Result<MfaResponse, CredentialError>;
}

/// Result of one issuance
#[derive(Debug, Clone)]
pub struct IssuedCredential {
    pub credential: Credential,
    /// Whether an MFA challenge was answered; such certificates are bound to
    /// that one assertion and must not be cached
    pub mfa_required: bool,
}

/// An open session with the remote authority that can issue certificates
#[async_trait::async_trait]
pub trait CredentialIssuer: Send + Sync {
    /// Issue a certificate for `selector.sub_cluster` routed through
    /// `selector.remote_cluster`
    async fn issue(
        &self,
        selector: &ClusterSelector,
        mfa: &dyn MfaPrompt,
    ) -> Result<IssuedCredential, CredentialError>;

    /// Release the session
    async fn close(&self) -> Result<(), CredentialError> {
        Ok(())
    }
}

/// Opens sessions with the remote authority
#[async_trait::async_trait]
pub trait AuthorityConnector: Send + Sync {
    /// Establish the shared session used for every issuance of a run
    async fn connect(&self) -> Result<Box<dyn CredentialIssuer>, CredentialError>;

    /// Renew an expired session
    async fn relogin(&self) -> Result<(), CredentialError>;
}

/// Run `op`, re-authenticating once and retrying if it reports an expired
/// session
pub async fn retry_with_relogin<T, F, Fut>(
    connector: &dyn AuthorityConnector,
    mut op: F,
) -> Result<T, CredentialError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CredentialError>>,
{
    match op().await {
        Err(e) if e.is_session_expired() => {
            info!("Session expired, re-authenticating: {}", e);
            connector.relogin().await?;
            op().await
        }
        result => result,
    }
}
