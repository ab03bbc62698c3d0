//! HTTP client for the remote authority
//!
//! Endpoints (all JSON, bearer-authenticated with the session token):
//!
//! - `GET  /v1/session`: session check; `401` means the session expired
//! - `POST /v1/session/renew`: exchange the renew token for a new session
//! - `POST /v1/certs/kube`: issue a sub-cluster client certificate; answers
//!   either with `cert_pem` or with an `mfa_challenge` to be answered in a
//!   second request

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use crate::{
    AuthorityConnector, ClusterSelector, Credential, CredentialError, CredentialIssuer,
    IssuedCredential, MfaChallenge, MfaPrompt, MfaResponse,
};

/// Session credentials kept in the user's profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTokens {
    pub session_token: String,
    #[serde(default)]
    pub renew_token: Option<String>,
}

/// Configuration for [`HttpAuthority`]
#[derive(Clone)]
pub struct HttpAuthorityConfig {
    /// Base URL, e.g. `https://proxy.example.com:3080`
    pub base_url: String,
    /// Client private key; only its public half is sent
    pub client_key_pem: String,
    pub tokens: SessionTokens,
    /// Extra PEM root certificates trusted for the authority
    pub root_certs_pem: Vec<Vec<u8>>,
}

impl std::fmt::Debug for HttpAuthorityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAuthorityConfig")
            .field("base_url", &self.base_url)
            .field("root_certs_pem", &self.root_certs_pem.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize)]
struct KubeCertRequest<'a> {
    route_to_cluster: &'a str,
    kubernetes_cluster: &'a str,
    public_key_pem: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    mfa_response: Option<&'a MfaResponse>,
}

#[derive(Debug, Deserialize)]
struct KubeCertResponse {
    #[serde(default)]
    cert_pem: Option<String>,
    #[serde(default)]
    mfa_challenge: Option<MfaChallenge>,
}

#[derive(Debug, Serialize)]
struct RenewRequest<'a> {
    renew_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct RenewResponse {
    session_token: String,
    #[serde(default)]
    renew_token: Option<String>,
}

fn transport_error(e: reqwest::Error) -> CredentialError {
    CredentialError::Issuance(format!("request to authority failed: {}", e))
}

async fn status_error(response: reqwest::Response) -> CredentialError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED => CredentialError::SessionExpired(body),
        StatusCode::FORBIDDEN => CredentialError::AccessDenied(body),
        _ => CredentialError::Issuance(format!("authority returned {}: {}", status, body)),
    }
}

/// Remote authority reached over HTTPS
pub struct HttpAuthority {
    client: reqwest::Client,
    base_url: String,
    client_key_pem: String,
    public_key_pem: String,
    tokens: Arc<RwLock<SessionTokens>>,
}

impl HttpAuthority {
    pub fn new(config: HttpAuthorityConfig) -> Result<Self, CredentialError> {
        let mut builder = reqwest::Client::builder().use_rustls_tls();
        for pem in &config.root_certs_pem {
            let cert = reqwest::Certificate::from_pem(pem).map_err(|e| {
                CredentialError::Issuance(format!("invalid authority root certificate: {}", e))
            })?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder.build().map_err(transport_error)?;
        let public_key_pem = kproxy_cert::public_key_pem(&config.client_key_pem)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client_key_pem: config.client_key_pem,
            public_key_pem,
            tokens: Arc::new(RwLock::new(config.tokens)),
        })
    }

    /// Current session tokens, changed by a successful relogin
    pub fn tokens(&self) -> SessionTokens {
        self.tokens
            .read()
            .map(|tokens| tokens.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    fn set_tokens(&self, tokens: SessionTokens) {
        match self.tokens.write() {
            Ok(mut guard) => *guard = tokens,
            Err(poisoned) => *poisoned.into_inner() = tokens,
        }
    }
}

#[async_trait::async_trait]
impl AuthorityConnector for HttpAuthority {
    async fn connect(&self) -> Result<Box<dyn CredentialIssuer>, CredentialError> {
        let session_token = self.tokens().session_token;

        let response = self
            .client
            .get(format!("{}/v1/session", self.base_url))
            .bearer_auth(&session_token)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        debug!("Connected to authority at {}", self.base_url);

        Ok(Box::new(HttpIssuer {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            session_token,
            client_key_pem: self.client_key_pem.clone(),
            public_key_pem: self.public_key_pem.clone(),
        }))
    }

    async fn relogin(&self) -> Result<(), CredentialError> {
        let renew_token = self.tokens().renew_token.ok_or_else(|| {
            CredentialError::SessionExpired(
                "no renew token available; log in again".to_string(),
            )
        })?;

        let response = self
            .client
            .post(format!("{}/v1/session/renew", self.base_url))
            .json(&RenewRequest {
                renew_token: &renew_token,
            })
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let renewed: RenewResponse = response.json().await.map_err(transport_error)?;
        self.set_tokens(SessionTokens {
            session_token: renewed.session_token,
            renew_token: renewed.renew_token.or(Some(renew_token)),
        });
        info!("Renewed authority session");
        Ok(())
    }
}

/// Issuer bound to one authenticated session
struct HttpIssuer {
    client: reqwest::Client,
    base_url: String,
    session_token: String,
    client_key_pem: String,
    public_key_pem: String,
}

impl HttpIssuer {
    async fn request_kube_cert(
        &self,
        request: &KubeCertRequest<'_>,
    ) -> Result<KubeCertResponse, CredentialError> {
        let response = self
            .client
            .post(format!("{}/v1/certs/kube", self.base_url))
            .bearer_auth(&self.session_token)
            .json(request)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        response.json().await.map_err(transport_error)
    }
}

#[async_trait::async_trait]
impl CredentialIssuer for HttpIssuer {
    async fn issue(
        &self,
        selector: &ClusterSelector,
        mfa: &dyn MfaPrompt,
    ) -> Result<IssuedCredential, CredentialError> {
        let request = KubeCertRequest {
            route_to_cluster: &selector.remote_cluster,
            kubernetes_cluster: &selector.sub_cluster,
            public_key_pem: &self.public_key_pem,
            mfa_response: None,
        };

        let mut response = self.request_kube_cert(&request).await?;
        let mut mfa_required = false;

        if let Some(challenge) = response.mfa_challenge.take() {
            debug!("MFA required to issue certificate for {}", selector);
            let answer = mfa.prompt(&challenge).await?;
            mfa_required = true;
            response = self
                .request_kube_cert(&KubeCertRequest {
                    mfa_response: Some(&answer),
                    ..request
                })
                .await?;
        }

        let cert_pem = response.cert_pem.ok_or_else(|| {
            CredentialError::Issuance(format!("authority returned no certificate for {}", selector))
        })?;

        Ok(IssuedCredential {
            credential: Credential::new(&selector.remote_cluster, &self.client_key_pem)
                .with_kube_cert(&selector.sub_cluster, cert_pem),
            mfa_required,
        })
    }
}
