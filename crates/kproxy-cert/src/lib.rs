//! Certificate handling for the local Kubernetes proxy
//!
//! Loads client certificates from PEM, inspects X.509 validity and identity,
//! and manages the per-cluster local CA that signs the certificates presented
//! by the local routing listener.

pub mod local_ca;
pub mod pem;
pub mod x509;

pub use local_ca::{
    generate_private_key_pem, load_self_signed_ca, public_key_pem, LocalCa, CA_TTL_DAYS,
};
pub use pem::{parse_certificates, parse_private_key};
pub use x509::{inspect, CertInfo};

// Re-exported so callers can mint keys for `LocalCa::sign_client_cert`
pub use rcgen::KeyPair;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;

/// Certificate errors
#[derive(Debug, Error)]
pub enum CertError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("PEM error: {0}")]
    Pem(String),

    #[error("X.509 parse error: {0}")]
    X509(String),

    #[error("Certificate generation error: {0}")]
    Generation(String),

    #[error("Private key error: {0}")]
    Key(String),
}

impl From<rcgen::Error> for CertError {
    fn from(e: rcgen::Error) -> Self {
        CertError::Generation(e.to_string())
    }
}

/// Certificate with private key
#[derive(Debug)]
pub struct Certificate {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
}

impl Certificate {
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Self {
        Self {
            cert_chain,
            private_key,
        }
    }

    /// Build a certificate from PEM encoded chain and key
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, CertError> {
        let cert_chain = parse_certificates(cert_pem)?;
        let private_key = parse_private_key(key_pem)?;
        Ok(Self::new(cert_chain, private_key))
    }

    /// The end-entity certificate
    pub fn leaf(&self) -> Option<&CertificateDer<'static>> {
        self.cert_chain.first()
    }

    /// Inspect the end-entity certificate
    pub fn info(&self) -> Result<CertInfo, CertError> {
        let leaf = self
            .leaf()
            .ok_or_else(|| CertError::Pem("Empty certificate chain".to_string()))?;
        inspect(leaf)
    }
}

impl Clone for Certificate {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            private_key: self.private_key.clone_key(),
        }
    }
}
