//! Self-signed local CA per remote cluster
//!
//! Kubernetes clients pointed at the local proxy trust this CA (via the
//! published kubeconfig) instead of the remote cluster's CA. The CA is signed
//! with the profile's client key so the same file can also serve as the
//! client certificate paired with that key.

use chrono::{DateTime, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fs;
use std::path::Path;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::{inspect, Certificate, CertError};

/// Lifetime of a freshly minted local CA
pub const CA_TTL_DAYS: i64 = 365;

/// Generate a new PKCS#8 private key in PEM form
pub fn generate_private_key_pem() -> Result<String, CertError> {
    Ok(KeyPair::generate()?.serialize_pem())
}

/// Derive the PEM encoded SubjectPublicKeyInfo for a private key
pub fn public_key_pem(private_key_pem: &str) -> Result<String, CertError> {
    let key = KeyPair::from_pem(private_key_pem)
        .map_err(|e| CertError::Key(format!("Failed to load private key: {}", e)))?;
    Ok(key.public_key_pem())
}

fn to_offset(t: DateTime<Utc>) -> Result<OffsetDateTime, CertError> {
    OffsetDateTime::from_unix_timestamp(t.timestamp())
        .map_err(|e| CertError::Generation(format!("Invalid timestamp {}: {}", t, e)))
}

/// A loaded local CA able to sign leaf certificates
pub struct LocalCa {
    cert_pem: String,
    cert_der: CertificateDer<'static>,
    not_after: DateTime<Utc>,
    key: KeyPair,
    issuer: rcgen::Certificate,
}

impl std::fmt::Debug for LocalCa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCa")
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

impl LocalCa {
    /// Mint a new CA for `domain`, valid until `valid_until`
    pub fn generate(
        key: KeyPair,
        domain: &str,
        valid_until: DateTime<Utc>,
    ) -> Result<Self, CertError> {
        let mut params = CertificateParams::new(vec![domain.to_string()])?;
        params.distinguished_name.push(DnType::CommonName, domain);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = OffsetDateTime::now_utc() - time::Duration::minutes(1);
        params.not_after = to_offset(valid_until)?;

        let issuer = params.self_signed(&key)?;
        let cert_pem = issuer.pem();
        let cert_der = issuer.der().clone();
        let not_after = inspect(&cert_der)?.not_after;

        Ok(Self {
            cert_pem,
            cert_der,
            not_after,
            key,
            issuer,
        })
    }

    /// Rebuild a CA from its PEM certificate and signing key
    ///
    /// Fails when the key does not match the certificate's public key.
    pub fn from_pem(cert_pem: &str, key: KeyPair) -> Result<Self, CertError> {
        let cert_der = crate::parse_certificates(cert_pem.as_bytes())?
            .into_iter()
            .next()
            .ok_or_else(|| CertError::Pem("No certificate found".to_string()))?;
        let info = inspect(&cert_der)?;

        if info.public_key_der != key.public_key_der() {
            return Err(CertError::Key(
                "CA certificate was not issued for this key".to_string(),
            ));
        }

        let params = CertificateParams::from_ca_cert_pem(cert_pem)?;
        let issuer = params.self_signed(&key)?;

        Ok(Self {
            cert_pem: cert_pem.to_string(),
            cert_der,
            not_after: info.not_after,
            key,
            issuer,
        })
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Issue a serving certificate for `dns_names`, expiring with the CA
    ///
    /// The returned chain is leaf followed by the CA.
    pub fn issue_server_cert(&self, dns_names: &[String]) -> Result<Certificate, CertError> {
        let leaf_key = KeyPair::generate()?;
        let mut params = CertificateParams::new(dns_names.to_vec())?;
        if let Some(first) = dns_names.first() {
            params.distinguished_name.push(DnType::CommonName, first.as_str());
        }
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.not_before = OffsetDateTime::now_utc() - time::Duration::minutes(1);
        params.not_after = to_offset(self.not_after)?;

        let leaf = params.signed_by(&leaf_key, &self.issuer, &self.key)?;
        let private_key =
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));

        Ok(Certificate::new(
            vec![leaf.der().clone(), self.cert_der.clone()],
            private_key,
        ))
    }

    /// Sign a client certificate for `subject_key`
    ///
    /// `organizational_units` lists the sub-clusters the certificate may reach.
    /// Returns the PEM encoded leaf.
    pub fn sign_client_cert(
        &self,
        subject_key: &KeyPair,
        common_name: &str,
        organizational_units: &[String],
        not_after: DateTime<Utc>,
    ) -> Result<String, CertError> {
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, common_name);
        for unit in organizational_units {
            params
                .distinguished_name
                .push(DnType::OrganizationalUnitName, unit.as_str());
        }
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        params.not_before = OffsetDateTime::now_utc() - time::Duration::minutes(1);
        params.not_after = to_offset(not_after)?;

        let cert = params.signed_by(subject_key, &self.issuer, &self.key)?;
        Ok(cert.pem())
    }
}

fn reuse_existing(ca_path: &Path, key_pem: &str) -> Option<LocalCa> {
    let cert_pem = fs::read_to_string(ca_path).ok()?;
    let key = KeyPair::from_pem(key_pem).ok()?;

    match LocalCa::from_pem(&cert_pem, key) {
        Ok(ca) if ca.not_after > Utc::now() => Some(ca),
        Ok(_) => {
            debug!("Local CA at {:?} has expired", ca_path);
            None
        }
        Err(e) => {
            debug!("Local CA at {:?} is unusable: {}", ca_path, e);
            None
        }
    }
}

/// Load the local CA at `ca_path`, minting a new one when it is missing,
/// expired or was signed by a different key than the one at `key_path`.
pub fn load_self_signed_ca(
    ca_path: &Path,
    key_path: &Path,
    valid_until: DateTime<Utc>,
    domain: &str,
) -> Result<LocalCa, CertError> {
    let key_pem = fs::read_to_string(key_path)?;

    if let Some(ca) = reuse_existing(ca_path, &key_pem) {
        debug!("Reusing local CA from {:?}", ca_path);
        return Ok(ca);
    }

    let key = KeyPair::from_pem(&key_pem)
        .map_err(|e| CertError::Key(format!("Failed to load private key: {}", e)))?;
    let ca = LocalCa::generate(key, domain, valid_until)?;

    if let Some(parent) = ca_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(ca_path, ca.cert_pem())?;
    info!("Generated local CA for {} at {:?}", domain, ca_path);

    Ok(ca)
}
