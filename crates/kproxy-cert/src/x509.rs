//! X.509 inspection
//!
//! Only the fields the proxy makes decisions on are extracted: validity window,
//! subject names, organizational units (which carry the sub-clusters a client
//! certificate is permitted to reach) and the subject public key.

use chrono::{DateTime, Duration, Utc};
use rustls::pki_types::CertificateDer;
use x509_parser::prelude::*;

use crate::CertError;

/// Decoded view of a certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub common_name: Option<String>,
    pub organizational_units: Vec<String>,
    pub dns_names: Vec<String>,
    /// DER encoded SubjectPublicKeyInfo
    pub public_key_der: Vec<u8>,
}

impl CertInfo {
    /// Time left until `not_after`, negative once expired
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.not_after - now
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.not_after <= now
    }
}

fn timestamp(t: &ASN1Time) -> Result<DateTime<Utc>, CertError> {
    DateTime::from_timestamp(t.timestamp(), 0)
        .ok_or_else(|| CertError::X509(format!("Timestamp out of range: {}", t)))
}

/// Decode a DER certificate
pub fn inspect(der: &CertificateDer<'_>) -> Result<CertInfo, CertError> {
    let (_, cert) = X509Certificate::from_der(der.as_ref())
        .map_err(|e| CertError::X509(format!("Failed to parse certificate: {}", e)))?;

    let validity = cert.validity();
    let subject = cert.subject();

    let common_name = subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);

    let organizational_units = subject
        .iter_organizational_unit()
        .filter_map(|ou| ou.as_str().ok())
        .map(str::to_string)
        .collect();

    let dns_names = match cert.subject_alternative_name() {
        Ok(Some(san)) => san
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    Ok(CertInfo {
        not_before: timestamp(&validity.not_before)?,
        not_after: timestamp(&validity.not_after)?,
        common_name,
        organizational_units,
        dns_names,
        public_key_der: cert.public_key().raw.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DnType, KeyPair};

    #[test]
    fn test_inspect_reads_identity_and_validity() {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["api.example.com".to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, "alice");
        params
            .distinguished_name
            .push(DnType::OrganizationalUnitName, "prod");
        params.not_after = ::time::OffsetDateTime::now_utc() + ::time::Duration::hours(2);
        let cert = params.self_signed(&key).unwrap();

        let info = inspect(cert.der()).unwrap();
        assert_eq!(info.common_name.as_deref(), Some("alice"));
        assert_eq!(info.organizational_units, vec!["prod".to_string()]);
        assert_eq!(info.dns_names, vec!["api.example.com".to_string()]);

        let remaining = info.remaining(Utc::now());
        assert!(remaining > Duration::minutes(110));
        assert!(remaining <= Duration::minutes(120));
        assert!(!info.is_expired(Utc::now()));
    }

    #[test]
    fn test_inspect_rejects_garbage() {
        let der = CertificateDer::from(vec![0x30, 0x03, 0x01, 0x02, 0x03]);
        assert!(matches!(inspect(&der), Err(CertError::X509(_))));
    }
}
