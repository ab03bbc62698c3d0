//! PEM decoding helpers

use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::CertError;

/// Parse every certificate in a PEM bundle
pub fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, CertError> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertError::Pem(format!("Failed to parse certs: {}", e)))?;

    if certs.is_empty() {
        return Err(CertError::Pem("No certificate found".to_string()));
    }

    Ok(certs)
}

/// Parse the first private key (PKCS#8, PKCS#1 or SEC1) in a PEM document
pub fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, CertError> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| CertError::Pem(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| CertError::Pem("No private key found".to_string()))
}
