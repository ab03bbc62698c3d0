//! Server names used between Kubernetes clients and the routing server
//!
//! Each kube cluster is addressed as `<hex(kube cluster)>.<remote cluster>`.
//! Hex encoding keeps arbitrary kube cluster names inside a single DNS label,
//! so one `*.<remote cluster>` certificate covers every kube cluster of a
//! remote cluster.
//!
//! ```
//! use kproxy_server_tls::sni::{local_proxy_sni, parse_local_proxy_sni};
//!
//! let sni = local_proxy_sni("root.example.com", "prod");
//! assert_eq!(sni, "70726f64.root.example.com");
//!
//! let key = parse_local_proxy_sni(&sni).unwrap();
//! assert_eq!(key.sub_cluster, "prod");
//! ```

use kproxy_credentials::ClusterKey;
use std::fmt::Write;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SniError {
    #[error("Server name has no remote cluster part: {0}")]
    MissingRemoteCluster(String),

    #[error("Server name label is not hex encoded: {0}")]
    InvalidEncoding(String),

    #[error("Kube cluster name is not UTF-8: {0}")]
    InvalidUtf8(String),
}

/// Server name a Kubernetes client uses to reach `sub_cluster`
pub fn local_proxy_sni(remote_cluster: &str, sub_cluster: &str) -> String {
    let mut sni = String::with_capacity(sub_cluster.len() * 2 + remote_cluster.len() + 1);
    for byte in sub_cluster.bytes() {
        let _ = write!(sni, "{:02x}", byte);
    }
    sni.push('.');
    sni.push_str(remote_cluster);
    sni
}

/// Wildcard domain covering every kube cluster of `remote_cluster`
pub fn local_proxy_wildcard_domain(remote_cluster: &str) -> String {
    format!("*.{}", remote_cluster)
}

/// Remote cluster part of a local proxy server name
pub fn remote_cluster_of(sni: &str) -> Option<&str> {
    sni.split_once('.')
        .map(|(_, remote)| remote)
        .filter(|remote| !remote.is_empty())
}

/// Recover the cluster pair from a server name
pub fn parse_local_proxy_sni(sni: &str) -> Result<ClusterKey, SniError> {
    let (label, remote_cluster) = sni
        .split_once('.')
        .filter(|(_, remote)| !remote.is_empty())
        .ok_or_else(|| SniError::MissingRemoteCluster(sni.to_string()))?;

    if label.is_empty() || !label.is_ascii() || label.len() % 2 != 0 {
        return Err(SniError::InvalidEncoding(label.to_string()));
    }

    let bytes = (0..label.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&label[i..i + 2], 16))
        .collect::<Result<Vec<u8>, _>>()
        .map_err(|_| SniError::InvalidEncoding(label.to_string()))?;
    let sub_cluster =
        String::from_utf8(bytes).map_err(|_| SniError::InvalidUtf8(label.to_string()))?;

    Ok(ClusterKey::new(remote_cluster, sub_cluster))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sni_encoding() {
        assert_eq!(local_proxy_sni("clusterA", "prod"), "70726f64.clusterA");
        assert_eq!(local_proxy_sni("clusterA", "a.b"), "612e62.clusterA");
        assert_eq!(local_proxy_wildcard_domain("clusterA"), "*.clusterA");
    }

    #[test]
    fn test_parse_sni() {
        let key = parse_local_proxy_sni("7374616769_6e67.clusterA");
        assert!(key.is_err());

        let key = parse_local_proxy_sni(&local_proxy_sni("root.example.com", "my.kube")).unwrap();
        assert_eq!(key, ClusterKey::new("root.example.com", "my.kube"));
    }

    #[test]
    fn test_parse_sni_rejects_malformed_names() {
        assert_eq!(
            parse_local_proxy_sni("clusterA"),
            Err(SniError::MissingRemoteCluster("clusterA".to_string()))
        );
        assert_eq!(
            parse_local_proxy_sni("abc.clusterA"),
            Err(SniError::InvalidEncoding("abc".to_string()))
        );
        assert_eq!(
            parse_local_proxy_sni("zz.clusterA"),
            Err(SniError::InvalidEncoding("zz".to_string()))
        );
        assert_eq!(
            parse_local_proxy_sni("ff.clusterA"),
            Err(SniError::InvalidUtf8("ff".to_string()))
        );
    }

    #[test]
    fn test_remote_cluster_of() {
        assert_eq!(remote_cluster_of("70726f64.clusterA"), Some("clusterA"));
        assert_eq!(remote_cluster_of("clusterA"), None);
        assert_eq!(remote_cluster_of("70726f64."), None);
    }
}
