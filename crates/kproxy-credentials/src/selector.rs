//! Cluster selection

use serde::{Deserialize, Serialize};
use std::fmt;

/// A (remote cluster, sub-cluster) pair plus the per-cluster client settings
/// written into the published kubeconfig.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterSelector {
    pub remote_cluster: String,
    pub sub_cluster: String,
    #[serde(default)]
    pub impersonate_user: String,
    #[serde(default)]
    pub impersonate_groups: Vec<String>,
    #[serde(default)]
    pub namespace: String,
}

impl ClusterSelector {
    pub fn new(remote_cluster: impl Into<String>, sub_cluster: impl Into<String>) -> Self {
        Self {
            remote_cluster: remote_cluster.into(),
            sub_cluster: sub_cluster.into(),
            impersonate_user: String::new(),
            impersonate_groups: Vec::new(),
            namespace: String::new(),
        }
    }

    pub fn with_impersonation(mut self, user: impl Into<String>, groups: Vec<String>) -> Self {
        self.impersonate_user = user.into();
        self.impersonate_groups = groups;
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn key(&self) -> ClusterKey {
        ClusterKey::new(&self.remote_cluster, &self.sub_cluster)
    }
}

impl fmt::Display for ClusterSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.remote_cluster, self.sub_cluster)
    }
}

/// Identity of a selector across a run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterKey {
    pub remote_cluster: String,
    pub sub_cluster: String,
}

impl ClusterKey {
    pub fn new(remote_cluster: impl Into<String>, sub_cluster: impl Into<String>) -> Self {
        Self {
            remote_cluster: remote_cluster.into(),
            sub_cluster: sub_cluster.into(),
        }
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.remote_cluster, self.sub_cluster)
    }
}

/// Distinct remote clusters in selection order
pub fn remote_clusters(selectors: &[ClusterSelector]) -> Vec<String> {
    let mut clusters: Vec<String> = Vec::new();
    for selector in selectors {
        if !clusters.contains(&selector.remote_cluster) {
            clusters.push(selector.remote_cluster.clone());
        }
    }
    clusters
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_clusters_are_deduplicated_in_order() {
        let selectors = vec![
            ClusterSelector::new("clusterB", "dev"),
            ClusterSelector::new("clusterA", "prod"),
            ClusterSelector::new("clusterB", "staging"),
        ];
        assert_eq!(
            remote_clusters(&selectors),
            vec!["clusterB".to_string(), "clusterA".to_string()]
        );
    }

    #[test]
    fn test_key_ignores_client_settings() {
        let plain = ClusterSelector::new("clusterA", "prod");
        let custom = ClusterSelector::new("clusterA", "prod")
            .with_impersonation("admin", vec!["ops".to_string()])
            .with_namespace("kube-system");
        assert_eq!(plain.key(), custom.key());
        assert_ne!(plain, custom);
        assert_eq!(custom.to_string(), "clusterA/prod");
    }
}
