//! Published local proxy configuration

use kproxy_credentials::{ClusterSelector, CredentialSet, KeyDir};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::kubeconfig::{save_local_proxy_values, KubeConfig, KubeConfigError};

/// Values a Kubernetes client needs to reach the selected clusters through
/// the local proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedConfig {
    /// `http://<forward proxy address>`
    pub proxy_url: String,
    pub listen_address: String,
    /// Server URL written for every proxied cluster
    pub kube_cluster_server: String,
    /// Local CA certificate per remote cluster
    pub ca_paths: BTreeMap<String, PathBuf>,
    pub client_key_path: PathBuf,
    pub clusters: Vec<ClusterSelector>,
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Explicit output path; wins over the port-derived default
    pub path_override: Option<PathBuf>,
    pub key_dir: KeyDir,
    /// Kube cluster address of the remote authority, `host:port`
    pub kube_cluster_addr: String,
}

pub struct ConfigPublisher {
    config: PublisherConfig,
}

impl ConfigPublisher {
    pub fn new(config: PublisherConfig) -> Self {
        Self { config }
    }

    /// Where the kubeconfig for a proxy listening on `proxy_addr` goes
    ///
    /// The default name depends only on the port, so restarting on the same
    /// port rewrites the same file.
    pub fn path_for(&self, proxy_addr: SocketAddr) -> PathBuf {
        match &self.config.path_override {
            Some(path) => path.clone(),
            None => self
                .config
                .key_dir
                .kubeconfig_path(&format!("localproxy-{}", proxy_addr.port())),
        }
    }

    /// Derive the published values
    ///
    /// Selectors without a resolved credential are left out.
    pub fn published_config(
        &self,
        credentials: &CredentialSet,
        clusters: &[ClusterSelector],
        proxy_addr: SocketAddr,
    ) -> PublishedConfig {
        let clusters: Vec<ClusterSelector> = clusters
            .iter()
            .filter(|selector| {
                let served = credentials.get(&selector.key()).is_some();
                if !served {
                    warn!("No credential for {}; leaving it out of the kubeconfig", selector);
                }
                served
            })
            .cloned()
            .collect();

        let ca_paths = clusters
            .iter()
            .map(|selector| {
                (
                    selector.remote_cluster.clone(),
                    self.config.key_dir.local_ca_path(&selector.remote_cluster),
                )
            })
            .collect();

        PublishedConfig {
            proxy_url: format!("http://{}", proxy_addr),
            listen_address: proxy_addr.to_string(),
            kube_cluster_server: kube_cluster_server(&self.config.kube_cluster_addr),
            ca_paths,
            client_key_path: self.config.key_dir.key_path(),
            clusters,
        }
    }

    /// Merge the published values into `base` and write them
    ///
    /// Returns the path written.
    pub fn write(
        &self,
        base: &KubeConfig,
        credentials: &CredentialSet,
        clusters: &[ClusterSelector],
        proxy_addr: SocketAddr,
    ) -> Result<PathBuf, KubeConfigError> {
        let path = self.path_for(proxy_addr);
        let values = self.published_config(credentials, clusters, proxy_addr);
        save_local_proxy_values(&path, base, &values)?;
        info!("Kubeconfig for the local proxy written to {:?}", path);
        Ok(path)
    }
}

fn kube_cluster_server(addr: &str) -> String {
    if addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("https://{}", addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn publisher(path_override: Option<PathBuf>) -> ConfigPublisher {
        ConfigPublisher::new(PublisherConfig {
            path_override,
            key_dir: KeyDir::new(Path::new("/home/alice/.kproxy"), "proxy.example.com", "alice"),
            kube_cluster_addr: "proxy.example.com:3026".to_string(),
        })
    }

    #[test]
    fn test_default_path_follows_port() {
        let publisher = publisher(None);
        let addr: SocketAddr = "127.0.0.1:8443".parse().unwrap();

        assert_eq!(
            publisher.path_for(addr),
            PathBuf::from("/home/alice/.kproxy/keys/proxy.example.com/alice-kube/localproxy-8443")
        );
        assert_eq!(publisher.path_for(addr), publisher.path_for(addr));
    }

    #[test]
    fn test_override_wins() {
        let publisher = publisher(Some(PathBuf::from("/tmp/kubeconfig")));
        assert_eq!(
            publisher.path_for("127.0.0.1:8443".parse().unwrap()),
            PathBuf::from("/tmp/kubeconfig")
        );
    }

    #[test]
    fn test_published_config_skips_unresolved() {
        let publisher = publisher(None);
        let values = publisher.published_config(
            &CredentialSet::new(),
            &[ClusterSelector::new("clusterA", "prod")],
            "127.0.0.1:8443".parse().unwrap(),
        );

        assert!(values.clusters.is_empty());
        assert!(values.ca_paths.is_empty());
        assert_eq!(values.proxy_url, "http://127.0.0.1:8443");
        assert_eq!(values.kube_cluster_server, "https://proxy.example.com:3026");
    }
}
