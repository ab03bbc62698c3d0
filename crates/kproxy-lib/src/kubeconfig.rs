//! Kubeconfig model and local proxy entries
//!
//! Only the fields the local proxy reads or writes are modelled; everything
//! else round-trips through the flattened `extra` maps.

use kproxy_credentials::ClusterSelector;
use kproxy_server_tls::local_proxy_sni;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::publisher::PublishedConfig;

/// Context extension naming the kube cluster a context reaches
pub const KUBE_CLUSTER_EXTENSION: &str = "kproxy.dev/kube-cluster";
/// Context extension naming the remote cluster a context routes through
pub const REMOTE_CLUSTER_EXTENSION: &str = "kproxy.dev/remote-cluster";

#[derive(Debug, Error)]
pub enum KubeConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse kubeconfig {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Failed to serialize kubeconfig: {0}")]
    Serialize(String),

    #[error("No local CA path for remote cluster {0}")]
    MissingCa(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KubeConfig {
    #[serde(rename = "apiVersion", default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub clusters: Vec<NamedCluster>,
    #[serde(default)]
    pub contexts: Vec<NamedContext>,
    #[serde(default)]
    pub users: Vec<NamedAuthInfo>,
    #[serde(rename = "current-context", default)]
    pub current_context: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferences: Option<Value>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn default_api_version() -> String {
    "v1".to_string()
}

fn default_kind() -> String {
    "Config".to_string()
}

impl Default for KubeConfig {
    fn default() -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            clusters: Vec::new(),
            contexts: Vec::new(),
            users: Vec::new(),
            current_context: String::new(),
            preferences: None,
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: Cluster,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Cluster {
    #[serde(default)]
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_authority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_server_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub context: Context,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
    #[serde(default)]
    pub cluster: String,
    #[serde(default)]
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<NamedExtension>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Context {
    pub fn extension(&self, name: &str) -> Option<&str> {
        self.extensions
            .iter()
            .find(|ext| ext.name == name)
            .and_then(|ext| ext.extension.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedExtension {
    pub name: String,
    pub extension: Value,
}

impl NamedExtension {
    fn string(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            extension: Value::String(value.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedAuthInfo {
    pub name: String,
    pub user: AuthInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AuthInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_certificate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub impersonate: Option<String>,
    #[serde(rename = "as-groups", default, skip_serializing_if = "Vec::is_empty")]
    pub impersonate_groups: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// `$KUBECONFIG` (first entry) or `~/.kube/config`
pub fn default_kubeconfig_path() -> Option<PathBuf> {
    if let Some(paths) = std::env::var_os("KUBECONFIG") {
        if let Some(first) = std::env::split_paths(&paths).find(|p| !p.as_os_str().is_empty()) {
            return Some(first);
        }
    }
    dirs::home_dir().map(|home| home.join(".kube").join("config"))
}

/// Name shared by the cluster, user and context entries of one kube cluster
pub fn local_proxy_context_name(remote_cluster: &str, sub_cluster: &str) -> String {
    format!("{}-{}", remote_cluster, sub_cluster)
}

fn upsert<T>(entries: &mut Vec<T>, name: &str, entry: T, name_of: impl Fn(&T) -> &str) {
    match entries.iter_mut().find(|existing| name_of(existing) == name) {
        Some(existing) => *existing = entry,
        None => entries.push(entry),
    }
}

impl KubeConfig {
    /// Load a kubeconfig; a missing or empty file is an empty config
    pub fn load(path: &Path) -> Result<Self, KubeConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No kubeconfig at {:?}; starting from an empty one", path);
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_yaml::from_str(&content).map_err(|e| KubeConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Load the user's default kubeconfig
    pub fn load_default() -> Result<Self, KubeConfigError> {
        match default_kubeconfig_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    /// Write as YAML readable only by the owner
    pub fn save(&self, path: &Path) -> Result<(), KubeConfigError> {
        let yaml =
            serde_yaml::to_string(self).map_err(|e| KubeConfigError::Serialize(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, yaml)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    pub fn cluster(&self, name: &str) -> Option<&Cluster> {
        self.clusters
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| &entry.cluster)
    }

    pub fn context(&self, name: &str) -> Option<&Context> {
        self.contexts
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| &entry.context)
    }

    pub fn user(&self, name: &str) -> Option<&AuthInfo> {
        self.users
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| &entry.user)
    }

    /// Copy of this config with one cluster, user and context per selected
    /// kube cluster pointing at the local proxy
    ///
    /// Unrelated entries are kept. The current context is kept when it is one
    /// of the proxied contexts, otherwise the first proxied context is selected.
    pub fn with_local_proxy_values(
        &self,
        values: &PublishedConfig,
    ) -> Result<KubeConfig, KubeConfigError> {
        let mut config = self.clone();
        let client_key = values.client_key_path.to_string_lossy().to_string();
        let mut proxied = Vec::with_capacity(values.clusters.len());

        for selector in &values.clusters {
            let ca_path = values
                .ca_paths
                .get(&selector.remote_cluster)
                .ok_or_else(|| KubeConfigError::MissingCa(selector.remote_cluster.clone()))?
                .to_string_lossy()
                .to_string();
            let name = local_proxy_context_name(&selector.remote_cluster, &selector.sub_cluster);

            upsert(
                &mut config.clusters,
                &name,
                NamedCluster {
                    name: name.clone(),
                    cluster: Cluster {
                        server: values.kube_cluster_server.clone(),
                        certificate_authority: Some(ca_path.clone()),
                        tls_server_name: Some(local_proxy_sni(
                            &selector.remote_cluster,
                            &selector.sub_cluster,
                        )),
                        proxy_url: Some(values.proxy_url.clone()),
                        extra: BTreeMap::new(),
                    },
                },
                |entry| &entry.name,
            );

            upsert(
                &mut config.users,
                &name,
                NamedAuthInfo {
                    name: name.clone(),
                    user: AuthInfo {
                        client_certificate: Some(ca_path),
                        client_key: Some(client_key.clone()),
                        impersonate: Some(selector.impersonate_user.clone())
                            .filter(|user| !user.is_empty()),
                        impersonate_groups: selector.impersonate_groups.clone(),
                        extra: BTreeMap::new(),
                    },
                },
                |entry| &entry.name,
            );

            upsert(
                &mut config.contexts,
                &name,
                NamedContext {
                    name: name.clone(),
                    context: Context {
                        cluster: name.clone(),
                        user: name.clone(),
                        namespace: Some(selector.namespace.clone())
                            .filter(|namespace| !namespace.is_empty()),
                        extensions: vec![
                            NamedExtension::string(
                                REMOTE_CLUSTER_EXTENSION,
                                &selector.remote_cluster,
                            ),
                            NamedExtension::string(KUBE_CLUSTER_EXTENSION, &selector.sub_cluster),
                        ],
                        extra: BTreeMap::new(),
                    },
                },
                |entry| &entry.name,
            );

            proxied.push(name);
        }

        if !proxied.contains(&config.current_context) {
            if let Some(first) = proxied.first() {
                config.current_context = first.clone();
            }
        }

        Ok(config)
    }
}

/// Merge the local proxy entries into `base` and write the result to `path`
pub fn save_local_proxy_values(
    path: &Path,
    base: &KubeConfig,
    values: &PublishedConfig,
) -> Result<(), KubeConfigError> {
    let config = base.with_local_proxy_values(values)?;
    config.save(path)?;
    debug!(
        "Wrote kubeconfig with {} local proxy context(s) to {:?}",
        values.clusters.len(),
        path
    );
    Ok(())
}

/// Selectors for every context of `config` that reaches `kube_cluster_addr`
/// and names its remote and kube cluster
pub fn local_proxy_clusters_from_config(
    config: &KubeConfig,
    kube_cluster_addr: &str,
) -> Vec<ClusterSelector> {
    let wanted = kube_cluster_addr
        .trim_start_matches("https://")
        .trim_end_matches('/');

    config
        .contexts
        .iter()
        .filter_map(|entry| {
            let context = &entry.context;
            let cluster = config.cluster(&context.cluster)?;
            let server = cluster
                .server
                .trim_start_matches("https://")
                .trim_end_matches('/');
            if server != wanted {
                return None;
            }

            let remote_cluster = context.extension(REMOTE_CLUSTER_EXTENSION)?;
            let sub_cluster = context.extension(KUBE_CLUSTER_EXTENSION)?;
            let mut selector = ClusterSelector::new(remote_cluster, sub_cluster);

            if let Some(user) = config.user(&context.user) {
                selector = selector.with_impersonation(
                    user.impersonate.clone().unwrap_or_default(),
                    user.impersonate_groups.clone(),
                );
            }
            if let Some(namespace) = &context.namespace {
                selector = selector.with_namespace(namespace.as_str());
            }
            Some(selector)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const BASE: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: minikube
  cluster:
    server: https://192.168.49.2:8443
    certificate-authority-data: Zm9v
contexts:
- name: minikube
  context:
    cluster: minikube
    user: minikube
users:
- name: minikube
  user:
    token: secret
current-context: minikube
"#;

    fn values(clusters: Vec<ClusterSelector>) -> PublishedConfig {
        let mut ca_paths = BTreeMap::new();
        ca_paths.insert(
            "clusterA".to_string(),
            PathBuf::from("/keys/alice-kube/clusterA/localca.pem"),
        );
        PublishedConfig {
            proxy_url: "http://127.0.0.1:8443".to_string(),
            listen_address: "127.0.0.1:8443".to_string(),
            kube_cluster_server: "https://proxy.example.com:3026".to_string(),
            ca_paths,
            client_key_path: PathBuf::from("/keys/alice"),
            clusters,
        }
    }

    #[test]
    fn test_missing_file_is_empty_config() {
        let temp = TempDir::new().unwrap();
        let config = KubeConfig::load(&temp.path().join("nope")).unwrap();
        assert_eq!(config, KubeConfig::default());
        assert_eq!(config.api_version, "v1");
    }

    #[test]
    fn test_unknown_fields_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config");
        std::fs::write(&path, BASE).unwrap();

        let config = KubeConfig::load(&path).unwrap();
        assert_eq!(config.current_context, "minikube");
        assert!(config.clusters[0]
            .cluster
            .extra
            .contains_key("certificate-authority-data"));

        let out = temp.path().join("out");
        config.save(&out).unwrap();
        assert_eq!(KubeConfig::load(&out).unwrap(), config);
    }

    #[test]
    fn test_merge_keeps_base_and_adds_contexts() {
        let base: KubeConfig = serde_yaml::from_str(BASE).unwrap();
        let merged = base
            .with_local_proxy_values(&values(vec![
                ClusterSelector::new("clusterA", "prod")
                    .with_impersonation("admin", vec!["devs".to_string()])
                    .with_namespace("web"),
                ClusterSelector::new("clusterA", "staging"),
            ]))
            .unwrap();

        assert_eq!(merged.clusters.len(), 3);
        assert_eq!(merged.contexts.len(), 3);
        assert!(merged.user("minikube").is_some());
        assert_eq!(merged.current_context, "clusterA-prod");

        let cluster = merged.cluster("clusterA-prod").unwrap();
        assert_eq!(cluster.server, "https://proxy.example.com:3026");
        assert_eq!(cluster.proxy_url.as_deref(), Some("http://127.0.0.1:8443"));
        assert_eq!(cluster.tls_server_name.as_deref(), Some("70726f64.clusterA"));

        let user = merged.user("clusterA-prod").unwrap();
        assert_eq!(user.impersonate.as_deref(), Some("admin"));
        assert_eq!(user.impersonate_groups, vec!["devs".to_string()]);
        assert_eq!(user.client_key.as_deref(), Some("/keys/alice"));
        assert!(merged.user("clusterA-staging").unwrap().impersonate.is_none());

        let context = merged.context("clusterA-prod").unwrap();
        assert_eq!(context.namespace.as_deref(), Some("web"));
        assert_eq!(context.extension(KUBE_CLUSTER_EXTENSION), Some("prod"));
    }

    #[test]
    fn test_merge_keeps_proxied_current_context() {
        let mut base = KubeConfig::default();
        base.current_context = "clusterA-staging".to_string();

        let merged = base
            .with_local_proxy_values(&values(vec![
                ClusterSelector::new("clusterA", "prod"),
                ClusterSelector::new("clusterA", "staging"),
            ]))
            .unwrap();
        assert_eq!(merged.current_context, "clusterA-staging");
    }

    #[test]
    fn test_merge_requires_ca_path() {
        let err = KubeConfig::default()
            .with_local_proxy_values(&values(vec![ClusterSelector::new("clusterB", "prod")]))
            .unwrap_err();
        assert!(matches!(err, KubeConfigError::MissingCa(name) if name == "clusterB"));
    }

    #[cfg(unix)]
    #[test]
    fn test_saved_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let path = temp.path().join("kube").join("localproxy-8443");
        save_local_proxy_values(
            &path,
            &KubeConfig::default(),
            &values(vec![ClusterSelector::new("clusterA", "prod")]),
        )
        .unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_clusters_from_config() {
        let merged = KubeConfig::default()
            .with_local_proxy_values(&values(vec![
                ClusterSelector::new("clusterA", "prod").with_namespace("web"),
                ClusterSelector::new("clusterA", "staging"),
            ]))
            .unwrap();

        let selectors = local_proxy_clusters_from_config(&merged, "proxy.example.com:3026");
        assert_eq!(selectors.len(), 2);
        assert_eq!(selectors[0].sub_cluster, "prod");
        assert_eq!(selectors[0].namespace, "web");

        assert!(local_proxy_clusters_from_config(&merged, "other.example.com:3026").is_empty());
    }
}
