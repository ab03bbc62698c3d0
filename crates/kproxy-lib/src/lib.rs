//! Local Kubernetes proxy - public API
//!
//! Ties credential resolution, the TLS routing server and the forward proxy
//! together and publishes a kubeconfig pointing at the result.
//!
//! # Quick Start
//!
//! ```ignore
//! use kproxy_lib::{
//!     make_kube_local_proxy, ConfigPublisher, KubeConfig, LocalProxyConfig, PublisherConfig,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(
//! #     resolver: kproxy_lib::CredentialResolver,
//! #     key_dir: kproxy_lib::KeyDir,
//! #     selectors: Vec<kproxy_lib::ClusterSelector>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let config = LocalProxyConfig::new(0, "proxy.example.com:3026", key_dir.clone());
//! let proxy = make_kube_local_proxy(config, &resolver, &selectors).await?;
//!
//! let publisher = ConfigPublisher::new(PublisherConfig {
//!     path_override: None,
//!     key_dir,
//!     kube_cluster_addr: "proxy.example.com:3026".to_string(),
//! });
//! let path = proxy.write_kubeconfig(&publisher, &KubeConfig::load_default()?, &selectors)?;
//! println!("export KUBECONFIG={}", path.display());
//!
//! let cancel = CancellationToken::new();
//! proxy.start(cancel).await?;
//! proxy.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Components
//!
//! - **KubeLocalProxy**: starts both listeners together and tears them down as one
//! - **ConfigPublisher**: derives and writes the kubeconfig for the running proxy
//! - **KubeConfig**: kubeconfig model and local proxy merge
//! - **ProxyService**: lifecycle surface shared by both listeners

pub mod builder;
pub mod kubeconfig;
pub mod local_proxy;
pub mod publisher;
pub mod service;

pub use builder::{
    build_kube_local_proxy, load_kube_local_cas, load_upstream_roots, make_kube_local_proxy,
    LocalProxyConfig,
};
pub use kubeconfig::{
    default_kubeconfig_path, local_proxy_clusters_from_config, local_proxy_context_name,
    save_local_proxy_values, KubeConfig, KubeConfigError, KUBE_CLUSTER_EXTENSION,
    REMOTE_CLUSTER_EXTENSION,
};
pub use local_proxy::{KubeLocalProxy, ProxyError, ProxyState};
pub use publisher::{ConfigPublisher, PublishedConfig, PublisherConfig};
pub use service::{ProxyService, ServiceError, FORWARD_SERVICE, ROUTING_SERVICE};

// Re-export credential types
pub use kproxy_credentials::{
    ClusterKey, ClusterSelector, CredentialResolver, CredentialSet, KeyDir,
};
