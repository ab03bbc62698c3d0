//! Building a [`KubeLocalProxy`] from resolved credentials

use chrono::{Duration, Utc};
use kproxy_cert::{load_self_signed_ca, parse_certificates, CertError, LocalCa, CA_TTL_DAYS};
use kproxy_credentials::{
    remote_clusters, ClusterSelector, CredentialResolver, CredentialSet, KeyDir,
};
use kproxy_server_forward::{ForwardProxyConfig, ForwardProxyServer};
use kproxy_server_tls::{local_proxy_wildcard_domain, RoutingServer, RoutingServerConfig};
use rustls::pki_types::CertificateDer;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::local_proxy::{KubeLocalProxy, ProxyError};
use crate::service::{ProxyService, ServiceError};

#[derive(Debug, Clone)]
pub struct LocalProxyConfig {
    /// Forward proxy listen address; port 0 picks a free port
    pub listen_addr: SocketAddr,
    /// Kube cluster address of the remote authority, `host:port`
    pub kube_cluster_addr: String,
    pub key_dir: KeyDir,
}

impl LocalProxyConfig {
    pub fn new(port: u16, kube_cluster_addr: impl Into<String>, key_dir: KeyDir) -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            kube_cluster_addr: kube_cluster_addr.into(),
            key_dir,
        }
    }
}

/// Load or mint the local CA of every remote cluster
pub fn load_kube_local_cas(
    key_dir: &KeyDir,
    remote_clusters: &[String],
) -> Result<HashMap<String, LocalCa>, CertError> {
    let valid_until = Utc::now() + Duration::days(CA_TTL_DAYS);
    let mut cas = HashMap::with_capacity(remote_clusters.len());

    for remote_cluster in remote_clusters {
        let ca = load_self_signed_ca(
            &key_dir.local_ca_path(remote_cluster),
            &key_dir.key_path(),
            valid_until,
            &local_proxy_wildcard_domain(remote_cluster),
        )?;
        cas.insert(remote_cluster.clone(), ca);
    }
    Ok(cas)
}

/// Trust anchors for the kube cluster address, from the saved remote CAs
///
/// Empty when none are saved, in which case public roots apply.
pub fn load_upstream_roots(
    key_dir: &KeyDir,
    remote_clusters: &[String],
) -> Result<Vec<CertificateDer<'static>>, CertError> {
    let mut roots = Vec::new();
    for remote_cluster in remote_clusters {
        let path = key_dir.cas_path(remote_cluster);
        match std::fs::read(&path) {
            Ok(pem) => roots.extend(parse_certificates(&pem)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No saved CA for {} at {:?}", remote_cluster, path);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(roots)
}

/// Bind both listeners for an already resolved credential set
pub async fn build_kube_local_proxy(
    config: LocalProxyConfig,
    credentials: CredentialSet,
) -> Result<KubeLocalProxy, ProxyError> {
    let mut remotes: Vec<String> = credentials
        .keys()
        .map(|key| key.remote_cluster.clone())
        .collect();
    remotes.dedup();

    let cas = load_kube_local_cas(&config.key_dir, &remotes)?;
    let roots = load_upstream_roots(&config.key_dir, &remotes)?;

    let routing_config = RoutingServerConfig::new(
        SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
        config.kube_cluster_addr.clone(),
    )
    .with_upstream_roots(roots);
    let routing = RoutingServer::bind(routing_config, cas, credentials.clone())
        .await
        .map_err(ServiceError::from)?;

    let forward = match ForwardProxyServer::bind(ForwardProxyConfig {
        bind_addr: config.listen_addr,
        target_addr: routing.local_addr(),
    })
    .await
    {
        Ok(forward) => forward,
        Err(e) => {
            release_after_bind_failure(&routing);
            return Err(ServiceError::from(e).into());
        }
    };

    info!(
        "Local proxy for {} kube cluster(s) bound on {}",
        credentials.len(),
        forward.local_addr()
    );

    Ok(KubeLocalProxy::new(
        credentials,
        Arc::new(routing),
        Arc::new(forward),
    ))
}

/// Resolve credentials for `selectors`, then bind the local proxy
///
/// No listener is opened unless every selector resolved.
pub async fn make_kube_local_proxy(
    config: LocalProxyConfig,
    resolver: &CredentialResolver,
    selectors: &[ClusterSelector],
) -> Result<KubeLocalProxy, ProxyError> {
    debug!(
        "Resolving credentials for remote cluster(s) {:?}",
        remote_clusters(selectors)
    );
    let credentials = resolver.resolve(selectors).await?;
    build_kube_local_proxy(config, credentials).await
}

/// Close a service whose partner failed to bind, logging any close error
fn release_after_bind_failure(service: &dyn ProxyService) {
    if let Err(e) = service.close() {
        warn!(
            "Failed to close {} after bind failure: {}",
            service.name(),
            e
        );
    }
}
