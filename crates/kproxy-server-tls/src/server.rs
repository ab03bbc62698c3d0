//! TLS routing server
//!
//! Accepts TLS connections from local Kubernetes clients, terminates them with
//! the local CA's wildcard certificate and dials the kube cluster address with
//! the client certificate selected by the negotiated server name. The server
//! binds when it is created so its address is known before it starts.
use kproxy_cert::{CertError, LocalCa};
use kproxy_credentials::{ClusterKey, CredentialSet};
use rustls::pki_types::{CertificateDer, ServerName};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::accept::{is_transient_accept_error, AcceptBackoff};
use crate::resolver::LocalCaCertResolver;
use crate::sni::parse_local_proxy_sni;

#[derive(Debug, Error)]
pub enum RoutingServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Certificate error: {0}")]
    CertificateError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),

    #[error("No credential for {0}")]
    NoRoute(String),

    #[error("Routing server already started")]
    AlreadyStarted,

    #[error("Routing server is closed")]
    Closed,

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

impl From<CertError> for RoutingServerError {
    fn from(e: CertError) -> Self {
        RoutingServerError::CertificateError(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct RoutingServerConfig {
    /// Local listen address; port 0 picks a free port
    pub bind_addr: SocketAddr,
    /// Kube cluster address (`host:port`) every connection is forwarded to
    pub upstream_addr: String,
    /// Server name verified on the upstream certificate
    pub upstream_server_name: String,
    /// Upstream trust anchors; the webpki roots are used when empty
    pub upstream_roots: Vec<CertificateDer<'static>>,
}

impl RoutingServerConfig {
    pub fn new(bind_addr: SocketAddr, upstream_addr: impl Into<String>) -> Self {
        let upstream_addr = upstream_addr.into();
        let upstream_server_name = upstream_addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&upstream_addr)
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        Self {
            bind_addr,
            upstream_addr,
            upstream_server_name,
            upstream_roots: Vec::new(),
        }
    }

    pub fn with_upstream_roots(mut self, roots: Vec<CertificateDer<'static>>) -> Self {
        self.upstream_roots = roots;
        self
    }

    pub fn with_upstream_server_name(mut self, name: impl Into<String>) -> Self {
        self.upstream_server_name = name.into();
        self
    }
}

/// Everything a connection task needs to route one client
struct Routes {
    acceptor: TlsAcceptor,
    connectors: HashMap<ClusterKey, TlsConnector>,
    upstream_addr: String,
    upstream_server_name: ServerName<'static>,
}

impl Routes {
    fn connector(&self, key: &ClusterKey) -> Option<&TlsConnector> {
        let normalized = ClusterKey::new(
            key.remote_cluster.to_ascii_lowercase(),
            key.sub_cluster.as_str(),
        );
        self.connectors.get(&normalized)
    }
}

pub struct RoutingServer {
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    routes: Arc<Routes>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl RoutingServer {
    /// Build the TLS material and bind the listener
    ///
    /// `cas` holds the local CA of every remote cluster in `credentials`.
    pub async fn bind(
        config: RoutingServerConfig,
        cas: HashMap<String, LocalCa>,
        credentials: CredentialSet,
    ) -> Result<Self, RoutingServerError> {
        ensure_crypto_provider();

        let resolver = LocalCaCertResolver::new(&cas)?;
        for key in credentials.keys() {
            if !resolver.serves(&key.remote_cluster) {
                return Err(RoutingServerError::CertificateError(format!(
                    "No local CA for remote cluster {}",
                    key.remote_cluster
                )));
            }
        }

        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(resolver));
        let acceptor = TlsAcceptor::from(Arc::new(server_config));

        let roots = Arc::new(root_store(&config.upstream_roots)?);
        let mut connectors = HashMap::with_capacity(credentials.len());
        for (key, record) in credentials {
            let client_config = rustls::ClientConfig::builder()
                .with_root_certificates(roots.clone())
                .with_client_auth_cert(
                    record.certificate.cert_chain,
                    record.certificate.private_key,
                )
                .map_err(|e| {
                    RoutingServerError::TlsError(format!("Invalid client cert for {}: {}", key, e))
                })?;
            let normalized =
                ClusterKey::new(key.remote_cluster.to_ascii_lowercase(), key.sub_cluster);
            connectors.insert(normalized, TlsConnector::from(Arc::new(client_config)));
        }

        let upstream_server_name = ServerName::try_from(config.upstream_server_name.as_str())
            .map(|name| name.to_owned())
            .map_err(|e| {
                RoutingServerError::InvalidServerName(format!(
                    "{}: {}",
                    config.upstream_server_name, e
                ))
            })?;

        let listener = TcpListener::bind(config.bind_addr).await.map_err(|e| {
            RoutingServerError::BindError {
                address: config.bind_addr.ip().to_string(),
                port: config.bind_addr.port(),
                reason: e.to_string(),
            }
        })?;
        let local_addr = listener.local_addr()?;

        info!(
            "TLS routing server bound on {} ({} kube cluster(s) via {})",
            local_addr,
            connectors.len(),
            config.upstream_addr
        );

        Ok(Self {
            local_addr,
            listener: Mutex::new(Some(listener)),
            routes: Arc::new(Routes {
                acceptor,
                connectors,
                upstream_addr: config.upstream_addr,
                upstream_server_name,
            }),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the accept loop until `cancel` fires or the server is closed
    ///
    /// In-flight connections are dropped when the loop ends. A listener error
    /// that retrying cannot clear ends the loop with
    /// [`RoutingServerError::IoError`].
    pub async fn start(&self, cancel: CancellationToken) -> Result<(), RoutingServerError> {
        let listener = {
            let mut slot = self
                .listener
                .lock()
                .map_err(|_| RoutingServerError::Closed)?;
            match slot.take() {
                Some(listener) => listener,
                None if self.closed.load(Ordering::SeqCst) => {
                    return Err(RoutingServerError::Closed)
                }
                None => return Err(RoutingServerError::AlreadyStarted),
            }
        };

        info!("✅ TLS routing server listening on {}", self.local_addr);

        let mut backoff = AcceptBackoff::default();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("TLS routing server on {} cancelled", self.local_addr);
                    break;
                }
                _ = self.shutdown.cancelled() => {
                    debug!("TLS routing server on {} closed", self.local_addr);
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer_addr)) => {
                        backoff.reset();
                        debug!("New TLS connection from {}", peer_addr);

                        let routes = self.routes.clone();
                        let shutdown = self.shutdown.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = shutdown.cancelled() => {
                                    debug!("Dropping TLS connection from {} on shutdown", peer_addr);
                                }
                                result = Self::route_connection(socket, peer_addr, &routes) => {
                                    if let Err(e) = result {
                                        debug!("Error routing TLS connection from {}: {}", peer_addr, e);
                                    }
                                }
                            }
                        });
                    }
                    Err(e) if is_transient_accept_error(&e) => {
                        let delay = backoff.next_delay();
                        warn!("TLS listener accept error: {}; retrying in {:?}", e, delay);
                        let stopped = tokio::select! {
                            _ = tokio::time::sleep(delay) => false,
                            _ = cancel.cancelled() => true,
                            _ = self.shutdown.cancelled() => true,
                        };
                        if stopped {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("TLS routing server on {} stopped accepting: {}", self.local_addr, e);
                        self.shutdown.cancel();
                        return Err(RoutingServerError::IoError(e));
                    }
                }
            }
        }

        self.shutdown.cancel();
        Ok(())
    }

    /// Stop accepting and drop in-flight connections
    ///
    /// Safe to call more than once and before `start`.
    pub fn close(&self) -> Result<(), RoutingServerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();
        if let Ok(mut slot) = self.listener.lock() {
            slot.take();
        }
        info!("TLS routing server on {} closed", self.local_addr);
        Ok(())
    }

    async fn route_connection(
        socket: TcpStream,
        peer_addr: SocketAddr,
        routes: &Routes,
    ) -> Result<(), RoutingServerError> {
        let mut client = routes
            .acceptor
            .accept(socket)
            .await
            .map_err(|e| RoutingServerError::TlsError(e.to_string()))?;

        let server_name = client
            .get_ref()
            .1
            .server_name()
            .map(str::to_string)
            .ok_or_else(|| RoutingServerError::InvalidServerName("(none)".to_string()))?;
        let key = parse_local_proxy_sni(&server_name).map_err(|e| {
            RoutingServerError::InvalidServerName(format!("{}: {}", server_name, e))
        })?;

        let connector = routes.connector(&key).ok_or_else(|| {
            warn!("🚫 No credential for {} (from {})", key, peer_addr);
            RoutingServerError::NoRoute(key.to_string())
        })?;

        info!("🔀 Routing {} to {} for {}", peer_addr, routes.upstream_addr, key);

        let upstream = TcpStream::connect(&routes.upstream_addr).await?;
        let mut upstream = connector
            .connect(routes.upstream_server_name.clone(), upstream)
            .await
            .map_err(|e| {
                RoutingServerError::TlsError(format!(
                    "Upstream handshake with {} failed: {}",
                    routes.upstream_addr, e
                ))
            })?;

        let (sent, received) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;

        debug!(
            "TLS connection from {} for {} closed (↓{}B ↑{}B)",
            peer_addr, key, received, sent
        );
        Ok(())
    }
}

impl Drop for RoutingServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn root_store(
    upstream_roots: &[CertificateDer<'static>],
) -> Result<rustls::RootCertStore, RoutingServerError> {
    let mut roots = rustls::RootCertStore::empty();

    if upstream_roots.is_empty() {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    } else {
        for cert in upstream_roots {
            roots.add(cert.clone()).map_err(|e| {
                RoutingServerError::CertificateError(format!("Invalid upstream root: {}", e))
            })?;
        }
    }
    Ok(roots)
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_derives_server_name() {
        let config = RoutingServerConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            "kube.example.com:3026",
        );
        assert_eq!(config.upstream_server_name, "kube.example.com");
        assert!(config.upstream_roots.is_empty());

        let config = RoutingServerConfig::new("127.0.0.1:0".parse().unwrap(), "[::1]:3026");
        assert_eq!(config.upstream_server_name, "::1");
    }

    #[tokio::test]
    async fn test_close_before_start() {
        let server = RoutingServer::bind(
            RoutingServerConfig::new("127.0.0.1:0".parse().unwrap(), "localhost:3026"),
            HashMap::new(),
            CredentialSet::new(),
        )
        .await
        .unwrap();

        server.close().unwrap();
        server.close().unwrap();
        assert!(matches!(
            server.start(CancellationToken::new()).await,
            Err(RoutingServerError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_bind_conflict_reports_address() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let err = RoutingServer::bind(
            RoutingServerConfig::new(addr, "localhost:3026"),
            HashMap::new(),
            CredentialSet::new(),
        )
        .await
        .err()
        .unwrap();

        match err {
            RoutingServerError::BindError { port, .. } => assert_eq!(port, addr.port()),
            other => panic!("unexpected error: {}", other),
        }
    }
}
