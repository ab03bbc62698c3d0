//! End-to-end routing through the TLS routing server

use chrono::{Duration, Utc};
use kproxy_cert::{Certificate, KeyPair, LocalCa};
use kproxy_credentials::{ClusterKey, CredentialRecord, CredentialSet};
use kproxy_server_tls::{local_proxy_sni, RoutingServer, RoutingServerConfig, RoutingServerError};
use rustls::pki_types::ServerName;
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;

const REMOTE: &str = "root.example.com";
const UPSTREAM_NAME: &str = "kube.example.com";

fn install_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn new_ca(domain: &str) -> LocalCa {
    LocalCa::generate(
        KeyPair::generate().unwrap(),
        domain,
        Utc::now() + Duration::days(1),
    )
    .unwrap()
}

/// Kube API stand-in that requires a client certificate and answers
/// `<client common name>:<request>`
async fn spawn_upstream(server_cert: Certificate, client_ca: &LocalCa) -> SocketAddr {
    let mut roots = RootCertStore::empty();
    roots.add(client_ca.cert_der().clone()).unwrap();
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .unwrap();
    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(server_cert.cert_chain, server_cert.private_key)
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(socket).await else {
                    return;
                };
                let common_name = tls
                    .get_ref()
                    .1
                    .peer_certificates()
                    .and_then(|certs| certs.first())
                    .and_then(|cert| kproxy_cert::inspect(cert).ok())
                    .and_then(|info| info.common_name)
                    .unwrap_or_default();

                let mut buf = [0u8; 64];
                let n = tls.read(&mut buf).await.unwrap_or(0);
                let reply = format!("{}:{}", common_name, String::from_utf8_lossy(&buf[..n]));
                let _ = tls.write_all(reply.as_bytes()).await;
                let _ = tls.shutdown().await;
            });
        }
    });

    addr
}

struct Fixture {
    server: Arc<RoutingServer>,
    local_ca_der: rustls::pki_types::CertificateDer<'static>,
}

async fn fixture() -> Fixture {
    install_provider();

    let upstream_ca = new_ca("upstream-ca");
    let authority_ca = new_ca("authority");
    let upstream_addr = spawn_upstream(
        upstream_ca
            .issue_server_cert(&[UPSTREAM_NAME.to_string()])
            .unwrap(),
        &authority_ca,
    )
    .await;

    let client_key_pem = kproxy_cert::generate_private_key_pem().unwrap();
    let client_key = KeyPair::from_pem(&client_key_pem).unwrap();
    let cert_pem = authority_ca
        .sign_client_cert(
            &client_key,
            "alice",
            &["prod".to_string()],
            Utc::now() + Duration::hours(1),
        )
        .unwrap();

    let mut credentials = CredentialSet::new();
    credentials.insert(
        ClusterKey::new(REMOTE, "prod"),
        CredentialRecord::from_pem(&cert_pem, &client_key_pem).unwrap(),
    );

    let local_ca = new_ca(&format!("*.{}", REMOTE));
    let local_ca_der = local_ca.cert_der().clone();
    let mut cas = HashMap::new();
    cas.insert(REMOTE.to_string(), local_ca);

    let config = RoutingServerConfig::new("127.0.0.1:0".parse().unwrap(), upstream_addr.to_string())
        .with_upstream_server_name(UPSTREAM_NAME)
        .with_upstream_roots(vec![upstream_ca.cert_der().clone()]);
    let server = RoutingServer::bind(config, cas, credentials).await.unwrap();

    Fixture {
        server: Arc::new(server),
        local_ca_der,
    }
}

fn local_client(fixture: &Fixture) -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.add(fixture.local_ca_der.clone()).unwrap();
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

#[tokio::test]
async fn test_routes_by_server_name_with_client_cert() {
    let fixture = fixture().await;
    let cancel = CancellationToken::new();
    let server = fixture.server.clone();
    let token = cancel.clone();
    let handle = tokio::spawn(async move { server.start(token).await });

    let tcp = TcpStream::connect(fixture.server.local_addr()).await.unwrap();
    let sni = ServerName::try_from(local_proxy_sni(REMOTE, "prod")).unwrap();
    let mut client = local_client(&fixture).connect(sni, tcp).await.unwrap();

    client.write_all(b"ping").await.unwrap();
    client.shutdown().await.unwrap();

    let mut reply = Vec::new();
    tokio::time::timeout(std::time::Duration::from_secs(5), client.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(String::from_utf8(reply).unwrap(), "alice:ping");

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unknown_kube_cluster_is_dropped() {
    let fixture = fixture().await;
    let server = fixture.server.clone();
    let handle = tokio::spawn(async move { server.start(CancellationToken::new()).await });

    let tcp = TcpStream::connect(fixture.server.local_addr()).await.unwrap();
    let sni = ServerName::try_from(local_proxy_sni(REMOTE, "staging")).unwrap();

    if let Ok(mut client) = local_client(&fixture).connect(sni, tcp).await {
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(std::time::Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    fixture.server.close().unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_close_stops_running_server() {
    let fixture = fixture().await;
    let addr = fixture.server.local_addr();
    let server = fixture.server.clone();
    let handle = tokio::spawn(async move { server.start(CancellationToken::new()).await });
    tokio::task::yield_now().await;

    fixture.server.close().unwrap();
    fixture.server.close().unwrap();

    let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Ok(()) | Err(RoutingServerError::Closed)));

    // The listener is gone once the accept loop returns
    assert!(TcpListener::bind(addr).await.is_ok());
}
