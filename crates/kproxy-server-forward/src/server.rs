//! Forward proxy server
//!
//! Listens on a local port and answers every `CONNECT` by opening a TCP
//! connection to the routing server, then splices the two streams. Other
//! methods are refused with `405`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::accept::{is_transient_accept_error, AcceptBackoff};
use crate::connect::{response_head, ConnectRequest};

#[derive(Debug, Error)]
pub enum ForwardProxyError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Failed to reach {target}: {reason}")]
    TargetUnreachable { target: SocketAddr, reason: String },

    #[error("Forward proxy already started")]
    AlreadyStarted,

    #[error("Forward proxy is closed")]
    Closed,

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct ForwardProxyConfig {
    pub bind_addr: SocketAddr,
    /// Where every tunnel is opened to
    pub target_addr: SocketAddr,
}

pub struct ForwardProxyServer {
    config: ForwardProxyConfig,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl ForwardProxyServer {
    /// Bind the listener, retrying while the port is still in `TIME_WAIT`
    pub async fn bind(config: ForwardProxyConfig) -> Result<Self, ForwardProxyError> {
        let listener = bind_with_retry(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            "Forward proxy bound on {} (tunnels to {})",
            local_addr, config.target_addr
        );

        Ok(Self {
            config,
            local_addr,
            listener: Mutex::new(Some(listener)),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn target_addr(&self) -> SocketAddr {
        self.config.target_addr
    }

    /// Run the accept loop until `cancel` fires or the server is closed
    ///
    /// A listener error that retrying cannot clear ends the loop with
    /// [`ForwardProxyError::IoError`].
    pub async fn start(&self, cancel: CancellationToken) -> Result<(), ForwardProxyError> {
        let listener = {
            let mut slot = self
                .listener
                .lock()
                .map_err(|_| ForwardProxyError::Closed)?;
            match slot.take() {
                Some(listener) => listener,
                None if self.closed.load(Ordering::SeqCst) => {
                    return Err(ForwardProxyError::Closed)
                }
                None => return Err(ForwardProxyError::AlreadyStarted),
            }
        };

        info!("✅ Forward proxy listening on {}", self.local_addr);

        let mut backoff = AcceptBackoff::default();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Forward proxy on {} cancelled", self.local_addr);
                    break;
                }
                _ = self.shutdown.cancelled() => {
                    debug!("Forward proxy on {} closed", self.local_addr);
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        backoff.reset();
                        debug!("New proxy connection from {}", peer_addr);

                        let target_addr = self.config.target_addr;
                        let shutdown = self.shutdown.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = shutdown.cancelled() => {
                                    debug!("Dropping proxy connection from {} on shutdown", peer_addr);
                                }
                                result = Self::handle_connection(stream, peer_addr, target_addr) => {
                                    if let Err(e) = result {
                                        debug!("Error handling proxy connection from {}: {}", peer_addr, e);
                                    }
                                }
                            }
                        });
                    }
                    Err(e) if is_transient_accept_error(&e) => {
                        let delay = backoff.next_delay();
                        warn!(
                            "Failed to accept proxy connection: {}; retrying in {:?}",
                            e, delay
                        );
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
                        error!("Forward proxy on {} stopped accepting: {}", self.local_addr, e);
                        self.shutdown.cancel();
                        return Err(ForwardProxyError::IoError(e));
                    }
                }
            }
        }

        self.shutdown.cancel();
        Ok(())
    }

    /// Stop accepting and drop in-flight tunnels
    ///
    /// Safe to call more than once and before `start`.
    pub fn close(&self) -> Result<(), ForwardProxyError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();
        if let Ok(mut slot) = self.listener.lock() {
            slot.take();
        }
        info!("Forward proxy on {} closed", self.local_addr);
        Ok(())
    }

    async fn handle_connection(
        mut client: TcpStream,
        peer_addr: SocketAddr,
        target_addr: SocketAddr,
    ) -> Result<(), ForwardProxyError> {
        let mut buf = Vec::new();
        let request = match ConnectRequest::read(&mut client, &mut buf).await {
            Ok(request) => request,
            Err(e @ ForwardProxyError::InvalidRequest(_)) => {
                let head = response_head(400, "Bad Request", &[("Connection", "close")]);
                let _ = client.write_all(head.as_bytes()).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if !request.is_connect() {
            warn!(
                "Refusing {} {} from {}: only CONNECT is supported",
                request.method, request.target, peer_addr
            );
            let head = response_head(
                405,
                "Method Not Allowed",
                &[("Allow", "CONNECT"), ("Content-Length", "0"), ("Connection", "close")],
            );
            client.write_all(head.as_bytes()).await?;
            return Err(ForwardProxyError::MethodNotAllowed(request.method));
        }

        let mut upstream = match TcpStream::connect(target_addr).await {
            Ok(stream) => stream,
            Err(e) => {
                let head = response_head(502, "Bad Gateway", &[("Connection", "close")]);
                let _ = client.write_all(head.as_bytes()).await;
                return Err(ForwardProxyError::TargetUnreachable {
                    target: target_addr,
                    reason: e.to_string(),
                });
            }
        };

        client
            .write_all(response_head(200, "Connection established", &[]).as_bytes())
            .await?;

        // Clients may pipeline the first bytes of the tunnel behind the head
        if buf.len() > request.head_len {
            upstream.write_all(&buf[request.head_len..]).await?;
        }

        debug!(
            "Tunnel {} -> {} open for {}",
            peer_addr, target_addr, request.target
        );

        let (sent, received) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;

        debug!(
            "Tunnel from {} for {} closed (↓{}B ↑{}B)",
            peer_addr, request.target, received, sent
        );
        Ok(())
    }
}

impl Drop for ForwardProxyServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn bind_with_retry(bind_addr: SocketAddr) -> Result<TcpListener, ForwardProxyError> {
    // Up to 3 attempts, 1 second apart, to ride out TIME_WAIT
    for attempt in 1..=3 {
        match TcpListener::bind(bind_addr).await {
            Ok(listener) => {
                if attempt > 1 {
                    info!("Successfully bound to {} on attempt {}/3", bind_addr, attempt);
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < 3 => {
                warn!(
                    "Port {} is in use (attempt {}/3, may be in TIME_WAIT state), retrying in 1 second...",
                    bind_addr.port(),
                    attempt
                );
                tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
            }
            Err(e) => {
                return Err(ForwardProxyError::BindError {
                    address: bind_addr.ip().to_string(),
                    port: bind_addr.port(),
                    reason: e.to_string(),
                });
            }
        }
    }

    Err(ForwardProxyError::BindError {
        address: bind_addr.ip().to_string(),
        port: bind_addr.port(),
        reason: "Address in use after 3 retry attempts".to_string(),
    })
}
