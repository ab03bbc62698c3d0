//! Common lifecycle surface of the two local proxy listeners

use async_trait::async_trait;
use kproxy_server_forward::{ForwardProxyError, ForwardProxyServer};
use kproxy_server_tls::{RoutingServer, RoutingServerError};
use std::net::SocketAddr;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Terminal error of one service
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("{service} failed to bind {address}: {reason}")]
    Bind {
        service: String,
        address: String,
        reason: String,
    },

    #[error("{service} failed: {message}")]
    Failed { service: String, message: String },
}

impl ServiceError {
    pub fn failed(service: &str, message: impl ToString) -> Self {
        ServiceError::Failed {
            service: service.to_string(),
            message: message.to_string(),
        }
    }

    pub fn service(&self) -> &str {
        match self {
            ServiceError::Bind { service, .. } | ServiceError::Failed { service, .. } => service,
        }
    }
}

/// A listener owned by the local proxy
///
/// # Example
///
/// ```ignore
/// struct Noop(SocketAddr);
///
/// #[async_trait]
/// impl ProxyService for Noop {
///     fn name(&self) -> &str {
///         "noop"
///     }
///
///     fn local_addr(&self) -> SocketAddr {
///         self.0
///     }
///
///     async fn start(&self, cancel: CancellationToken) -> Result<(), ServiceError> {
///         cancel.cancelled().await;
///         Ok(())
///     }
///
///     fn close(&self) -> Result<(), ServiceError> {
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait ProxyService: Send + Sync {
    fn name(&self) -> &str;

    fn local_addr(&self) -> SocketAddr;

    /// Serve until `cancel` fires or the service is closed
    async fn start(&self, cancel: CancellationToken) -> Result<(), ServiceError>;

    /// Stop serving; idempotent
    fn close(&self) -> Result<(), ServiceError>;
}

pub const ROUTING_SERVICE: &str = "TLS routing server";
pub const FORWARD_SERVICE: &str = "forward proxy";

impl From<RoutingServerError> for ServiceError {
    fn from(e: RoutingServerError) -> Self {
        match e {
            RoutingServerError::BindError {
                address,
                port,
                reason,
            } => ServiceError::Bind {
                service: ROUTING_SERVICE.to_string(),
                address: format!("{}:{}", address, port),
                reason,
            },
            other => ServiceError::failed(ROUTING_SERVICE, other),
        }
    }
}

impl From<ForwardProxyError> for ServiceError {
    fn from(e: ForwardProxyError) -> Self {
        match e {
            ForwardProxyError::BindError {
                address,
                port,
                reason,
            } => ServiceError::Bind {
                service: FORWARD_SERVICE.to_string(),
                address: format!("{}:{}", address, port),
                reason,
            },
            other => ServiceError::failed(FORWARD_SERVICE, other),
        }
    }
}

#[async_trait]
impl ProxyService for RoutingServer {
    fn name(&self) -> &str {
        ROUTING_SERVICE
    }

    fn local_addr(&self) -> SocketAddr {
        RoutingServer::local_addr(self)
    }

    async fn start(&self, cancel: CancellationToken) -> Result<(), ServiceError> {
        RoutingServer::start(self, cancel).await.map_err(Into::into)
    }

    fn close(&self) -> Result<(), ServiceError> {
        RoutingServer::close(self).map_err(Into::into)
    }
}

#[async_trait]
impl ProxyService for ForwardProxyServer {
    fn name(&self) -> &str {
        FORWARD_SERVICE
    }

    fn local_addr(&self) -> SocketAddr {
        ForwardProxyServer::local_addr(self)
    }

    async fn start(&self, cancel: CancellationToken) -> Result<(), ServiceError> {
        ForwardProxyServer::start(self, cancel).await.map_err(Into::into)
    }

    fn close(&self) -> Result<(), ServiceError> {
        ForwardProxyServer::close(self).map_err(Into::into)
    }
}
