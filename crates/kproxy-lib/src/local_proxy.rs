//! Lifecycle of the local Kubernetes proxy
//!
//! The proxy owns two listeners: the TLS routing server and the forward proxy
//! in front of it. Both start together and the first one to fail takes the
//! other down with it.

use kproxy_cert::CertError;
use kproxy_credentials::{ClusterSelector, CredentialError, CredentialSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::kubeconfig::{KubeConfig, KubeConfigError};
use crate::publisher::ConfigPublisher;
use crate::service::{ProxyService, ServiceError};

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("Certificate error: {0}")]
    Cert(#[from] CertError),

    #[error("Transport failure: {0}")]
    Transport(#[from] ServiceError),

    #[error("Failed to publish kubeconfig: {0}")]
    Persistence(#[from] KubeConfigError),

    #[error("Local proxy already started")]
    AlreadyStarted,

    #[error("Local proxy is closed")]
    Closed,

    #[error("Failed to close local proxy: {}", join_errors(.0))]
    Close(Vec<ServiceError>),
}

fn join_errors(errors: &[ServiceError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Created,
    Running,
    Stopped,
    Failed,
}

/// The routing server and forward proxy run as one unit
pub struct KubeLocalProxy {
    credentials: CredentialSet,
    routing: Arc<dyn ProxyService>,
    forward: Arc<dyn ProxyService>,
    state: Mutex<ProxyState>,
    kubeconfig: Mutex<Option<PathBuf>>,
    started: AtomicBool,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl KubeLocalProxy {
    /// Wrap two bound, not yet started services
    ///
    /// `forward` must already target `routing`.
    pub fn new(
        credentials: CredentialSet,
        routing: Arc<dyn ProxyService>,
        forward: Arc<dyn ProxyService>,
    ) -> Self {
        Self {
            credentials,
            routing,
            forward,
            state: Mutex::new(ProxyState::Created),
            kubeconfig: Mutex::new(None),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Address Kubernetes clients use as their proxy
    pub fn addr(&self) -> SocketAddr {
        self.forward.local_addr()
    }

    pub fn routing_addr(&self) -> SocketAddr {
        self.routing.local_addr()
    }

    pub fn credentials(&self) -> &CredentialSet {
        &self.credentials
    }

    pub fn state(&self) -> ProxyState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(ProxyState::Failed)
    }

    fn set_state(&self, next: ProxyState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }

    /// Path of the kubeconfig written by [`KubeLocalProxy::write_kubeconfig`]
    pub fn kubeconfig_path(&self) -> Option<PathBuf> {
        self.kubeconfig.lock().ok().and_then(|path| path.clone())
    }

    /// Publish the kubeconfig for `clusters`; it is removed again on close
    pub fn write_kubeconfig(
        &self,
        publisher: &ConfigPublisher,
        base: &KubeConfig,
        clusters: &[ClusterSelector],
    ) -> Result<PathBuf, ProxyError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProxyError::Closed);
        }
        let path = publisher.write(base, &self.credentials, clusters, self.addr())?;
        if let Ok(mut slot) = self.kubeconfig.lock() {
            *slot = Some(path.clone());
        }
        Ok(path)
    }

    /// Run both services until `cancel` fires, the proxy is closed, or one of
    /// them fails
    ///
    /// Cancellation and close are a clean stop and return `Ok`. A service
    /// failure is returned after the other service has been stopped.
    pub async fn start(&self, cancel: CancellationToken) -> Result<(), ProxyError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProxyError::Closed);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ProxyError::AlreadyStarted);
        }
        self.set_state(ProxyState::Running);

        let run = self.shutdown.child_token();
        let (errors_tx, mut errors_rx) = mpsc::channel::<ServiceError>(2);

        let mut handles = Vec::with_capacity(2);
        for service in [self.routing.clone(), self.forward.clone()] {
            let token = run.clone();
            let errors_tx = errors_tx.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = service.start(token).await {
                    error!("{} stopped with error: {}", service.name(), e);
                    let _ = errors_tx.send(e).await;
                } else {
                    debug!("{} stopped", service.name());
                }
            }));
        }
        drop(errors_tx);

        info!(
            "Local proxy running on {} (routing on {})",
            self.addr(),
            self.routing_addr()
        );

        let result = tokio::select! {
            Some(e) = errors_rx.recv() => Err(e),
            _ = cancel.cancelled() => Ok(()),
            _ = self.shutdown.cancelled() => Ok(()),
        };

        run.cancel();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Local proxy service task ended abnormally: {}", e);
            }
        }

        match result {
            Ok(()) => {
                self.set_state(ProxyState::Stopped);
                info!("Local proxy stopped");
                Ok(())
            }
            Err(e) => {
                self.set_state(ProxyState::Failed);
                Err(ProxyError::Transport(e))
            }
        }
    }

    /// Stop both services and remove the published kubeconfig
    ///
    /// Idempotent. Close errors of both services are reported together; a
    /// kubeconfig that is already gone is not an error.
    pub fn close(&self) -> Result<(), ProxyError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();

        let errors: Vec<ServiceError> = [&self.routing, &self.forward]
            .into_iter()
            .filter_map(|service| service.close().err())
            .collect();

        let kubeconfig = self.kubeconfig.lock().ok().and_then(|mut path| path.take());
        if let Some(path) = kubeconfig {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("Removed kubeconfig {:?}", path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove kubeconfig {:?}: {}", path, e),
            }
        }

        if self.state() == ProxyState::Created {
            self.set_state(ProxyState::Stopped);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProxyError::Close(errors))
        }
    }
}

impl Drop for KubeLocalProxy {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_error_lists_every_service() {
        let err = ProxyError::Close(vec![
            ServiceError::failed("a", "boom"),
            ServiceError::failed("b", "bang"),
        ]);
        let message = err.to_string();
        assert!(message.contains("a failed: boom"));
        assert!(message.contains("b failed: bang"));
    }
}
