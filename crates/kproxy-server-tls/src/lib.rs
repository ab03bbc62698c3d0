//! TLS routing server for the local Kubernetes proxy
//!
//! Terminates TLS from local Kubernetes clients using per-remote-cluster
//! wildcard certificates signed by the local CA, maps the negotiated server
//! name back to a (remote cluster, kube cluster) pair and re-encrypts the
//! stream upstream with that pair's client certificate.
mod accept;
pub mod resolver;
pub mod server;
pub mod sni;

pub use resolver::LocalCaCertResolver;
pub use server::{RoutingServer, RoutingServerConfig, RoutingServerError};
pub use sni::{local_proxy_sni, local_proxy_wildcard_domain, parse_local_proxy_sni, SniError};
