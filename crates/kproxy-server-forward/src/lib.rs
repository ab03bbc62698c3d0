//! Plain HTTP forward proxy in front of the TLS routing server
//!
//! Kubernetes clients configured with a `proxy-url` send `CONNECT` requests
//! here; every tunnel is opened to the same routing server address.
mod accept;
pub mod connect;
pub mod server;

pub use connect::{ConnectRequest, MAX_REQUEST_HEAD};
pub use server::{ForwardProxyConfig, ForwardProxyError, ForwardProxyServer};
