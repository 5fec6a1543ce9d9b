//! Hub addressing: where a hub lives and how both sides derive the
//! connect URL and the remote-callable surface name from it.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};

use serde::{Deserialize, Serialize};

/// Errors from hub address parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("endpoint {0:?} has no host:port part")]
    MissingHost(String),

    #[error("endpoint {0:?} does not resolve to a socket address")]
    Unresolvable(String),
}

/// Location of a hub, read once at construction and immutable thereafter.
///
/// `endpoint` is the base socket address (e.g. `ws://192.168.1.20:9170`),
/// `hub_path` the mount name of the remote-callable surface (e.g.
/// `/hubs/registry`). The surface name is the final path segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubAddress {
    pub endpoint: String,
    pub hub_path: String,
    #[serde(default)]
    pub use_system_proxy: bool,
}

impl HubAddress {
    pub fn new(
        endpoint: impl Into<String>,
        hub_path: impl Into<String>,
        use_system_proxy: bool,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            hub_path: hub_path.into(),
            use_system_proxy,
        }
    }

    /// URL a client connects to: endpoint and hub path joined with
    /// exactly one separating slash.
    pub fn connect_url(&self) -> String {
        format!(
            "{}/{}",
            self.endpoint.trim_end_matches('/'),
            self.hub_path.trim_start_matches('/')
        )
    }

    /// Request path the hub expects on upgrade.
    pub fn mount_path(&self) -> String {
        format!("/{}", self.hub_path.trim_matches('/'))
    }

    /// Name of the remote-callable surface: the final segment of the
    /// hub path.
    pub fn surface_name(&self) -> &str {
        self.hub_path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or("")
    }

    /// Socket address the hub binds, extracted from the endpoint by
    /// stripping the scheme and resolving the host:port part.
    pub fn bind_addr(&self) -> Result<SocketAddr, AddressError> {
        let rest = self
            .endpoint
            .split_once("://")
            .map_or(self.endpoint.as_str(), |(_, rest)| rest);
        let host_port = rest.split('/').next().unwrap_or("");
        if host_port.is_empty() {
            return Err(AddressError::MissingHost(self.endpoint.clone()));
        }
        host_port
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| AddressError::Unresolvable(self.endpoint.clone()))
    }
}

impl fmt::Display for HubAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "endpoint:{} hub_path:{} connect_url:{} surface:{} system_proxy:{}",
            self.endpoint,
            self.hub_path,
            self.connect_url(),
            self.surface_name(),
            self.use_system_proxy
        )
    }
}
