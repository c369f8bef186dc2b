//! Chained-proxy routing policy.

use std::sync::Arc;

use rustls::ClientConfig;

use crate::http1::HttpRequest;

/// Transport used for the upstream leg. UDP exists for policy completeness;
/// dialing it is refused at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProtocol {
    Tcp,
    Udp,
}

impl TransportProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportProtocol::Tcp => "tcp",
            TransportProtocol::Udp => "udp",
        }
    }
}

/// Decides, per request, whether to forward through an upstream proxy and
/// how to reach it.
pub trait ChainProxyManager: Send + Sync {
    /// Authority of the chained proxy for this request, or `None` to go
    /// direct.
    fn host_and_port(&self, request: &HttpRequest) -> Option<String>;

    fn transport_protocol(&self) -> TransportProtocol {
        TransportProtocol::Tcp
    }

    /// Whether the hop to the chained proxy itself is TLS.
    fn requires_encryption(&self, _request: &HttpRequest) -> bool {
        false
    }

    /// TLS configuration for an encrypted chained hop.
    fn tls_context(&self) -> Option<Arc<ClientConfig>> {
        None
    }

    /// Credentials to present in `Proxy-Authorization` when issuing a
    /// `CONNECT` to the chained proxy.
    fn credentials(&self) -> Option<(String, String)> {
        None
    }

    /// May a failed chained connection be retried as a direct one?
    fn allow_fallback_to_unchained_connection(&self, _request: &HttpRequest) -> bool {
        false
    }
}

/// Config-file chaining: one fixed upstream proxy for every request.
pub struct StaticChainManager {
    authority: String,
    fallback_direct: bool,
}

impl StaticChainManager {
    pub fn new(authority: String, fallback_direct: bool) -> StaticChainManager {
        StaticChainManager {
            authority,
            fallback_direct,
        }
    }
}

impl ChainProxyManager for StaticChainManager {
    fn host_and_port(&self, _request: &HttpRequest) -> Option<String> {
        Some(self.authority.clone())
    }

    fn allow_fallback_to_unchained_connection(&self, _request: &HttpRequest) -> bool {
        self.fallback_direct
    }
}
