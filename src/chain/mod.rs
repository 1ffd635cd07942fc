//! Chained upstream proxy policy

use crate::common::Authority;
use crate::config::ChainConfig;
use crate::http::RequestHead;
use std::fmt;

/// Transport for the upstream leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "TCP"),
            Transport::Udp => write!(f, "UDP"),
        }
    }
}

/// Decides, per request, whether to forward through an upstream proxy.
///
/// Returning `None` from [`host_and_port`](Self::host_and_port) routes the
/// request directly to the origin.
pub trait ChainProxyManager: Send + Sync {
    /// Authority of the chained proxy for this request, if any.
    fn host_and_port(&self, request: &RequestHead) -> Option<Authority>;

    fn transport(&self) -> Transport {
        Transport::Tcp
    }

    /// Encrypt the leg to the chained proxy.
    fn requires_encryption(&self, _request: &RequestHead) -> bool {
        false
    }

    /// Accept any certificate from the chained proxy.
    fn skip_cert_verify(&self) -> bool {
        false
    }

    /// Credentials for the chained proxy's own `Proxy-Authorization`.
    fn credentials(&self) -> Option<(String, String)> {
        None
    }

    /// Whether a failed chained connection may retry direct to the origin.
    fn allow_fallback_to_unchained(&self, request: &RequestHead) -> bool;
}

/// Chain manager driven by a fixed config entry: every request goes through
/// the one configured upstream.
pub struct StaticChainManager {
    config: ChainConfig,
}

impl StaticChainManager {
    pub fn new(config: ChainConfig) -> Self {
        StaticChainManager { config }
    }
}

impl ChainProxyManager for StaticChainManager {
    fn host_and_port(&self, _request: &RequestHead) -> Option<Authority> {
        Some(Authority::new(self.config.server.clone(), self.config.port))
    }

    fn requires_encryption(&self, _request: &RequestHead) -> bool {
        self.config.tls
    }

    fn skip_cert_verify(&self) -> bool {
        self.config.skip_cert_verify
    }

    fn credentials(&self) -> Option<(String, String)> {
        match (&self.config.username, &self.config.password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        }
    }

    fn allow_fallback_to_unchained(&self, _request: &RequestHead) -> bool {
        self.config.fallback_to_direct
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Version;

    #[test]
    fn test_static_chain_manager() {
        let manager = StaticChainManager::new(ChainConfig {
            server: "upstream.example".to_string(),
            port: 3128,
            username: Some("u".to_string()),
            password: Some("p".to_string()),
            tls: false,
            skip_cert_verify: false,
            fallback_to_direct: true,
        });

        let req = RequestHead::new("GET", "http://example.org/", Version::Http11);
        let authority = manager.host_and_port(&req).unwrap();
        assert_eq!(authority.to_string(), "upstream.example:3128");
        assert!(manager.allow_fallback_to_unchained(&req));
        assert_eq!(
            manager.credentials(),
            Some(("u".to_string(), "p".to_string()))
        );
    }
}
