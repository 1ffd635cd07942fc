//! Name resolution for upstream connections

use crate::{Error, Result};
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::debug;

/// Resolver for upstream authorities, with an IP-literal fast path and
/// optional DNSSEC validation.
pub struct AddressResolver {
    resolver: TokioAsyncResolver,
}

impl AddressResolver {
    pub fn new(use_dnssec: bool) -> Self {
        let (config, mut opts) = hickory_resolver::system_conf::read_system_conf()
            .unwrap_or_else(|_| (ResolverConfig::default(), ResolverOpts::default()));

        opts.validate = use_dnssec;
        opts.timeout = Duration::from_secs(5);
        opts.attempts = 2;

        AddressResolver {
            resolver: TokioAsyncResolver::tokio(config, opts),
        }
    }

    /// Resolve `host` to a socket address. IP literals skip the resolver.
    pub async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }

        let lookup = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|e| Error::UnknownHost(format!("{}: {}", host, e)))?;

        let ip = lookup
            .iter()
            .next()
            .ok_or_else(|| Error::UnknownHost(host.to_string()))?;

        debug!("Resolved {} -> {}", host, ip);
        Ok(SocketAddr::new(ip, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_numeric_fast_path() {
        let resolver = AddressResolver::new(false);
        let addr = resolver.resolve("127.0.0.1", 8080).await.unwrap();
        assert_eq!(addr, "127.0.0.1:8080".parse().unwrap());

        let v6 = resolver.resolve("::1", 443).await.unwrap();
        assert_eq!(v6.port(), 443);
        assert!(v6.is_ipv6());
    }
}
