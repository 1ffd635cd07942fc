//! Relaygate - intercepting HTTP/1.1 forward proxy
//!
//! Accepts client HTTP requests, forwards them to origin servers (optionally
//! via a chained upstream proxy), streams responses back, and tunnels raw
//! bytes once a client issues `CONNECT`. Supports MITM TLS interception on
//! the client leg, optional TLS upstream, Basic proxy authentication,
//! pluggable request/response filters and activity tracking.
//!
//! # Architecture
//!
//! ```text
//!            +--------------+       +----------------+
//!  client -> |  ClientSide  | ----> |   ServerSide   | -> origin / chain
//!            | (state mach.)| <---- | (connect flow) |
//!            +------+-------+       +--------+-------+
//!                   |                        |
//!            +------v-------+       +--------v-------+
//!            | BufferedChan |       | BufferedChan   |
//!            | (codecs/TLS) |       | (codecs/TLS)   |
//!            +--------------+       +----------------+
//! ```
//!
//! Each connection runs on its own task; the two sides couple through
//! message channels for responses, backpressure and connect-flow events.

pub mod auth;
pub mod chain;
pub mod channel;
pub mod common;
pub mod config;
pub mod connection;
pub mod dns;
pub mod filter;
pub mod http;
pub mod listener;
pub mod tls;
pub mod track;

pub use common::error::{Error, Result};
pub use common::Authority;
pub use config::Config;
pub use connection::ProxyContext;

use crate::auth::{BasicAuthenticator, ProxyAuthenticator};
use crate::chain::{ChainProxyManager, StaticChainManager};
use crate::dns::AddressResolver;
use crate::filter::{RequestFilter, ResponseFilterSource};
use crate::listener::ProxyListener;
use crate::tls::CertificateAuthority;
use crate::track::{ActivityRecorder, ActivityTracker};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Proxy instance wiring configuration and collaborators together.
///
/// Collaborators configured in YAML (auth credentials, a static chain,
/// MITM) are installed automatically; programmatic ones (filters, trackers,
/// custom chain policies) are attached with the `with_*` methods before
/// [`start`](Self::start).
pub struct ProxyServer {
    config: Config,
    authenticator: Option<Arc<dyn ProxyAuthenticator>>,
    chain: Option<Arc<dyn ChainProxyManager>>,
    request_filter: Option<Arc<dyn RequestFilter>>,
    response_filters: Option<Arc<dyn ResponseFilterSource>>,
    trackers: Vec<Arc<dyn ActivityTracker>>,
    listener: Option<Arc<ProxyListener>>,
}

impl ProxyServer {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let authenticator: Option<Arc<dyn ProxyAuthenticator>> = config
            .auth
            .as_ref()
            .map(|auth| Arc::new(BasicAuthenticator::new(auth)) as Arc<dyn ProxyAuthenticator>);

        let chain: Option<Arc<dyn ChainProxyManager>> = config
            .chain
            .as_ref()
            .map(|c| Arc::new(StaticChainManager::new(c.clone())) as Arc<dyn ChainProxyManager>);

        Ok(ProxyServer {
            config,
            authenticator,
            chain,
            request_filter: None,
            response_filters: None,
            trackers: Vec::new(),
            listener: None,
        })
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn ProxyAuthenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn with_chain_manager(mut self, chain: Arc<dyn ChainProxyManager>) -> Self {
        self.chain = Some(chain);
        self
    }

    pub fn with_request_filter(mut self, filter: Arc<dyn RequestFilter>) -> Self {
        self.request_filter = Some(filter);
        self
    }

    pub fn with_response_filters(mut self, filters: Arc<dyn ResponseFilterSource>) -> Self {
        self.response_filters = Some(filters);
        self
    }

    pub fn add_activity_tracker(mut self, tracker: Arc<dyn ActivityTracker>) -> Self {
        self.trackers.push(tracker);
        self
    }

    /// Bind the listener and start accepting in the background. Returns the
    /// bound address (useful with a `:0` listen port).
    pub async fn start(&mut self) -> Result<SocketAddr> {
        let ctx = Arc::new(self.build_context()?);
        let listener = Arc::new(ProxyListener::bind(ctx).await?);
        let addr = listener.local_addr()?;

        let accept = listener.clone();
        tokio::spawn(async move {
            if let Err(e) = accept.run().await {
                tracing::warn!("Listener error: {}", e);
            }
        });

        self.listener = Some(listener);
        Ok(addr)
    }

    /// Start and block until ctrl-c.
    pub async fn run(&mut self) -> Result<()> {
        let addr = self.start().await?;
        info!("relaygate v{} ready on {}", VERSION, addr);

        tokio::signal::ctrl_c().await?;
        info!("Received shutdown signal");
        self.stop();
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(listener) = &self.listener {
            listener.stop();
        }
    }

    fn build_context(&self) -> Result<ProxyContext> {
        let mitm = match &self.config.mitm {
            Some(mitm) if mitm.enabled => {
                let ca = match (&mitm.ca_cert, &mitm.ca_key) {
                    (Some(cert), Some(key)) => CertificateAuthority::from_files(cert, key)?,
                    _ => CertificateAuthority::new()?,
                };
                info!("MITM interception enabled");
                Some(Arc::new(ca))
            }
            _ => None,
        };

        Ok(ProxyContext {
            resolver: AddressResolver::new(self.config.use_dnssec),
            authenticator: self.authenticator.clone(),
            chain: self.chain.clone(),
            request_filter: self.request_filter.clone(),
            response_filters: self.response_filters.clone(),
            recorder: ActivityRecorder::new(self.trackers.clone()),
            mitm,
            config: self.config.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_from_default_config() {
        let server = ProxyServer::new(Config::default()).unwrap();
        assert!(server.authenticator.is_none());
        assert!(server.chain.is_none());
    }

    #[test]
    fn test_configured_collaborators_installed() {
        let config = Config::from_str(
            r#"
listen: "127.0.0.1:0"
auth:
  username: user
  password: pass
chain:
  server: upstream.example
  port: 3128
"#,
        )
        .unwrap();
        let server = ProxyServer::new(config).unwrap();
        assert!(server.authenticator.is_some());
        assert!(server.chain.is_some());
    }
}
