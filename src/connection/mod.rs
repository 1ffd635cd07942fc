//! Peer connections and their shared lifecycle
//!
//! Both ends of the proxy (client leg and server legs) drive the same state
//! machine: every inbound message is dispatched by the connection's current
//! state. The sides differ only in what an "initial" message is and where
//! traffic is forwarded.

pub mod client;
pub mod flow;
pub mod server;

use crate::auth::ProxyAuthenticator;
use crate::chain::ChainProxyManager;
use crate::common::{Error, Result};
use crate::config::Config;
use crate::dns::AddressResolver;
use crate::filter::{RequestFilter, ResponseFilterSource};
use crate::http::{HttpObject, RequestHead, ResponseHead};
use crate::tls::CertificateAuthority;
use crate::track::ActivityRecorder;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

/// Lifecycle state of a peer connection. Transitions are serialized per
/// connection; `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    NegotiatingConnect,
    AwaitingInitial,
    AwaitingChunk,
    AwaitingProxyAuthentication,
    Tunneling,
    DisconnectRequested,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Handshaking => "HANDSHAKING",
            ConnectionState::NegotiatingConnect => "NEGOTIATING_CONNECT",
            ConnectionState::AwaitingInitial => "AWAITING_INITIAL",
            ConnectionState::AwaitingChunk => "AWAITING_CHUNK",
            ConnectionState::AwaitingProxyAuthentication => "AWAITING_PROXY_AUTHENTICATION",
            ConnectionState::Tunneling => "TUNNELING",
            ConnectionState::DisconnectRequested => "DISCONNECT_REQUESTED",
        };
        f.write_str(name)
    }
}

/// Shared collaborators handed to every connection.
pub struct ProxyContext {
    pub config: Config,
    pub resolver: AddressResolver,
    pub authenticator: Option<Arc<dyn ProxyAuthenticator>>,
    pub chain: Option<Arc<dyn ChainProxyManager>>,
    pub request_filter: Option<Arc<dyn RequestFilter>>,
    pub response_filters: Option<Arc<dyn ResponseFilterSource>>,
    pub recorder: ActivityRecorder,
    pub mitm: Option<Arc<CertificateAuthority>>,
}

impl ProxyContext {
    pub fn via_alias(&self) -> &str {
        self.config.via_alias()
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.config.idle_timeout()
    }

    pub fn mitm_enabled(&self) -> bool {
        self.mitm.is_some()
    }
}

/// Messages a server leg posts to its owning client leg.
pub(crate) enum ClientMsg {
    /// The server entered its connection flow; stop reading from the client.
    FlowStarted { id: u64 },
    FlowSucceeded { id: u64 },
    FlowFailed {
        id: u64,
        last_state: ConnectionState,
        error: Error,
    },
    /// Stream one response object back to the client.
    Respond {
        id: u64,
        request: Arc<RequestHead>,
        response: Arc<ResponseHead>,
        object: HttpObject,
    },
    /// Flow step executed on the client: write `200 Connection established`,
    /// optionally terminate TLS with a spoofed leaf, then start tunneling.
    RespondConnectEstablished {
        acceptor: Option<TlsAcceptor>,
        done: oneshot::Sender<Result<()>>,
    },
    ServerSaturated { id: u64 },
    ServerWritable { id: u64 },
    ServerDisconnected { id: u64 },
}

/// Messages a client leg posts to one of its server legs.
pub(crate) enum ServerMsg {
    /// Forward a (rewritten) request; the original is retained for the
    /// response path's close decisions.
    Request {
        request: RequestHead,
        original: Arc<RequestHead>,
    },
    /// Body chunk or tunneled bytes belonging to the current request.
    Object(HttpObject),
    StopReading,
    ResumeReading,
    /// Chained connect failed; retry the same connection direct to origin.
    RetryDirect,
    Disconnect,
}

/// State-driven dispatch shared by both peer kinds.
#[async_trait]
pub(crate) trait PeerReader {
    fn state(&self) -> ConnectionState;
    fn set_state(&mut self, next: ConnectionState);
    fn label(&self) -> &'static str;

    /// Handle an initial message (request or response head) and pick the
    /// next state.
    async fn read_initial(&mut self, object: HttpObject) -> ConnectionState;

    /// Handle one body chunk of the in-flight message.
    async fn read_chunk(&mut self, object: HttpObject);

    /// Handle raw tunneled bytes.
    async fn read_raw(&mut self, data: Bytes);

    /// A message arrived that the current state forbids; tear down.
    async fn protocol_error(&mut self, message: &str);

    async fn dispatch(&mut self, object: HttpObject) {
        match self.state() {
            ConnectionState::AwaitingInitial => match object {
                HttpObject::Chunk(_) | HttpObject::LastChunk => {
                    self.protocol_error("body chunk while awaiting an initial message")
                        .await;
                }
                object => {
                    let next = self.read_initial(object).await;
                    self.set_state(next);
                }
            },
            ConnectionState::AwaitingChunk => {
                let last = object.is_last_chunk();
                self.read_chunk(object).await;
                self.set_state(if last {
                    ConnectionState::AwaitingInitial
                } else {
                    ConnectionState::AwaitingChunk
                });
            }
            ConnectionState::Tunneling => match object {
                HttpObject::Raw(data) => self.read_raw(data).await,
                other => {
                    debug!(
                        "{}: dropping non-raw object while tunneling: {:?}",
                        self.label(),
                        std::mem::discriminant(&other)
                    );
                }
            },
            ConnectionState::AwaitingProxyAuthentication => match object {
                HttpObject::Request(_) => {
                    let next = self.read_initial(object).await;
                    self.set_state(next);
                }
                _ => {
                    // Leftover body of the rejected request; drop it
                    debug!(
                        "{}: discarding message while awaiting proxy authentication",
                        self.label()
                    );
                }
            },
            state @ (ConnectionState::Connecting
            | ConnectionState::NegotiatingConnect
            | ConnectionState::Handshaking) => {
                warn!(
                    "{}: attempted to read while {}; this shouldn't happen",
                    self.label(),
                    state
                );
            }
            ConnectionState::DisconnectRequested | ConnectionState::Disconnected => {
                debug!(
                    "{}: ignoring message since the connection is closed or about to close",
                    self.label()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe {
        state: ConnectionState,
        initials: usize,
        chunks: usize,
        raws: usize,
        errors: usize,
    }

    impl Probe {
        fn new(state: ConnectionState) -> Self {
            Probe {
                state,
                initials: 0,
                chunks: 0,
                raws: 0,
                errors: 0,
            }
        }
    }

    #[async_trait]
    impl PeerReader for Probe {
        fn state(&self) -> ConnectionState {
            self.state
        }

        fn set_state(&mut self, next: ConnectionState) {
            self.state = next;
        }

        fn label(&self) -> &'static str {
            "probe"
        }

        async fn read_initial(&mut self, _object: HttpObject) -> ConnectionState {
            self.initials += 1;
            ConnectionState::AwaitingChunk
        }

        async fn read_chunk(&mut self, _object: HttpObject) {
            self.chunks += 1;
        }

        async fn read_raw(&mut self, _data: Bytes) {
            self.raws += 1;
        }

        async fn protocol_error(&mut self, _message: &str) {
            self.errors += 1;
            self.state = ConnectionState::Disconnected;
        }
    }

    fn request_object() -> HttpObject {
        use crate::http::Version;
        HttpObject::Request(RequestHead::new("GET", "/", Version::Http11))
    }

    #[tokio::test]
    async fn test_initial_then_chunks_then_back() {
        let mut probe = Probe::new(ConnectionState::AwaitingInitial);
        probe.dispatch(request_object()).await;
        assert_eq!(probe.state, ConnectionState::AwaitingChunk);

        probe.dispatch(HttpObject::Chunk(Bytes::from_static(b"x"))).await;
        assert_eq!(probe.state, ConnectionState::AwaitingChunk);

        probe.dispatch(HttpObject::LastChunk).await;
        assert_eq!(probe.state, ConnectionState::AwaitingInitial);
        assert_eq!(probe.chunks, 2);
    }

    #[tokio::test]
    async fn test_chunk_in_awaiting_initial_is_protocol_error() {
        let mut probe = Probe::new(ConnectionState::AwaitingInitial);
        probe.dispatch(HttpObject::Chunk(Bytes::from_static(b"x"))).await;
        assert_eq!(probe.errors, 1);
        assert_eq!(probe.state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_tunneling_forwards_raw_only() {
        let mut probe = Probe::new(ConnectionState::Tunneling);
        probe.dispatch(HttpObject::Raw(Bytes::from_static(b"x"))).await;
        probe.dispatch(request_object()).await;
        assert_eq!(probe.raws, 1);
        assert_eq!(probe.initials, 0);
        assert_eq!(probe.state, ConnectionState::Tunneling);
    }

    #[tokio::test]
    async fn test_auth_pending_discards_non_requests() {
        let mut probe = Probe::new(ConnectionState::AwaitingProxyAuthentication);
        probe.dispatch(HttpObject::Chunk(Bytes::from_static(b"x"))).await;
        assert_eq!(probe.chunks, 0);
        assert_eq!(probe.state, ConnectionState::AwaitingProxyAuthentication);

        probe.dispatch(request_object()).await;
        assert_eq!(probe.initials, 1);
        assert_eq!(probe.state, ConnectionState::AwaitingChunk);
    }

    #[tokio::test]
    async fn test_closed_states_drop_messages() {
        for state in [
            ConnectionState::Connecting,
            ConnectionState::NegotiatingConnect,
            ConnectionState::Handshaking,
            ConnectionState::DisconnectRequested,
            ConnectionState::Disconnected,
        ] {
            let mut probe = Probe::new(state);
            probe.dispatch(request_object()).await;
            assert_eq!(probe.initials, 0);
            assert_eq!(probe.state, state);
        }
    }
}
