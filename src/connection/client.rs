//! Client leg: a connection from a client to the proxy
//!
//! Each client leg owns a set of server legs, at most one per dial
//! authority. Server legs are reused across requests; the exception is
//! CONNECT tunneling, where the leg is single-use and never enters the reuse
//! map. Responses stream back through [`respond`](ClientSide::respond).

use super::server::{ServerSide, ServerSpawn};
use super::{ClientMsg, ConnectionState, PeerReader, ProxyContext, ServerMsg};
use crate::auth;
use crate::chain::Transport;
use crate::channel::{BufferedChannel, ChannelEvent, TlsRole};
use crate::common::{Authority, Error, Result};
use crate::http::codec::{announces_body, CodecSide};
use crate::http::rewrite;
use crate::http::{HttpObject, RequestHead, ResponseHead, Version};
use crate::track::FlowContext;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

const AUTH_REALM: &str = "Restricted Files";

const AUTH_REQUIRED_BODY: &str = "<!DOCTYPE HTML PUBLIC \"-//IETF//DTD HTML 2.0//EN\">\n\
<html><head>\n\
<title>407 Proxy Authentication Required</title>\n\
</head><body>\n\
<h1>Proxy Authentication Required</h1>\n\
<p>This server could not verify that you\n\
are authorized to access the document\n\
requested.  Either you supplied the wrong\n\
credentials (e.g., bad password), or your\n\
browser doesn't understand how to supply\n\
the credentials required.</p>\n\
</body></html>\n";

/// Client-side bookkeeping for one server leg.
struct ServerEntry {
    id: u64,
    /// Reuse-map key: the authority the leg was first dialed under. Kept
    /// even after a chained leg falls back to a direct connection, so
    /// later requests that recompute the same key find it.
    authority: Authority,
    ultimate_authority: Authority,
    chain_authority: Option<Authority>,
    tx: mpsc::UnboundedSender<ServerMsg>,
    /// CONNECT legs are single-use and never re-enter the reuse map.
    tunneling: bool,
    connected: bool,
    /// Original form of the request most recently routed to this leg.
    request: Arc<RequestHead>,
    request_id: u64,
    flow_ctx: FlowContext,
}

pub struct ClientSide {
    channel: BufferedChannel,
    events: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    peer_tx: mpsc::UnboundedSender<ClientMsg>,
    peer_rx: Option<mpsc::UnboundedReceiver<ClientMsg>>,
    state: ConnectionState,
    ctx: Arc<ProxyContext>,
    client_addr: SocketAddr,

    servers: HashMap<u64, ServerEntry>,
    by_authority: HashMap<Authority, u64>,
    /// The leg receiving the current in-flight request body.
    current_server: Option<u64>,

    connecting: AtomicUsize,
    connected: AtomicUsize,
    reused: AtomicUsize,

    /// Requests (by sequence id) that fell back to a direct connection.
    chaining_disabled: HashSet<u64>,
    saturated_servers: HashSet<u64>,

    next_server_id: u64,
    next_request_id: u64,
}

impl ClientSide {
    /// Take ownership of an accepted socket and run the connection.
    pub fn spawn(stream: TcpStream, client_addr: SocketAddr, ctx: Arc<ProxyContext>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let channel =
            BufferedChannel::spawn(stream, CodecSide::Requests, ctx.idle_timeout(), events_tx);
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();

        let client = ClientSide {
            channel,
            events: Some(events_rx),
            peer_tx,
            peer_rx: Some(peer_rx),
            state: ConnectionState::AwaitingInitial,
            ctx,
            client_addr,
            servers: HashMap::new(),
            by_authority: HashMap::new(),
            current_server: None,
            connecting: AtomicUsize::new(0),
            connected: AtomicUsize::new(0),
            reused: AtomicUsize::new(0),
            chaining_disabled: HashSet::new(),
            saturated_servers: HashSet::new(),
            next_server_id: 1,
            next_request_id: 1,
        };
        debug!("Created client connection from {}", client_addr);
        tokio::spawn(client.run());
    }

    async fn run(mut self) {
        let Some(mut events) = self.events.take() else {
            return;
        };
        let Some(mut peer_rx) = self.peer_rx.take() else {
            return;
        };

        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        None | Some(ChannelEvent::Inactive) => break,
                        Some(event) => self.on_channel_event(event).await,
                    }
                }
                msg = peer_rx.recv() => {
                    match msg {
                        None => break,
                        Some(msg) => self.on_peer_msg(msg).await,
                    }
                }
            }
        }

        // Destroying the client leg disconnects every server leg it owns
        self.state = ConnectionState::Disconnected;
        debug!("Client {} disconnected", self.client_addr);
        for entry in self.servers.values() {
            let _ = entry.tx.send(ServerMsg::Disconnect);
        }
    }

    async fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Active | ChannelEvent::Inactive => {}
            ChannelEvent::Read(object) => {
                if let Some(entry) = self.current_server.and_then(|id| self.servers.get(&id)) {
                    self.ctx
                        .recorder
                        .bytes_received_from_client(&entry.flow_ctx, object.wire_size());
                }
                self.dispatch(object).await;
            }
            ChannelEvent::WritabilityChanged(writable) => {
                // Saturation coupling: the client's writability gates reading
                // on every server leg
                if writable {
                    debug!("Client channel writeable again, resuming server reads");
                    for entry in self.servers.values() {
                        let _ = entry.tx.send(ServerMsg::ResumeReading);
                    }
                } else {
                    debug!("Client channel saturated, pausing server reads");
                    for entry in self.servers.values() {
                        let _ = entry.tx.send(ServerMsg::StopReading);
                    }
                }
            }
            ChannelEvent::Idle => {
                info!("Client {} idle, disconnecting", self.client_addr);
                self.disconnect();
            }
            ChannelEvent::Exception(e) => {
                if e.is_closed_channel() {
                    warn!("Client channel closed: {}", e);
                } else {
                    tracing::error!("Client channel error: {}", e);
                }
                self.disconnect();
            }
        }
    }

    async fn on_peer_msg(&mut self, msg: ClientMsg) {
        match msg {
            ClientMsg::FlowStarted { .. } => {
                self.channel.set_auto_read(false);
                self.connecting.fetch_add(1, Ordering::SeqCst);
            }
            ClientMsg::FlowSucceeded { id } => {
                if let Some(entry) = self.servers.get_mut(&id) {
                    entry.connected = true;
                }
                self.connected.fetch_add(1, Ordering::SeqCst);
                self.resume_reading_if_necessary();
            }
            ClientMsg::FlowFailed {
                id,
                last_state,
                error,
            } => {
                self.resume_reading_if_necessary();
                self.handle_flow_failure(id, last_state, error).await;
            }
            ClientMsg::Respond {
                id,
                request,
                response,
                object,
            } => {
                self.respond(id, request, response, object).await;
            }
            ClientMsg::RespondConnectEstablished { acceptor, done } => {
                let result = self.respond_connect_established(acceptor).await;
                let _ = done.send(result);
            }
            ClientMsg::ServerSaturated { id } => {
                info!("Connection to server became saturated, stopping reading");
                self.saturated_servers.insert(id);
                self.channel.set_auto_read(false);
            }
            ClientMsg::ServerWritable { id } => {
                self.saturated_servers.remove(&id);
                if self.saturated_servers.is_empty() {
                    info!("All server connections writeable, resuming reading");
                    self.channel.set_auto_read(true);
                }
            }
            ClientMsg::ServerDisconnected { id } => {
                if let Some(entry) = self.servers.remove(&id) {
                    if entry.connected {
                        self.connected.fetch_sub(1, Ordering::SeqCst);
                    }
                    if self.by_authority.get(&entry.authority) == Some(&id) {
                        self.by_authority.remove(&entry.authority);
                    }
                }
                self.saturated_servers.remove(&id);
                if self.current_server == Some(id) {
                    self.current_server = None;
                }
                if self.connected.load(Ordering::SeqCst) == 0 {
                    // All servers are disconnected, disconnect from client
                    self.disconnect();
                }
            }
        }
    }

    fn resume_reading_if_necessary(&self) {
        if self.connecting.fetch_sub(1, Ordering::SeqCst) == 1 {
            debug!("All server connection flows finished, resuming client reads");
            self.channel.set_auto_read(true);
        }
    }

    /***********************************************************************
     * Request path
     **********************************************************************/

    async fn handle_request(&mut self, mut request: RequestHead) -> ConnectionState {
        debug!("Got request: {}", request);

        // Authentication gate
        if let Some(authenticator) = self.ctx.authenticator.clone() {
            match auth::parse_basic_credentials(&request) {
                Some((user, pass)) if authenticator.authenticate(&user, &pass) => {
                    // Do not leak credentials upstream
                    request.headers.remove("Proxy-Authorization");
                }
                _ => {
                    debug!("Request not authenticated, answering 407");
                    self.write_authentication_required(&request).await;
                    return ConnectionState::AwaitingProxyAuthentication;
                }
            }
        }

        // Target authority from the request-URI or Host header
        let ultimate = match rewrite::parse_host_and_port(&request)
            .and_then(|text| Authority::parse(&text, 80).ok())
        {
            Some(authority) => authority,
            None => {
                warn!("No host and port found in {}", request.uri);
                self.write_bad_gateway(&request).await;
                return ConnectionState::DisconnectRequested;
            }
        };

        // Routing: direct or through a chained proxy
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let chain_authority = match &self.ctx.chain {
            Some(chain) if !self.chaining_disabled.contains(&request_id) => {
                chain.host_and_port(&request)
            }
            _ => None,
        };
        let transport = match (&self.ctx.chain, &chain_authority) {
            (Some(chain), Some(_)) => chain.transport(),
            _ => Transport::Tcp,
        };
        let dial = chain_authority.clone().unwrap_or_else(|| ultimate.clone());

        // Record receipt before attempting to pass the request on
        let flow_ctx = FlowContext {
            client_address: self.client_addr,
            transport,
            server_authority: ultimate.clone(),
            chain_authority: chain_authority.clone(),
        };
        self.ctx
            .recorder
            .request_received_from_client(&flow_ctx, &request);

        let is_connect = request.is_connect();
        let streams_body = announces_body(&HttpObject::Request(request.clone()));
        let original = Arc::new(request.clone());
        let outbound = self.prepare_outbound(request, chain_authority.is_some());

        // Locate or create the server leg. CONNECT always forces a fresh one.
        let existing = if is_connect {
            None
        } else {
            self.by_authority.get(&dial).copied()
        };

        match existing {
            Some(id) => {
                debug!("Reusing existing server connection to {}", dial);
                self.reused.fetch_add(1, Ordering::SeqCst);
                if let Some(entry) = self.servers.get_mut(&id) {
                    entry.request = original.clone();
                    entry.request_id = request_id;
                    entry.flow_ctx = flow_ctx;
                    let _ = entry.tx.send(ServerMsg::Request {
                        request: outbound,
                        original,
                    });
                }
                self.current_server = Some(id);
            }
            None => {
                debug!("Establishing new server connection to {}", dial);
                let id = self.next_server_id;
                self.next_server_id += 1;

                let (chain_tls, chain_skip, chain_credentials) = match &self.ctx.chain {
                    Some(chain) if chain_authority.is_some() => (
                        chain.requires_encryption(&original),
                        chain.skip_cert_verify(),
                        chain.credentials(),
                    ),
                    _ => (false, false, None),
                };
                let response_filter = self
                    .ctx
                    .response_filters
                    .as_ref()
                    .and_then(|source| source.filter_for(&ultimate));

                let tx = ServerSide::spawn(
                    ServerSpawn {
                        id,
                        authority: dial.clone(),
                        ultimate_authority: ultimate.clone(),
                        chain_authority: chain_authority.clone(),
                        transport,
                        chain_tls,
                        chain_skip_cert_verify: chain_skip,
                        chain_credentials,
                        mitm: is_connect && self.ctx.mitm_enabled(),
                        request: outbound,
                        original: original.clone(),
                        response_filter,
                        client_address: self.client_addr,
                    },
                    self.ctx.clone(),
                    self.peer_tx.clone(),
                    self.channel.clone(),
                );

                let entry = ServerEntry {
                    id,
                    authority: dial.clone(),
                    ultimate_authority: ultimate,
                    chain_authority,
                    tx,
                    tunneling: is_connect,
                    connected: false,
                    request: original,
                    request_id,
                    flow_ctx,
                };
                if !is_connect {
                    self.by_authority.insert(dial, id);
                }
                self.servers.insert(id, entry);
                self.current_server = Some(id);
            }
        }

        // Next state per the request shape
        if is_connect {
            ConnectionState::NegotiatingConnect
        } else if streams_body {
            ConnectionState::AwaitingChunk
        } else {
            ConnectionState::AwaitingInitial
        }
    }

    /// Header rewriting for the upstream leg. The request filter runs
    /// between the scrub and the proxy's own additions so filter-introduced
    /// hop-by-hop headers are scrubbed as well.
    fn prepare_outbound(&self, mut request: RequestHead, chained: bool) -> RequestHead {
        if self.ctx.config.transparent {
            if let Some(filter) = &self.ctx.request_filter {
                filter.filter(&mut request);
            }
            return request;
        }

        rewrite::rewrite_request(&mut request, chained);
        if let Some(filter) = &self.ctx.request_filter {
            filter.filter(&mut request);
            rewrite::scrub_hop_by_hop(&mut request.headers);
        }
        rewrite::finish_request_rewrite(&mut request, self.ctx.via_alias());
        request
    }

    /***********************************************************************
     * Response path
     **********************************************************************/

    /// Forward one response object to the client; on completion, force a
    /// flush with an empty buffer and evaluate the close decisions.
    async fn respond(
        &mut self,
        id: u64,
        request: Arc<RequestHead>,
        response: Arc<ResponseHead>,
        object: HttpObject,
    ) {
        let is_final = match &object {
            HttpObject::LastChunk => true,
            // Heads of bodyless responses (204/304, HEAD) complete immediately
            HttpObject::Response(_) => request.is_head() || !announces_body(&object),
            _ => false,
        };

        let object = match object {
            HttpObject::Response(mut head) => {
                rewrite::fix_version_for_chunked(&mut head);
                if !self.ctx.config.transparent {
                    rewrite::rewrite_response(&mut head, self.ctx.via_alias());
                }
                HttpObject::Response(head)
            }
            other => other,
        };
        self.channel.send(object);

        if is_final {
            // The empty buffer gives a reliable fully-flushed completion
            let flushed = self.channel.write(HttpObject::Raw(Bytes::new()));
            let _ = flushed.await;

            if rewrite::should_close_server(&request, &response, true) {
                debug!("Closing remote connection after writing to client");
                if let Some(entry) = self.servers.get(&id) {
                    let _ = entry.tx.send(ServerMsg::Disconnect);
                }
            }
            if rewrite::should_close_client(&request, &response, true) {
                debug!("Closing connection to client after writes");
                self.disconnect();
            }
        }
    }

    /// Flow step executed on behalf of a server leg answering a CONNECT:
    /// write the established response, optionally terminate TLS with a
    /// spoofed leaf, then go raw.
    async fn respond_connect_established(
        &mut self,
        acceptor: Option<TlsAcceptor>,
    ) -> Result<()> {
        debug!("Responding with CONNECT successful");
        let mut response = ResponseHead::new(
            Version::Http11,
            200,
            "HTTP/1.1 200 Connection established",
        );
        response.headers.set("Connection", "Keep-Alive");
        response.headers.set("Proxy-Connection", "Keep-Alive");
        rewrite::add_via(&mut response.headers, self.ctx.via_alias());

        self.channel
            .write(HttpObject::Response(response))
            .await
            .map_err(|_| Error::protocol("client channel closed"))??;

        if let Some(acceptor) = acceptor {
            self.state = ConnectionState::Handshaking;
            self.channel
                .install_tls(TlsRole::Server { acceptor })
                .await
                .map_err(|_| Error::tls("client channel closed during handshake"))??;
        }

        self.channel.start_tunneling();
        self.state = ConnectionState::Tunneling;
        Ok(())
    }

    /***********************************************************************
     * Connect-flow coordination
     **********************************************************************/

    async fn handle_flow_failure(&mut self, id: u64, last_state: ConnectionState, error: Error) {
        let (request, request_id, can_fallback) = {
            let Some(entry) = self.servers.get(&id) else {
                return;
            };
            let can_fallback = entry.chain_authority.is_some()
                && self
                    .ctx
                    .chain
                    .as_ref()
                    .map(|chain| chain.allow_fallback_to_unchained(&entry.request))
                    .unwrap_or(false);
            (entry.request.clone(), entry.request_id, can_fallback)
        };

        if can_fallback {
            info!(
                "Failed to connect via chained proxy, falling back to direct connection. \
                 Last state before failure: {} ({})",
                last_state, error
            );
            self.chaining_disabled.insert(request_id);
            // The reuse map keeps its original (chained) key: later requests
            // to the same authority recompute that key and must find this
            // now-direct connection
            if let Some(entry) = self.servers.get_mut(&id) {
                entry.chain_authority = None;
                entry.flow_ctx.chain_authority = None;
                let _ = entry.tx.send(ServerMsg::RetryDirect);
            }
        } else {
            debug!(
                "Connection to server failed: {}. Last state before failure: {}",
                error, last_state
            );
            if let Some(entry) = self.servers.remove(&id) {
                if self.by_authority.get(&entry.authority) == Some(&id) {
                    self.by_authority.remove(&entry.authority);
                }
                let _ = entry.tx.send(ServerMsg::Disconnect);
            }
            if self.current_server == Some(id) {
                self.current_server = None;
            }
            self.write_bad_gateway(&request).await;
            self.state = ConnectionState::DisconnectRequested;
        }
    }

    /***********************************************************************
     * Synthesized responses
     **********************************************************************/

    async fn write_bad_gateway(&mut self, request: &RequestHead) {
        let body = format!("Bad Gateway: {}", request.uri);
        let mut response = synthetic_response(502, "Bad Gateway", &body);
        response.headers.set("Connection", "close");
        self.write_synthetic(response, Bytes::from(body.into_bytes()))
            .await;
        self.channel.close();
    }

    async fn write_authentication_required(&mut self, request: &RequestHead) {
        let mut response =
            synthetic_response(407, "Proxy Authentication Required", AUTH_REQUIRED_BODY);
        response.headers.set("Date", rewrite::http_date());
        response.headers.set(
            "Proxy-Authenticate",
            format!("Basic realm=\"{}\"", AUTH_REALM),
        );
        self.write_synthetic(response, Bytes::from_static(AUTH_REQUIRED_BODY.as_bytes()))
            .await;

        // A refused CONNECT left the decoder holding; parse the retry as HTTP
        if request.is_connect() {
            self.channel.resume_http();
        }
    }

    async fn write_synthetic(&mut self, response: ResponseHead, body: Bytes) {
        self.channel.send(HttpObject::Response(response));
        if !body.is_empty() {
            self.channel.send(HttpObject::Chunk(body));
        }
        let flushed = self.channel.write(HttpObject::Raw(Bytes::new()));
        let _ = flushed.await;
    }

    fn disconnect(&mut self) {
        self.state = ConnectionState::DisconnectRequested;
        self.channel.close();
    }
}

fn synthetic_response(status: u16, reason: &str, body: &str) -> ResponseHead {
    let mut response = ResponseHead::new(Version::Http11, status, reason);
    response
        .headers
        .set("Content-Length", body.len().to_string());
    response
        .headers
        .set("Content-Type", "text/html; charset=UTF-8");
    response
}

#[async_trait]
impl PeerReader for ClientSide {
    fn state(&self) -> ConnectionState {
        self.state
    }

    fn set_state(&mut self, next: ConnectionState) {
        self.state = next;
    }

    fn label(&self) -> &'static str {
        "client"
    }

    async fn read_initial(&mut self, object: HttpObject) -> ConnectionState {
        let HttpObject::Request(request) = object else {
            warn!("Expected a request head from the client, got something else");
            return self.state;
        };
        self.handle_request(request).await
    }

    async fn read_chunk(&mut self, object: HttpObject) {
        if let Some(entry) = self.current_server.and_then(|id| self.servers.get(&id)) {
            let _ = entry.tx.send(ServerMsg::Object(object));
        }
    }

    async fn read_raw(&mut self, data: Bytes) {
        if let Some(entry) = self.current_server.and_then(|id| self.servers.get(&id)) {
            let _ = entry.tx.send(ServerMsg::Object(HttpObject::Raw(data)));
        }
    }

    async fn protocol_error(&mut self, message: &str) {
        warn!("Protocol error from client: {}", message);
        self.disconnect();
    }
}
