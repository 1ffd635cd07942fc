//! Server leg: the proxy's connection to an origin server or chained proxy
//!
//! Each server leg runs its connection flow (resolve, connect, optional
//! chained CONNECT, optional TLS, optional MITM setup) and then streams
//! responses back by posting `Respond` messages to its owning client leg.

use super::flow::{FlowOutcome, FlowStep};
use super::{ClientMsg, ConnectionState, PeerReader, ProxyContext, ServerMsg};
use crate::auth::basic_header;
use crate::chain::Transport;
use crate::channel::{BufferedChannel, ChannelEvent, TlsRole};
use crate::common::net::configure_tcp_stream;
use crate::common::{Authority, Error, Result};
use crate::filter::ResponseFilter;
use crate::http::codec::{announces_body, CodecSide};
use crate::http::{HttpObject, RequestHead, ResponseHead, Version};
use crate::tls;
use crate::track::FlowContext;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything the client side decides when it creates a server leg.
pub(crate) struct ServerSpawn {
    pub id: u64,
    /// Dial target: the chained proxy when chaining, else the origin.
    pub authority: Authority,
    pub ultimate_authority: Authority,
    pub chain_authority: Option<Authority>,
    pub transport: Transport,
    pub chain_tls: bool,
    pub chain_skip_cert_verify: bool,
    pub chain_credentials: Option<(String, String)>,
    /// The client's request was CONNECT and interception is enabled.
    pub mitm: bool,
    /// Rewritten request to forward once the flow completes.
    pub request: RequestHead,
    /// Verbatim copy kept for close decisions and tracker callbacks.
    pub original: Arc<RequestHead>,
    pub response_filter: Option<Arc<dyn ResponseFilter>>,
    pub client_address: SocketAddr,
}

pub(crate) struct ServerSide {
    id: u64,
    authority: Authority,
    ultimate_authority: Authority,
    chain_authority: Option<Authority>,
    transport: Transport,
    chain_tls: bool,
    chain_skip_cert_verify: bool,
    chain_credentials: Option<(String, String)>,
    mitm: bool,
    initial_is_connect: bool,
    initial_request: Option<RequestHead>,
    response_filter: Option<Arc<dyn ResponseFilter>>,
    client_address: SocketAddr,
    client_tx: mpsc::UnboundedSender<ClientMsg>,
    client_channel: BufferedChannel,
    ctx: Arc<ProxyContext>,
    state: ConnectionState,
    channel: Option<BufferedChannel>,
    events: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    resolved: Option<SocketAddr>,
    /// Original form of the in-flight request, for the response path.
    current_request: Arc<RequestHead>,
    current_response: Option<Arc<ResponseHead>>,
    request_recorded: bool,
}

impl ServerSide {
    /// Create the leg and start its task; the returned sender is the client
    /// side's only handle to it.
    pub(crate) fn spawn(
        params: ServerSpawn,
        ctx: Arc<ProxyContext>,
        client_tx: mpsc::UnboundedSender<ClientMsg>,
        client_channel: BufferedChannel,
    ) -> mpsc::UnboundedSender<ServerMsg> {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let initial_is_connect = params.original.is_connect();
        let server = ServerSide {
            id: params.id,
            authority: params.authority,
            ultimate_authority: params.ultimate_authority,
            chain_authority: params.chain_authority,
            transport: params.transport,
            chain_tls: params.chain_tls,
            chain_skip_cert_verify: params.chain_skip_cert_verify,
            chain_credentials: params.chain_credentials,
            mitm: params.mitm,
            initial_is_connect,
            initial_request: Some(params.request),
            response_filter: params.response_filter,
            client_address: params.client_address,
            client_tx,
            client_channel,
            ctx,
            state: ConnectionState::Disconnected,
            channel: None,
            events: None,
            resolved: None,
            current_request: params.original,
            current_response: None,
            request_recorded: false,
        };
        tokio::spawn(server.run(msg_rx));
        msg_tx
    }

    async fn run(mut self, mut msg_rx: mpsc::UnboundedReceiver<ServerMsg>) {
        'connect: loop {
            let _ = self.client_tx.send(ClientMsg::FlowStarted { id: self.id });
            let mut outcome = FlowOutcome::default();

            match self.run_flow(&mut outcome).await {
                Ok(()) => {
                    if !outcome.suppress_initial_request {
                        self.state = ConnectionState::AwaitingInitial;
                        if let Some(request) = self.initial_request.take() {
                            let record = !self.request_recorded;
                            self.request_recorded = true;
                            self.forward_request(request, record);
                        }
                    }
                    info!(
                        "[{}] Connected {} -> {}",
                        self.id, self.client_address, self.authority
                    );
                    let _ = self.client_tx.send(ClientMsg::FlowSucceeded { id: self.id });
                    break 'connect;
                }
                Err(error) => {
                    let last_state = outcome.last_state_before_failure.unwrap_or(self.state);
                    if let Some(channel) = self.channel.take() {
                        channel.close();
                    }
                    self.events = None;
                    self.state = ConnectionState::Disconnected;
                    let _ = self.client_tx.send(ClientMsg::FlowFailed {
                        id: self.id,
                        last_state,
                        error,
                    });

                    // The client side decides between direct fallback and 502
                    loop {
                        match msg_rx.recv().await {
                            Some(ServerMsg::RetryDirect) => {
                                debug!(
                                    "[{}] Retrying direct to {}",
                                    self.id, self.ultimate_authority
                                );
                                self.authority = self.ultimate_authority.clone();
                                self.chain_authority = None;
                                self.chain_tls = false;
                                self.chain_credentials = None;
                                self.resolved = None;
                                continue 'connect;
                            }
                            Some(ServerMsg::Disconnect) | None => return,
                            Some(_) => continue,
                        }
                    }
                }
            }
        }

        self.main_loop(msg_rx).await;
    }

    async fn main_loop(mut self, mut msg_rx: mpsc::UnboundedReceiver<ServerMsg>) {
        let Some(mut events) = self.events.take() else {
            return;
        };
        let mut peer_gone = false;

        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        None | Some(ChannelEvent::Inactive) => break,
                        Some(ChannelEvent::Active) => {}
                        Some(ChannelEvent::Read(object)) => {
                            self.ctx.recorder.bytes_received_from_server(
                                &self.flow_context(),
                                object.wire_size(),
                            );
                            self.dispatch(object).await;
                        }
                        Some(ChannelEvent::WritabilityChanged(writable)) => {
                            let msg = if writable {
                                ClientMsg::ServerWritable { id: self.id }
                            } else {
                                ClientMsg::ServerSaturated { id: self.id }
                            };
                            let _ = self.client_tx.send(msg);
                        }
                        Some(ChannelEvent::Idle) => {
                            info!("[{}] Server connection idle, disconnecting", self.authority);
                            self.disconnect();
                        }
                        Some(ChannelEvent::Exception(e)) => {
                            if e.is_closed_channel() {
                                warn!("[{}] Server channel closed: {}", self.authority, e);
                            } else {
                                error!("[{}] Server channel error: {}", self.authority, e);
                            }
                            self.disconnect();
                        }
                    }
                }

                msg = msg_rx.recv(), if !peer_gone => {
                    match msg {
                        None => {
                            peer_gone = true;
                            self.disconnect();
                        }
                        Some(ServerMsg::Disconnect) => self.disconnect(),
                        Some(ServerMsg::Request { request, original }) => {
                            self.current_request = original;
                            self.current_response = None;
                            self.forward_request(request, true);
                        }
                        Some(ServerMsg::Object(object)) => {
                            if let Some(channel) = &self.channel {
                                channel.send(object);
                            }
                        }
                        Some(ServerMsg::StopReading) => {
                            if let Some(channel) = &self.channel {
                                channel.set_auto_read(false);
                            }
                        }
                        Some(ServerMsg::ResumeReading) => {
                            if let Some(channel) = &self.channel {
                                channel.set_auto_read(true);
                            }
                        }
                        Some(ServerMsg::RetryDirect) => {}
                    }
                }
            }
        }

        self.state = ConnectionState::Disconnected;
        let _ = self.client_tx.send(ClientMsg::ServerDisconnected { id: self.id });
    }

    /***********************************************************************
     * Connection flow
     **********************************************************************/

    async fn run_flow(&mut self, outcome: &mut FlowOutcome) -> Result<()> {
        for step in FlowStep::ordered() {
            if !self.step_applies(step) {
                continue;
            }
            self.state = step.state();
            debug!("[{}] Flow step {:?}", self.authority, step);
            match self.execute_step(step).await {
                Ok(()) => {
                    if step.suppress_initial_request() {
                        outcome.suppress_initial_request = true;
                    }
                }
                Err(e) => {
                    outcome.last_state_before_failure = Some(self.state);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn step_applies(&self, step: FlowStep) -> bool {
        match step {
            FlowStep::ResolveAddress => self.resolved.is_none(),
            FlowStep::ConnectTransport => true,
            FlowStep::ChainedConnect => self.chain_authority.is_some() && self.initial_is_connect,
            FlowStep::UpstreamTls => self.chain_tls || (self.mitm && self.initial_is_connect),
            FlowStep::RespondConnectEstablished => self.initial_is_connect,
            FlowStep::StartTunneling => self.initial_is_connect,
        }
    }

    async fn execute_step(&mut self, step: FlowStep) -> Result<()> {
        match step {
            FlowStep::ResolveAddress => {
                let addr = self
                    .ctx
                    .resolver
                    .resolve(self.authority.host(), self.authority.port())
                    .await?;
                self.resolved = Some(addr);
                Ok(())
            }
            FlowStep::ConnectTransport => self.connect_transport().await,
            FlowStep::ChainedConnect => self.chained_connect().await,
            FlowStep::UpstreamTls => self.upstream_tls().await,
            FlowStep::RespondConnectEstablished => self.respond_connect_established().await,
            FlowStep::StartTunneling => {
                if let Some(channel) = &self.channel {
                    channel.start_tunneling();
                }
                Ok(())
            }
        }
    }

    async fn connect_transport(&mut self) -> Result<()> {
        if self.transport == Transport::Udp {
            return Err(Error::unsupported("UDP transport for HTTP upstreams"));
        }
        let addr = self
            .resolved
            .ok_or_else(|| Error::connect_failed("address not resolved"))?;

        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::timeout(format!("connect to {}", self.authority)))?
            .map_err(|e| Error::connect_failed(format!("{}: {}", self.authority, e)))?;
        configure_tcp_stream(&stream);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let channel = BufferedChannel::spawn(
            stream,
            CodecSide::Responses,
            self.ctx.idle_timeout(),
            events_tx,
        );
        self.channel = Some(channel);
        self.events = Some(events_rx);
        Ok(())
    }

    /// `CONNECT ultimate-authority HTTP/1.1` through the chained proxy;
    /// anything but a 2xx aborts the flow.
    async fn chained_connect(&mut self) -> Result<()> {
        let channel = self
            .channel
            .as_ref()
            .ok_or_else(|| Error::connect_failed("transport not connected"))?
            .clone();

        let mut request = RequestHead::new(
            "CONNECT",
            self.ultimate_authority.to_string(),
            Version::Http11,
        );
        request
            .headers
            .set("Host", self.ultimate_authority.to_string());
        request.headers.set("Proxy-Connection", "keep-alive");
        if let Some((user, pass)) = &self.chain_credentials {
            request
                .headers
                .set("Proxy-Authorization", basic_header(user, pass));
        }

        debug!(
            "[{}] Sending CONNECT {} to chained proxy",
            self.id, self.ultimate_authority
        );
        channel
            .write(HttpObject::Request(request))
            .await
            .map_err(|_| Error::connect_failed("channel closed during CONNECT"))??;

        let events = self
            .events
            .as_mut()
            .ok_or_else(|| Error::connect_failed("transport not connected"))?;

        let response = timeout(CONNECT_TIMEOUT, async {
            loop {
                match events.recv().await {
                    Some(ChannelEvent::Read(HttpObject::Response(head))) => return Ok(head),
                    Some(ChannelEvent::Inactive) | None => {
                        return Err(Error::connect_failed(
                            "chained proxy closed during CONNECT",
                        ))
                    }
                    Some(ChannelEvent::Exception(e)) => return Err(e),
                    Some(_) => continue,
                }
            }
        })
        .await??;

        if response.is_success() {
            debug!("[{}] Chained CONNECT handshake successful", self.id);
            Ok(())
        } else {
            Err(Error::ChainedConnectRefused(format!(
                "{} {}",
                response.status, response.reason
            )))
        }
    }

    async fn upstream_tls(&mut self) -> Result<()> {
        let channel = self
            .channel
            .as_ref()
            .ok_or_else(|| Error::tls("transport not connected"))?
            .clone();

        // For an encrypted chained leg the SNI names the chained proxy; for
        // MITM re-origination it names the origin.
        let (host, skip_verify) = if self.chain_tls {
            let host = self
                .chain_authority
                .as_ref()
                .map(|a| a.host().to_string())
                .unwrap_or_else(|| self.authority.host().to_string());
            (host, self.chain_skip_cert_verify)
        } else {
            (self.ultimate_authority.host().to_string(), false)
        };

        let connector = tls::client_connector(skip_verify);
        let server_name = tls::server_name(&host)?;
        channel
            .install_tls(TlsRole::Client {
                connector,
                server_name,
            })
            .await
            .map_err(|_| Error::tls("channel closed during handshake"))??;
        Ok(())
    }

    /// Executed on the client side: write `200 Connection established` and,
    /// for MITM, terminate TLS there with a spoofed leaf for the origin.
    async fn respond_connect_established(&mut self) -> Result<()> {
        let acceptor = if self.mitm {
            let ca = self
                .ctx
                .mitm
                .as_ref()
                .ok_or_else(|| Error::tls("MITM requested without a CA"))?;
            Some(ca.acceptor_for(self.ultimate_authority.host())?)
        } else {
            None
        };

        let (done_tx, done_rx) = oneshot::channel();
        self.client_tx
            .send(ClientMsg::RespondConnectEstablished {
                acceptor,
                done: done_tx,
            })
            .map_err(|_| Error::connect_failed("client side gone"))?;
        done_rx
            .await
            .map_err(|_| Error::connect_failed("client side gone"))?
    }

    /***********************************************************************
     * Writing
     **********************************************************************/

    fn forward_request(&mut self, request: RequestHead, record: bool) {
        if record {
            self.ctx
                .recorder
                .request_sent(&self.flow_context(), &request);
        }
        debug!("[{}] Writing request: {}", self.authority, request);
        if let Some(channel) = &self.channel {
            channel.send(HttpObject::Request(request));
        }
    }

    fn disconnect(&mut self) {
        self.state = ConnectionState::DisconnectRequested;
        if let Some(channel) = &self.channel {
            channel.close();
        }
    }

    fn flow_context(&self) -> FlowContext {
        FlowContext {
            client_address: self.client_address,
            transport: self.transport,
            server_authority: self.ultimate_authority.clone(),
            chain_authority: self.chain_authority.clone(),
        }
    }
}

#[async_trait]
impl PeerReader for ServerSide {
    fn state(&self) -> ConnectionState {
        self.state
    }

    fn set_state(&mut self, next: ConnectionState) {
        self.state = next;
    }

    fn label(&self) -> &'static str {
        "server"
    }

    async fn read_initial(&mut self, object: HttpObject) -> ConnectionState {
        let HttpObject::Response(mut head) = object else {
            warn!(
                "[{}] Expected a response head, got something else",
                self.authority
            );
            return self.state;
        };

        if let Some(filter) = &self.response_filter {
            filter.filter(&mut head);
        }
        self.ctx
            .recorder
            .response_received(&self.flow_context(), &head);

        let response = Arc::new(head);
        self.current_response = Some(response.clone());

        let object = HttpObject::Response((*response).clone());
        // A HEAD response never carries a body, whatever its headers claim
        let streamed = announces_body(&object) && !self.current_request.is_head();
        let _ = self.client_tx.send(ClientMsg::Respond {
            id: self.id,
            request: self.current_request.clone(),
            response,
            object,
        });

        if streamed {
            ConnectionState::AwaitingChunk
        } else {
            ConnectionState::AwaitingInitial
        }
    }

    async fn read_chunk(&mut self, object: HttpObject) {
        let Some(response) = self.current_response.clone() else {
            return;
        };
        let _ = self.client_tx.send(ClientMsg::Respond {
            id: self.id,
            request: self.current_request.clone(),
            response,
            object,
        });
    }

    async fn read_raw(&mut self, data: Bytes) {
        self.client_channel.send(HttpObject::Raw(data));
    }

    async fn protocol_error(&mut self, message: &str) {
        warn!("[{}] Protocol error from server: {}", self.authority, message);
        self.disconnect();
    }
}
