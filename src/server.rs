//! The upstream leg of a proxied exchange.
//!
//! A `ServerSide` runs on its own task and talks to the origin server or a
//! chained proxy. It first walks the connection flow (resolve, connect,
//! optional chained `CONNECT`, optional TLS), then serves: commands arrive
//! from the owning client task, decoded upstream frames stream back to it.
//! All coordination is message passing; neither side ever locks the other.

use std::sync::Arc;

use base64::Engine;
use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, trace, warn};

use crate::chain::TransportProtocol;
use crate::channel::{Channel, ChannelEvent};
use crate::error::ProxyError;
use crate::flow::{FlowPlan, FlowStep};
use crate::http1::{Frame, Headers, HttpMode, HttpRequest, HttpResponse, Version};
use crate::proxy::ProxyContext;
use crate::state::{advance, ConnectionState};
use crate::tracker::FlowContext;

/// What a client task can ask of its server side.
#[derive(Debug)]
pub enum ServerCommand {
    /// Forward a frame upstream. Buffered until the connection flow
    /// finishes.
    Write(Frame),
    /// Stop reading from the upstream socket (client leg saturated).
    Pause,
    /// Resume reading.
    Resume,
    /// The chained connect failed and policy allows going direct: re-run
    /// the flow against the ultimate authority on this same connection
    /// object.
    RetryDirect,
    /// Tear down now.
    Disconnect,
}

/// What a server side reports back to its client task.
#[derive(Debug)]
pub struct ServerEvent {
    pub server_id: u64,
    pub authority: String,
    pub kind: ServerEventKind,
}

#[derive(Debug)]
pub enum ServerEventKind {
    /// The connection flow completed; the leg is live.
    FlowSucceeded { suppressed_initial: bool },
    /// The connection flow aborted in `state`.
    FlowFailed {
        state: ConnectionState,
        error: ProxyError,
    },
    /// First head of a response stream.
    Response { head: HttpResponse, last: bool },
    /// Response body data; `last` closes the exchange.
    Chunk { data: Bytes, last: bool },
    /// Tunnel bytes.
    Raw(Bytes),
    /// The upstream channel crossed its high-water mark.
    Saturated,
    /// The upstream channel drained below its low-water mark.
    Writable,
    /// The leg is gone.
    Disconnected,
}

/// Everything fixed about an upstream leg at creation time.
#[derive(Debug, Clone)]
pub struct ServerSpawnArgs {
    pub server_id: u64,
    /// Dial target: the chained proxy when chaining, else the origin.
    pub authority: String,
    /// The origin the client ultimately wants.
    pub ultimate_authority: String,
    pub chain_authority: Option<String>,
    pub chain_tls: bool,
    pub chain_credentials: Option<(String, String)>,
    pub transport: TransportProtocol,
    pub is_connect: bool,
    pub mitm: bool,
    pub request_id: u64,
    pub client_address: std::net::SocketAddr,
}

/// Client-task-side view of a spawned server leg.
#[derive(Debug)]
pub struct ServerHandle {
    pub server_id: u64,
    pub authority: String,
    pub ultimate_authority: String,
    pub request_id: u64,
    pub connected: bool,
    pub writable: bool,
    /// Tunneled legs never serve another request.
    pub single_use: bool,
    commands: mpsc::UnboundedSender<ServerCommand>,
}

impl ServerHandle {
    pub fn send(&self, command: ServerCommand) {
        // A closed receiver means the task is already gone; nothing to do.
        let _ = self.commands.send(command);
    }

    /// Dropping the sender makes the task tear itself down, but an explicit
    /// disconnect flushes first.
    pub fn disconnect(&self) {
        self.send(ServerCommand::Disconnect);
    }
}

pub struct ServerSide {
    ctx: Arc<ProxyContext>,
    args: ServerSpawnArgs,
    state: ConnectionState,
    channel: Option<Channel>,
    events: mpsc::UnboundedSender<ServerEvent>,
    commands: mpsc::UnboundedReceiver<ServerCommand>,
    suppress_initial: bool,
    /// Writes stashed while a failed flow waits on the retry decision.
    stashed: Vec<Frame>,
    writable: bool,
    flow_context: FlowContext,
}

impl ServerSide {
    /// Spawn the upstream task and hand back its handle.
    pub fn spawn(
        ctx: Arc<ProxyContext>,
        args: ServerSpawnArgs,
        events: mpsc::UnboundedSender<ServerEvent>,
    ) -> ServerHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let handle = ServerHandle {
            server_id: args.server_id,
            authority: args.authority.clone(),
            ultimate_authority: args.ultimate_authority.clone(),
            request_id: args.request_id,
            connected: false,
            writable: true,
            single_use: args.is_connect && !args.mitm,
            commands: cmd_tx,
        };
        let flow_context = FlowContext {
            client_address: args.client_address,
            transport: args.transport,
            server_authority: Some(args.ultimate_authority.clone()),
            chain_authority: args.chain_authority.clone(),
        };
        let side = ServerSide {
            ctx,
            args,
            state: ConnectionState::Disconnected,
            channel: None,
            events,
            commands: cmd_rx,
            suppress_initial: false,
            stashed: Vec::new(),
            writable: true,
            flow_context,
        };
        tokio::spawn(side.run());
        handle
    }

    fn send(&self, kind: ServerEventKind) -> bool {
        self.events
            .send(ServerEvent {
                server_id: self.args.server_id,
                authority: self.args.authority.clone(),
                kind,
            })
            .is_ok()
    }

    async fn run(mut self) {
        loop {
            match self.connect().await {
                Ok(suppressed) => {
                    self.suppress_initial = suppressed;
                    break;
                }
                Err(error) => {
                    let failed_state = self.state;
                    advance(
                        &mut self.state,
                        ConnectionState::Disconnected,
                        &self.args.authority,
                    );
                    self.channel = None;
                    debug!(
                        authority = %self.args.authority,
                        state = %failed_state,
                        "connection flow failed: {error}"
                    );
                    if !self.send(ServerEventKind::FlowFailed {
                        state: failed_state,
                        error,
                    }) {
                        return;
                    }
                    if !self.await_retry().await {
                        return;
                    }
                    // Chaining dropped; dial the origin directly.
                    self.args.chain_authority = None;
                    self.args.chain_tls = false;
                    self.args.chain_credentials = None;
                    self.args.authority = self.args.ultimate_authority.clone();
                    self.flow_context.chain_authority = None;
                }
            }
        }

        if !self.send(ServerEventKind::FlowSucceeded {
            suppressed_initial: self.suppress_initial,
        }) {
            return;
        }
        self.serve().await;
        advance(
            &mut self.state,
            ConnectionState::Disconnected,
            &self.args.authority,
        );
        self.send(ServerEventKind::Disconnected);
    }

    /// After a flow failure: buffer writes and wait for the client's
    /// verdict. True means retry directly.
    async fn await_retry(&mut self) -> bool {
        loop {
            match self.commands.recv().await {
                Some(ServerCommand::Write(frame)) => self.stashed.push(frame),
                Some(ServerCommand::RetryDirect) => return true,
                Some(ServerCommand::Pause) | Some(ServerCommand::Resume) => {}
                Some(ServerCommand::Disconnect) | None => return false,
            }
        }
    }

    fn plan(&self) -> FlowPlan {
        FlowPlan {
            chained: self.args.chain_authority.is_some(),
            chain_tls: self.args.chain_tls,
            is_connect: self.args.is_connect,
            mitm: self.args.mitm,
        }
    }

    /// Walk the connection flow. Returns whether an executed step already
    /// satisfied the initial request.
    async fn connect(&mut self) -> Result<bool, ProxyError> {
        let plan = self.plan();
        let mut suppressed = false;
        let mut addr = None;
        for step in FlowStep::ALL {
            if !step.applies(&plan) {
                continue;
            }
            if let Some(entering) = step.entering_state() {
                advance(&mut self.state, entering, &self.args.authority);
            }
            match step {
                FlowStep::Resolve => addr = Some(self.resolve().await?),
                FlowStep::ConnectTransport => {
                    let addr = addr.expect("resolve precedes connect");
                    self.connect_transport(addr).await?;
                }
                FlowStep::ChainTls => self.chain_tls().await?,
                FlowStep::ChainedConnect => self.chained_connect().await?,
                FlowStep::OriginTls => self.origin_tls().await?,
                FlowStep::EstablishTunnel => {
                    self.channel_mut().start_tunneling();
                }
            }
            if step.suppresses_initial_request() {
                suppressed = true;
            }
        }
        let live_state = if self.channel_mut().is_tunneling() {
            ConnectionState::Tunneling
        } else {
            ConnectionState::AwaitingInitial
        };
        advance(&mut self.state, live_state, &self.args.authority);
        Ok(suppressed)
    }

    fn channel_mut(&mut self) -> &mut Channel {
        self.channel
            .as_mut()
            .expect("channel exists after transport connect")
    }

    async fn resolve(&mut self) -> Result<std::net::SocketAddr, ProxyError> {
        let default_port = if self.args.is_connect { 443 } else { 80 };
        let (host, port) = crate::http1::split_authority(&self.args.authority, default_port);
        self.ctx
            .resolver
            .resolve(&host, port, self.ctx.use_dnssec)
            .await
            .map_err(|e| {
                debug!("resolving {host} failed: {e}");
                ProxyError::UnknownHost(host.clone())
            })
    }

    async fn connect_transport(&mut self, addr: std::net::SocketAddr) -> Result<(), ProxyError> {
        if self.args.transport == TransportProtocol::Udp {
            return Err(ProxyError::ConnectFailed {
                authority: self.args.authority.clone(),
                reason: "UDP transport not supported".into(),
            });
        }
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ProxyError::ConnectFailed {
                authority: self.args.authority.clone(),
                reason: e.to_string(),
            })?;
        let _ = stream.set_nodelay(true);
        self.channel = Some(Channel::new(
            stream,
            HttpMode::Response,
            self.ctx.idle_timeout,
        ));
        trace!(authority = %self.args.authority, "transport connected");
        Ok(())
    }

    async fn chain_tls(&mut self) -> Result<(), ProxyError> {
        let config = self
            .ctx
            .chain
            .as_ref()
            .and_then(|c| c.tls_context())
            .unwrap_or_else(|| self.ctx.upstream_tls.clone());
        let authority = self.args.authority.clone();
        self.handshake(config, &authority).await
    }

    async fn origin_tls(&mut self) -> Result<(), ProxyError> {
        let config = self.ctx.upstream_tls.clone();
        let authority = self.args.ultimate_authority.clone();
        self.handshake(config, &authority).await
    }

    async fn handshake(
        &mut self,
        config: Arc<rustls::ClientConfig>,
        authority: &str,
    ) -> Result<(), ProxyError> {
        let (host, _) = crate::http1::split_authority(authority, 443);
        let server_name = rustls::pki_types::ServerName::try_from(host.clone()).map_err(|_| {
            ProxyError::TlsHandshakeFailed {
                authority: authority.to_string(),
                reason: format!("invalid server name {host:?}"),
            }
        })?;
        let connector = TlsConnector::from(config);
        self.channel_mut()
            .connect_tls(&connector, server_name)
            .await
            .map_err(|e| ProxyError::TlsHandshakeFailed {
                authority: authority.to_string(),
                reason: e.to_string(),
            })
    }

    /// `CONNECT <ultimate_authority>` through the chained proxy and wait
    /// for its verdict.
    async fn chained_connect(&mut self) -> Result<(), ProxyError> {
        let mut headers = Headers::new();
        headers.push("Host", self.args.ultimate_authority.clone());
        if let Some((user, pass)) = &self.args.chain_credentials {
            let token =
                base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
            headers.push("Proxy-Authorization", format!("Basic {token}"));
        }
        let connect = HttpRequest {
            method: "CONNECT".into(),
            uri: self.args.ultimate_authority.clone(),
            version: Version::Http11,
            headers,
        };
        let chain = self.args.authority.clone();
        let target = self.args.ultimate_authority.clone();
        let channel = self.channel_mut();
        channel.expect_headless_response();
        channel.write(&Frame::Request {
            head: connect,
            last: true,
        });
        channel.flush().await?;

        loop {
            match channel.next_event().await? {
                ChannelEvent::Read(Frame::Response { head, .. }) => {
                    if (200..300).contains(&head.status) {
                        trace!(chain = %chain, target = %target, "chained CONNECT accepted");
                        return Ok(());
                    }
                    return Err(ProxyError::ChainedConnectRefused(head.status));
                }
                ChannelEvent::Read(_) => {
                    return Err(ProxyError::MalformedMessage(
                        "unexpected frame while negotiating CONNECT".into(),
                    ))
                }
                ChannelEvent::Inactive => return Err(ProxyError::PeerReset),
                ChannelEvent::Idle => return Err(ProxyError::Idle),
                ChannelEvent::WritabilityChanged(_) => {}
            }
        }
    }

    /// Steady state: relay commands out, frames back, until either side
    /// goes away.
    async fn serve(&mut self) {
        enum Step {
            Command(Option<ServerCommand>),
            Event(Result<ChannelEvent, ProxyError>),
        }

        let stashed = std::mem::take(&mut self.stashed);
        for frame in stashed {
            if !self.write_upstream(frame) {
                return;
            }
        }

        loop {
            let step = {
                let channel = self
                    .channel
                    .as_mut()
                    .expect("serve runs on a connected channel");
                tokio::select! {
                    command = self.commands.recv() => Step::Command(command),
                    event = channel.next_event() => Step::Event(event),
                }
            };
            let read_bytes = self.channel_mut().take_read_bytes();
            self.ctx
                .recorder
                .bytes_received_from_server(&self.flow_context, read_bytes);

            match step {
                Step::Command(Some(ServerCommand::Write(frame))) => {
                    if !self.write_upstream(frame) {
                        return;
                    }
                }
                Step::Command(Some(ServerCommand::Pause)) => {
                    self.channel_mut().set_auto_read(false)
                }
                Step::Command(Some(ServerCommand::Resume)) => {
                    self.channel_mut().set_auto_read(true)
                }
                Step::Command(Some(ServerCommand::RetryDirect)) => {
                    warn!(authority = %self.args.authority, "retry on a live connection ignored");
                }
                Step::Command(Some(ServerCommand::Disconnect)) | Step::Command(None) => {
                    let _ = self.channel_mut().shutdown().await;
                    return;
                }
                Step::Event(Ok(event)) => {
                    if !self.handle_channel_event(event) {
                        return;
                    }
                }
                Step::Event(Err(error)) => {
                    if error.is_peer_reset() {
                        warn!(authority = %self.args.authority, "upstream reset: {error}");
                    } else {
                        error!(authority = %self.args.authority, "upstream error: {error}");
                    }
                    return;
                }
            }
        }
    }

    /// Returns false when the task should stop.
    fn handle_channel_event(&mut self, event: ChannelEvent) -> bool {
        match event {
            ChannelEvent::Read(Frame::Response { head, last }) => {
                self.ctx
                    .recorder
                    .response_received(&self.flow_context, &head);
                advance(
                    &mut self.state,
                    if last {
                        ConnectionState::AwaitingInitial
                    } else {
                        ConnectionState::AwaitingChunk
                    },
                    &self.args.authority,
                );
                self.send(ServerEventKind::Response { head, last })
            }
            ChannelEvent::Read(Frame::Chunk { data, last }) => {
                if last {
                    advance(
                        &mut self.state,
                        ConnectionState::AwaitingInitial,
                        &self.args.authority,
                    );
                }
                self.send(ServerEventKind::Chunk { data, last })
            }
            ChannelEvent::Read(Frame::Raw(data)) => self.send(ServerEventKind::Raw(data)),
            ChannelEvent::Read(Frame::Request { .. }) => {
                warn!(authority = %self.args.authority, "request frame from upstream; dropping");
                true
            }
            ChannelEvent::WritabilityChanged(writable) => {
                if writable && !self.writable {
                    self.writable = true;
                    self.send(ServerEventKind::Writable)
                } else {
                    true
                }
            }
            ChannelEvent::Idle => {
                debug!(authority = %self.args.authority, "idle timeout on upstream leg");
                false
            }
            ChannelEvent::Inactive => false,
        }
    }

    fn write_upstream(&mut self, frame: Frame) -> bool {
        if self.suppress_initial {
            if let Frame::Request { .. } = frame {
                // The flow already satisfied this request (CONNECT).
                self.suppress_initial = false;
                return true;
            }
        }
        if let Frame::Request { head, .. } = &frame {
            if head.method.eq_ignore_ascii_case("HEAD") {
                self.channel_mut().expect_headless_response();
            }
        }
        let now_writable = self.channel_mut().write(&frame);
        if !now_writable && self.writable {
            self.writable = false;
            return self.send(ServerEventKind::Saturated);
        }
        true
    }
}
