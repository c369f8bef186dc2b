//! The client leg of the proxy.
//!
//! One `ClientSide` task per accepted connection. It parses requests,
//! decides routing (direct or chained), finds or creates the upstream leg,
//! rewrites headers, and streams responses back. Upstream legs for distinct
//! authorities are kept in a reuse map so keep-alive clients fan out over
//! live connections instead of redialing.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, trace, warn};

use crate::auth::parse_basic_credentials;
use crate::chain::TransportProtocol;
use crate::channel::{Channel, ChannelEvent};
use crate::http1::{
    add_via, http_date, is_chunked, parse_host_and_port, rename_proxy_connection,
    scrub_connection_tokens, scrub_hop_by_hop, split_authority, strip_host, strip_sdch,
    wants_keep_alive, Frame, HttpMode, HttpRequest, HttpResponse, Version,
};
use crate::proxy::ProxyContext;
use crate::server::{
    ServerCommand, ServerEvent, ServerEventKind, ServerHandle, ServerSide, ServerSpawnArgs,
};
use crate::state::{advance, ConnectionState};
use crate::tracker::FlowContext;

const AUTH_REQUIRED_BODY: &str = "<!DOCTYPE HTML \"-//IETF//DTD HTML 2.0//EN\">\n\
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

/// The in-flight exchange: the request as the client sent it, plus the
/// routing that was chosen for it. Lives until the matching response has
/// fully flushed and the close decision is made.
#[derive(Debug)]
struct RequestContext {
    id: u64,
    original: HttpRequest,
    ultimate_authority: String,
    chain_authority: Option<String>,
    is_connect: bool,
    mitm: bool,
    request_keep_alive: bool,
    response_keep_alive: bool,
    response_started: bool,
}

/// Why client-side reading is currently off. Reading happens only when no
/// reason applies; every change funnels through [`ClientSide::apply_read_gate`].
#[derive(Debug, Default)]
struct ReadGate {
    /// An upstream connection flow is in progress.
    flow: bool,
    /// A fully-forwarded request is still awaiting its response
    /// (pipelining is intentionally serialized).
    awaiting_response: bool,
    /// Some upstream leg is saturated.
    saturated: bool,
}

impl ReadGate {
    fn open(&self) -> bool {
        !(self.flow || self.awaiting_response || self.saturated)
    }
}

pub struct ClientSide {
    ctx: Arc<ProxyContext>,
    channel: Channel,
    state: ConnectionState,
    client_address: SocketAddr,
    servers: HashMap<u64, ServerHandle>,
    /// Reuse index: dial authority -> server id.
    by_authority: HashMap<String, u64>,
    current: Option<u64>,
    events_tx: mpsc::UnboundedSender<ServerEvent>,
    events_rx: mpsc::UnboundedReceiver<ServerEvent>,
    inflight: Option<RequestContext>,
    /// Drain and drop the remaining request body (filter short-circuit).
    discard_body: bool,
    /// Decrypted interception is active: route everything over `current`.
    mitm_active: bool,
    read_gate: ReadGate,
    client_writable: bool,
    next_server_id: u64,
    next_request_id: u64,
    chaining_disabled: std::collections::HashSet<u64>,
    connecting: AtomicUsize,
    connected: AtomicUsize,
    reused: AtomicUsize,
}

impl ClientSide {
    /// Serve one accepted client connection to completion.
    pub async fn run(ctx: Arc<ProxyContext>, stream: TcpStream, client_address: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let channel = Channel::new(stream, HttpMode::Request, ctx.idle_timeout);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut client = ClientSide {
            ctx,
            channel,
            state: ConnectionState::AwaitingInitial,
            client_address,
            servers: HashMap::new(),
            by_authority: HashMap::new(),
            current: None,
            events_tx,
            events_rx,
            inflight: None,
            discard_body: false,
            mitm_active: false,
            read_gate: ReadGate::default(),
            client_writable: true,
            next_server_id: 0,
            next_request_id: 0,
            chaining_disabled: std::collections::HashSet::new(),
            connecting: AtomicUsize::new(0),
            connected: AtomicUsize::new(0),
            reused: AtomicUsize::new(0),
        };
        client.event_loop().await;
        client.teardown().await;
    }

    async fn event_loop(&mut self) {
        loop {
            tokio::select! {
                event = self.channel.next_event() => {
                    let read_bytes = self.channel.take_read_bytes();
                    self.ctx
                        .recorder
                        .bytes_received_from_client(&self.flow_context(), read_bytes);
                    match event {
                        Ok(event) => {
                            if !self.handle_channel_event(event).await {
                                return;
                            }
                        }
                        Err(error) => {
                            if error.is_peer_reset() {
                                debug!(client = %self.client_address, "client reset: {error}");
                            } else {
                                warn!(client = %self.client_address, "client error: {error}");
                            }
                            return;
                        }
                    }
                }
                event = self.events_rx.recv() => {
                    // We hold a sender ourselves, so this never yields None.
                    if let Some(event) = event {
                        if !self.handle_server_event(event).await {
                            return;
                        }
                    }
                }
            }
        }
    }

    fn flow_context(&self) -> FlowContext {
        let mut context = FlowContext::new(self.client_address);
        if let Some(request) = &self.inflight {
            context.server_authority = Some(request.ultimate_authority.clone());
            context.chain_authority = request.chain_authority.clone();
        }
        context
    }

    // -----------------------------------------------------------------
    // Client channel events

    async fn handle_channel_event(&mut self, event: ChannelEvent) -> bool {
        match event {
            ChannelEvent::Read(frame) => self.dispatch_frame(frame).await,
            ChannelEvent::WritabilityChanged(true) => {
                if !self.client_writable {
                    self.client_writable = true;
                    // Client drained: every upstream leg may read again.
                    self.broadcast(|| ServerCommand::Resume);
                }
                true
            }
            ChannelEvent::WritabilityChanged(false) => {
                self.note_client_saturated();
                true
            }
            ChannelEvent::Idle => {
                debug!(client = %self.client_address, "client idle timeout");
                false
            }
            ChannelEvent::Inactive => false,
        }
    }

    /// The §4.2 dispatch table: what an inbound frame means depends only on
    /// the current state.
    async fn dispatch_frame(&mut self, frame: Frame) -> bool {
        match self.state {
            ConnectionState::AwaitingInitial => match frame {
                Frame::Request { head, last } => self.read_initial(head, last).await,
                other => {
                    warn!(client = %self.client_address, "unparseable frame in AWAITING_INITIAL: {other:?}");
                    false
                }
            },
            ConnectionState::AwaitingProxyAuthentication => match frame {
                Frame::Request { head, last } => self.read_initial(head, last).await,
                _ => {
                    trace!("discarding frame while awaiting proxy authentication");
                    true
                }
            },
            ConnectionState::AwaitingChunk => match frame {
                Frame::Chunk { data, last } => {
                    if !self.discard_body {
                        self.forward_to_current(Frame::Chunk { data, last });
                    }
                    if last {
                        advance(&mut self.state, ConnectionState::AwaitingInitial, "client");
                        self.discard_body = false;
                        if self.inflight.is_some() {
                            self.read_gate.awaiting_response = true;
                        }
                        self.apply_read_gate();
                    }
                    true
                }
                other => {
                    warn!(client = %self.client_address, "expected body chunk, got {other:?}");
                    false
                }
            },
            ConnectionState::Tunneling => match frame {
                Frame::Raw(data) => {
                    self.forward_to_current(Frame::Raw(data));
                    true
                }
                other => {
                    warn!(client = %self.client_address, "non-raw frame while tunneling: {other:?}");
                    false
                }
            },
            ConnectionState::Connecting
            | ConnectionState::Handshaking
            | ConnectionState::NegotiatingConnect => {
                debug!(state = %self.state, "dropping inbound frame during connection setup");
                true
            }
            ConnectionState::DisconnectRequested | ConnectionState::Disconnected => true,
        }
    }

    /// A fresh request head. Authentication, routing, rewriting, dispatch.
    async fn read_initial(&mut self, mut head: HttpRequest, last: bool) -> bool {
        advance(&mut self.state, ConnectionState::AwaitingInitial, "client");

        // Interception skips the proxy-level gates: the client authenticated
        // at CONNECT time and everything routes over the intercepted leg.
        if !self.mitm_active {
            if let Some(authenticator) = self.ctx.authenticator.clone() {
                let authorized = head
                    .headers
                    .get("proxy-authorization")
                    .and_then(parse_basic_credentials)
                    .map(|(user, pass)| authenticator.authenticate(&user, &pass))
                    .unwrap_or(false);
                if !authorized {
                    return self.write_auth_required(authenticator.realm()).await;
                }
            }
        }

        let ultimate_authority = parse_host_and_port(&head);
        if ultimate_authority.is_empty() {
            warn!(client = %self.client_address, "request without authority: {} {}", head.method, head.uri);
            return self.write_bad_gateway(&head.uri).await;
        }

        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let is_connect = head.is_connect();
        let mitm = is_connect && self.ctx.mitm.is_some();
        let (chain_authority, chain_tls, chain_credentials, transport) = if self.mitm_active {
            (None, false, None, TransportProtocol::Tcp)
        } else {
            match &self.ctx.chain {
                Some(manager) => (
                    manager.host_and_port(&head),
                    manager.requires_encryption(&head),
                    manager.credentials(),
                    manager.transport_protocol(),
                ),
                None => (None, false, None, TransportProtocol::Tcp),
            }
        };

        let original = head.clone();
        let request_keep_alive = client_keep_alive(&original);

        let context = RequestContext {
            id: request_id,
            original,
            ultimate_authority: ultimate_authority.clone(),
            chain_authority: chain_authority.clone(),
            is_connect,
            mitm,
            request_keep_alive,
            response_keep_alive: false,
            response_started: false,
        };
        self.inflight = Some(context);

        self.ctx
            .recorder
            .request_received_from_client(&self.flow_context(), &head);

        if !self.ctx.transparent && !is_connect {
            rewrite_request(&mut head, chain_authority.is_none(), &self.ctx.via_alias);
        }

        if !is_connect {
            if let Some(filter) = self.ctx.request_filter.clone() {
                if let Some((response, body)) = filter.filter(&mut head) {
                    debug!(authority = %ultimate_authority, "request answered by filter");
                    if !last {
                        // The request body still has to drain off the wire.
                        self.discard_body = true;
                        advance(&mut self.state, ConnectionState::AwaitingChunk, "client");
                    }
                    return self.respond_directly(response, body).await;
                }
            }
        }

        if self.mitm_active {
            // Everything in the decrypted stream rides the intercepted leg.
            self.dispatch_request(head, last, is_connect);
            return true;
        }

        let dial_authority = chain_authority
            .clone()
            .unwrap_or_else(|| ultimate_authority.clone());

        let reusable = (!is_connect)
            .then(|| self.by_authority.get(&dial_authority))
            .flatten()
            .and_then(|id| self.servers.get(id))
            .filter(|handle| handle.connected && !handle.single_use)
            .map(|handle| handle.server_id);

        match reusable {
            Some(server_id) => {
                trace!(authority = %dial_authority, "reusing upstream leg");
                self.reused.fetch_add(1, Ordering::Relaxed);
                self.current = Some(server_id);
            }
            None => {
                let server_id = self.next_server_id;
                self.next_server_id += 1;
                let args = ServerSpawnArgs {
                    server_id,
                    authority: dial_authority.clone(),
                    ultimate_authority: ultimate_authority.clone(),
                    chain_authority,
                    chain_tls,
                    chain_credentials,
                    transport,
                    is_connect,
                    mitm,
                    request_id,
                    client_address: self.client_address,
                };
                let handle = ServerSide::spawn(self.ctx.clone(), args, self.events_tx.clone());
                if let Some(evicted_id) = self.by_authority.insert(dial_authority, server_id) {
                    // A CONNECT forces a fresh leg even when a reusable one
                    // exists; the old one finishes out of the index.
                    if let Some(old) = self.servers.get(&evicted_id) {
                        old.disconnect();
                    }
                }
                self.servers.insert(server_id, handle);
                self.current = Some(server_id);
                self.server_flow_started();
            }
        }

        self.dispatch_request(head, last, is_connect);
        true
    }

    fn dispatch_request(&mut self, head: HttpRequest, last: bool, is_connect: bool) {
        if !is_connect {
            self.ctx.recorder.request_sent(&self.flow_context(), &head);
        }
        self.forward_to_current(Frame::Request { head, last });

        let next = if is_connect {
            ConnectionState::NegotiatingConnect
        } else if last {
            self.read_gate.awaiting_response = true;
            ConnectionState::AwaitingInitial
        } else {
            ConnectionState::AwaitingChunk
        };
        advance(&mut self.state, next, "client");
        self.apply_read_gate();
    }

    fn forward_to_current(&mut self, frame: Frame) {
        let Some(id) = self.current else {
            warn!(client = %self.client_address, "no upstream leg for frame");
            return;
        };
        if let Some(handle) = self.servers.get(&id) {
            handle.send(ServerCommand::Write(frame));
        }
    }

    // -----------------------------------------------------------------
    // Upstream leg events

    async fn handle_server_event(&mut self, event: ServerEvent) -> bool {
        match event.kind {
            ServerEventKind::FlowSucceeded { suppressed_initial } => {
                self.server_flow_succeeded(event.server_id, suppressed_initial)
                    .await
            }
            ServerEventKind::FlowFailed { state, error } => {
                self.server_flow_failed(event.server_id, state, error).await
            }
            ServerEventKind::Response { head, last } => self.respond(head, last).await,
            ServerEventKind::Chunk { data, last } => {
                self.write_client(&Frame::Chunk { data, last });
                if last {
                    return self.finish_response().await;
                }
                true
            }
            ServerEventKind::Raw(data) => {
                self.write_client(&Frame::Raw(data));
                true
            }
            ServerEventKind::Saturated => {
                if let Some(handle) = self.servers.get_mut(&event.server_id) {
                    handle.writable = false;
                }
                self.read_gate.saturated = true;
                self.apply_read_gate();
                true
            }
            ServerEventKind::Writable => {
                if let Some(handle) = self.servers.get_mut(&event.server_id) {
                    handle.writable = true;
                }
                if self.servers.values().all(|h| h.writable) {
                    self.read_gate.saturated = false;
                    self.apply_read_gate();
                }
                true
            }
            ServerEventKind::Disconnected => self.server_disconnected(event.server_id).await,
        }
    }

    async fn server_flow_succeeded(&mut self, server_id: u64, suppressed_initial: bool) -> bool {
        if let Some(handle) = self.servers.get_mut(&server_id) {
            handle.connected = true;
        }
        self.connecting.fetch_sub(1, Ordering::Relaxed);
        self.connected.fetch_add(1, Ordering::Relaxed);
        if self.connecting.load(Ordering::Relaxed) == 0 {
            self.read_gate.flow = false;
        }

        let connect_pending = self
            .inflight
            .as_ref()
            .map(|r| r.is_connect && self.current == Some(server_id))
            .unwrap_or(false);

        if connect_pending {
            let request = self.inflight.take().expect("checked above");
            if !self.write_connection_established().await {
                return false;
            }
            if request.mitm {
                if !self.start_mitm(&request.ultimate_authority).await {
                    return false;
                }
                advance(&mut self.state, ConnectionState::AwaitingInitial, "client");
            } else {
                self.channel.start_tunneling();
                advance(&mut self.state, ConnectionState::Tunneling, "client");
            }
        } else if !suppressed_initial
            && self.state != ConnectionState::AwaitingChunk
            && self.state != ConnectionState::NegotiatingConnect
        {
            advance(&mut self.state, ConnectionState::AwaitingInitial, "client");
        }
        self.apply_read_gate();
        true
    }

    async fn server_flow_failed(
        &mut self,
        server_id: u64,
        failed_state: ConnectionState,
        error: crate::error::ProxyError,
    ) -> bool {
        self.connecting.fetch_sub(1, Ordering::Relaxed);

        let fallback = self
            .inflight
            .as_ref()
            .map(|request| {
                request.chain_authority.is_some()
                    && !self.chaining_disabled.contains(&request.id)
                    && self
                        .ctx
                        .chain
                        .as_ref()
                        .map(|m| m.allow_fallback_to_unchained_connection(&request.original))
                        .unwrap_or(false)
            })
            .unwrap_or(false);

        if fallback {
            let request = self.inflight.as_mut().expect("checked above");
            warn!(
                chain = ?request.chain_authority,
                target = %request.ultimate_authority,
                "chained connection failed in {failed_state} ({error}); falling back to direct"
            );
            self.chaining_disabled.insert(request.id);
            let old_key = request.chain_authority.take().expect("chained");
            let new_key = request.ultimate_authority.clone();
            if self.by_authority.get(&old_key) == Some(&server_id) {
                self.by_authority.remove(&old_key);
            }
            self.by_authority.insert(new_key.clone(), server_id);
            if let Some(handle) = self.servers.get_mut(&server_id) {
                handle.authority = new_key;
                handle.send(ServerCommand::RetryDirect);
            }
            self.connecting.fetch_add(1, Ordering::Relaxed);
            self.read_gate.flow = true;
            self.apply_read_gate();
            return true;
        }

        warn!(
            client = %self.client_address,
            "upstream connection failed in {failed_state}: {error}"
        );
        self.remove_server(server_id);
        if self.connecting.load(Ordering::Relaxed) == 0 {
            self.read_gate.flow = false;
            self.apply_read_gate();
        }
        let uri = self
            .inflight
            .take()
            .map(|r| r.original.uri)
            .unwrap_or_default();
        self.write_bad_gateway(&uri).await
    }

    /// Stream one response object back to the client, rewriting the head.
    async fn respond(&mut self, mut head: HttpResponse, last: bool) -> bool {
        let Some(request) = self.inflight.as_mut() else {
            debug!("dropping response with no request in flight");
            return true;
        };
        request.response_started = true;
        request.response_keep_alive = wants_keep_alive(head.version, &head.headers);
        let authority = request.ultimate_authority.clone();

        if !self.ctx.transparent {
            rewrite_response(&mut head, &self.ctx.via_alias);
        }
        if let Some(filters) = &self.ctx.response_filters {
            if let Some(filter) = filters.filter_for(&authority) {
                filter.filter(&mut head);
            }
        }

        self.write_client(&Frame::Response { head, last });
        if last {
            return self.finish_response().await;
        }
        true
    }

    /// The response has fully streamed: flush, then decide what survives.
    async fn finish_response(&mut self) -> bool {
        // A zero-length write after the last chunk would be the classic
        // trick for a flush-completion future; with an owned buffer the
        // explicit flush is that future.
        if self.channel.flush().await.is_err() {
            return false;
        }
        if !self.client_writable {
            self.client_writable = true;
            self.broadcast(|| ServerCommand::Resume);
        }

        let Some(request) = self.inflight.take() else {
            return true;
        };

        let keep_server = request.request_keep_alive && request.response_keep_alive;
        if !keep_server {
            if let Some(id) = self.current {
                if let Some(handle) = self.remove_server(id) {
                    handle.disconnect();
                }
            }
        }

        if !request.request_keep_alive {
            debug!(client = %self.client_address, "closing client after non-keep-alive exchange");
            return false;
        }

        if !self.mitm_active {
            self.current = None;
        }
        self.read_gate.awaiting_response = false;
        self.apply_read_gate();
        true
    }

    async fn server_disconnected(&mut self, server_id: u64) -> bool {
        let removed = self.remove_server(server_id);
        if removed.is_none() {
            // Already evicted deliberately; nothing further to decide.
            return true;
        }
        debug!(client = %self.client_address, "upstream leg {server_id} disconnected");

        if self.current == Some(server_id) {
            if let Some(request) = &self.inflight {
                if request.response_started {
                    // Truncated response: nothing useful can follow.
                    return false;
                }
            }
            if self.state == ConnectionState::Tunneling {
                return false;
            }
            self.current = None;
        }

        // Last upstream leg gone: retire the client connection too.
        !self.servers.is_empty()
    }

    fn remove_server(&mut self, server_id: u64) -> Option<ServerHandle> {
        let handle = self.servers.remove(&server_id)?;
        if handle.connected {
            self.connected.fetch_sub(1, Ordering::Relaxed);
        }
        if self.by_authority.get(&handle.authority) == Some(&server_id) {
            self.by_authority.remove(&handle.authority);
        }
        Some(handle)
    }

    // -----------------------------------------------------------------
    // Coordination helpers

    fn server_flow_started(&mut self) {
        self.connecting.fetch_add(1, Ordering::Relaxed);
        self.read_gate.flow = true;
        self.apply_read_gate();
    }

    fn apply_read_gate(&mut self) {
        self.channel.set_auto_read(self.read_gate.open());
    }

    fn note_client_saturated(&mut self) {
        if self.client_writable {
            self.client_writable = false;
            // Client buffer over the mark: stop every upstream read.
            self.broadcast(|| ServerCommand::Pause);
        }
    }

    fn broadcast(&self, command: impl Fn() -> ServerCommand) {
        for handle in self.servers.values() {
            handle.send(command());
        }
    }

    /// Write to the client channel, reacting to saturation immediately.
    fn write_client(&mut self, frame: &Frame) {
        let writable = self.channel.write(frame);
        if !writable {
            self.note_client_saturated();
        }
    }

    // -----------------------------------------------------------------
    // Synthesized responses

    async fn write_auth_required(&mut self, realm: &str) -> bool {
        let mut response = HttpResponse::new(407, "Proxy Authentication Required");
        response
            .headers
            .push("Proxy-Authenticate", format!("Basic realm=\"{realm}\""));
        response.headers.push("Date", http_date());
        response
            .headers
            .push("Content-Type", "text/html; charset=UTF-8");
        response
            .headers
            .push("Content-Length", AUTH_REQUIRED_BODY.len().to_string());
        self.write_client(&Frame::Response {
            head: response,
            last: false,
        });
        self.write_client(&Frame::Chunk {
            data: AUTH_REQUIRED_BODY.into(),
            last: true,
        });
        if self.channel.flush().await.is_err() {
            return false;
        }
        self.inflight = None;
        advance(
            &mut self.state,
            ConnectionState::AwaitingProxyAuthentication,
            "client",
        );
        true
    }

    /// `502 Bad Gateway` always closes the client once flushed.
    async fn write_bad_gateway(&mut self, uri: &str) -> bool {
        let body = format!("Bad Gateway: {uri}");
        let mut response = HttpResponse::new(502, "Bad Gateway");
        response.headers.push("Date", http_date());
        response
            .headers
            .push("Content-Type", "text/plain; charset=UTF-8");
        response
            .headers
            .push("Content-Length", body.len().to_string());
        response.headers.push("Connection", "close");
        self.write_client(&Frame::Response {
            head: response,
            last: false,
        });
        self.write_client(&Frame::Chunk {
            data: body.into(),
            last: true,
        });
        let _ = self.channel.flush().await;
        advance(
            &mut self.state,
            ConnectionState::DisconnectRequested,
            "client",
        );
        false
    }

    async fn write_connection_established(&mut self) -> bool {
        // The doubled status text is the historical wire format clients
        // expect from this proxy family; only the 200 matters to them.
        let mut response = HttpResponse::new(200, "HTTP/1.1 200 Connection established");
        response.headers.push("Connection", "Keep-Alive");
        response.headers.push("Proxy-Connection", "Keep-Alive");
        add_via(&mut response.headers, Version::Http11, &self.ctx.via_alias);
        self.write_client(&Frame::Response {
            head: response,
            last: true,
        });
        self.channel.flush().await.is_ok()
    }

    /// A request filter answered the request itself; no upstream involved.
    async fn respond_directly(&mut self, mut response: HttpResponse, body: bytes::Bytes) -> bool {
        let request = self.inflight.take();
        if !self.ctx.transparent {
            rewrite_response(&mut response, &self.ctx.via_alias);
        }
        if !response.headers.contains("content-length") && !is_chunked(&response.headers) {
            response
                .headers
                .push("Content-Length", body.len().to_string());
        }
        self.write_client(&Frame::Response {
            head: response,
            last: body.is_empty(),
        });
        if !body.is_empty() {
            self.write_client(&Frame::Chunk {
                data: body,
                last: true,
            });
        }
        if self.channel.flush().await.is_err() {
            return false;
        }
        request.map(|r| r.request_keep_alive).unwrap_or(false)
    }

    /// Answer the CONNECT, then turn the client leg into TLS we terminate.
    async fn start_mitm(&mut self, authority: &str) -> bool {
        let Some(mitm) = self.ctx.mitm.clone() else {
            return false;
        };
        let (host, _) = split_authority(authority, 443);
        let config = match mitm.server_config_for(&host) {
            Ok(config) => config,
            Err(error) => {
                warn!(host = %host, "no interception certificate: {error:#}");
                return false;
            }
        };
        let acceptor = TlsAcceptor::from(config);
        match self.channel.accept_tls(&acceptor).await {
            Ok(()) => {
                info!(client = %self.client_address, host = %host, "intercepting TLS");
                self.mitm_active = true;
                true
            }
            Err(error) => {
                warn!(client = %self.client_address, "client TLS handshake failed: {error}");
                false
            }
        }
    }

    async fn teardown(&mut self) {
        for (_, handle) in self.servers.drain() {
            handle.disconnect();
        }
        self.by_authority.clear();
        let _ = self.channel.shutdown().await;
        advance(&mut self.state, ConnectionState::Disconnected, "client");
        info!(
            client = %self.client_address,
            connected = self.connected.load(Ordering::Relaxed),
            reused = self.reused.load(Ordering::Relaxed),
            "client connection closed"
        );
    }
}

/// Keep-alive semantics of the request as the client meant them:
/// `Proxy-Connection` counts as `Connection` on the client hop.
fn client_keep_alive(request: &HttpRequest) -> bool {
    let mut headers = request.headers.clone();
    rename_proxy_connection(&mut headers);
    wants_keep_alive(request.version, &headers)
}

/// Outbound request rewriting (non-transparent mode).
///
/// `Proxy-Connection` is folded into `Connection` first so headers it names
/// are scrubbed like any other connection token (RFC 2616 §14.10). After
/// the scrubs the proxy states its own `Connection` for the next hop.
fn rewrite_request(head: &mut HttpRequest, direct: bool, via_alias: &str) {
    if direct {
        head.uri = strip_host(&head.uri);
    }
    strip_sdch(&mut head.headers);
    rename_proxy_connection(&mut head.headers);
    let keep_alive = wants_keep_alive(head.version, &head.headers);
    scrub_connection_tokens(&mut head.headers);
    scrub_hop_by_hop(&mut head.headers);
    head.headers
        .push("Connection", if keep_alive { "keep-alive" } else { "close" });
    add_via(&mut head.headers, head.version, via_alias);
}

/// Inbound response rewriting (non-transparent mode).
fn rewrite_response(head: &mut HttpResponse, via_alias: &str) {
    scrub_connection_tokens(&mut head.headers);
    scrub_hop_by_hop(&mut head.headers);
    add_via(&mut head.headers, head.version, via_alias);
    if !head.headers.contains("date") {
        head.headers.push("Date", http_date());
    }
    if is_chunked(&head.headers) && head.version != Version::Http11 {
        // Chunked framing is an HTTP/1.1 construct; upgrade the stated
        // version so the client parses it.
        head.version = Version::Http11;
    }
}
