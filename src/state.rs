//! Connection lifecycle states shared by both peers.

use std::fmt;

use tracing::trace;

/// Where a connection is in its life. Both legs use the same set; a few
/// states only ever occur on one side (`Connecting` is upstream-only,
/// `AwaitingProxyAuthentication` is client-only).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Terminal; no I/O.
    Disconnected,
    /// Outbound TCP attempt in progress.
    Connecting,
    /// TLS handshake in progress.
    Handshaking,
    /// Awaiting a `CONNECT` verdict from a chained proxy, or about to answer
    /// `200 Connection established` on the client leg.
    NegotiatingConnect,
    /// Ready to parse a fresh request (client) or response (server) head.
    AwaitingInitial,
    /// Mid-body; inbound messages are chunks until the last-chunk marker.
    AwaitingChunk,
    /// A 407 went out; non-request messages are discarded until the client
    /// retries.
    AwaitingProxyAuthentication,
    /// HTTP codecs stripped; bytes forward verbatim.
    Tunneling,
    /// Close scheduled once pending writes flush.
    DisconnectRequested,
}

impl ConnectionState {
    /// States in which inbound traffic is dropped rather than dispatched.
    pub fn discards_inbound(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::Handshaking
                | ConnectionState::DisconnectRequested
                | ConnectionState::Disconnected
        )
    }

    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Disconnected
    }
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

/// The single mutation point for a peer's state. Transitions are serialized
/// by the owning task, so a plain `&mut` is enough.
pub fn advance(state: &mut ConnectionState, next: ConnectionState, side: &str) {
    if *state != next {
        trace!("{side}: {state} -> {next}");
        *state = next;
    }
}
