use std::io;

use thiserror::Error;

/// Everything that can go wrong on a proxied exchange.
///
/// The client leg maps these onto synthesized responses (`502`, `407`) or a
/// close; see the policy table in `client.rs`.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The request carried no usable authority (no absolute URI, no `Host`).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Name resolution failed for the dial target.
    #[error("unknown host {0}")]
    UnknownHost(String),

    /// The transport connect to the dial target failed.
    #[error("connect to {authority} failed: {reason}")]
    ConnectFailed { authority: String, reason: String },

    /// A TLS handshake (either leg) did not complete.
    #[error("TLS handshake with {authority} failed: {reason}")]
    TlsHandshakeFailed { authority: String, reason: String },

    /// A chained proxy answered our `CONNECT` with a non-2xx status.
    #[error("chained proxy refused CONNECT with status {0}")]
    ChainedConnectRefused(u16),

    /// Proxy authentication is configured and the request carried no
    /// credentials.
    #[error("proxy authentication required")]
    AuthRequired,

    /// Credentials were present but rejected by the authenticator.
    #[error("proxy authentication failed")]
    AuthFailed,

    /// The idle timer fired on a channel.
    #[error("idle timeout")]
    Idle,

    /// The peer reset or abruptly closed the connection.
    #[error("peer reset")]
    PeerReset,

    /// Bytes on the wire did not parse as HTTP/1.x, or violated the
    /// configured size limits.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Any other I/O failure on a channel.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Connection-reset class errors are routine on the open internet and
    /// get demoted to warnings instead of error logs.
    pub fn is_peer_reset(&self) -> bool {
        match self {
            ProxyError::PeerReset => true,
            ProxyError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
