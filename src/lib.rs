//! Tollbooth: an intercepting HTTP/1.1 forward proxy.
//!
//! Accepts client HTTP requests, forwards them to origin servers (optionally
//! via a chained upstream proxy), and streams responses back. `CONNECT`
//! turns the connection into a raw tunnel, or, with an interception CA
//! configured, into TLS the proxy terminates and re-originates so filters
//! and trackers see the decrypted exchange.

pub mod auth;
pub mod chain;
pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod filter;
pub mod flow;
pub mod http1;
pub mod proxy;
pub mod resolver;
pub mod server;
pub mod state;
pub mod tls;
pub mod tracker;

pub use config::Config;
pub use error::ProxyError;
pub use proxy::{Proxy, ProxyContext};
