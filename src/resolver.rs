//! Upstream address resolution.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::lookup_host;

/// Resolves a dial target to a socket address. Numeric hosts pass straight
/// through the system resolver.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    /// `dnssec` asks for verified resolution; resolvers that cannot verify
    /// should answer normally and leave validation to an implementation
    /// that can.
    async fn resolve(&self, host: &str, port: u16, dnssec: bool) -> io::Result<SocketAddr>;
}

/// Plain getaddrinfo-backed resolution via tokio.
pub struct SystemResolver;

#[async_trait]
impl AddressResolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16, _dnssec: bool) -> io::Result<SocketAddr> {
        lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {host}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_numeric_host() {
        let addr = SystemResolver
            .resolve("127.0.0.1", 8080, false)
            .await
            .unwrap();
        assert_eq!(addr, "127.0.0.1:8080".parse().unwrap());
    }

    #[tokio::test]
    async fn unknown_host_is_an_error() {
        assert!(SystemResolver
            .resolve("host.invalid", 80, false)
            .await
            .is_err());
    }
}
