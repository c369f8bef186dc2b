use std::{sync::Arc, time::Duration};

use anyhow::Result;

use rustls::ClientConfig;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::{
    auth::{ProxyAuthenticator, StaticUserAuthenticator},
    chain::{ChainProxyManager, StaticChainManager},
    client::ClientSide,
    config::Config,
    filter::{RequestFilter, ResponseFilterSource},
    resolver::{AddressResolver, SystemResolver},
    tls::{build_upstream_config, MitmAuthority},
    tracker::ActivityRecorder,
};

/// Everything a connection task needs to proxy: configuration knobs plus
/// the pluggable collaborators. Built once, shared via `Arc` into every
/// spawned task.
pub struct ProxyContext {
    /// Suppress all header rewriting.
    pub transparent: bool,
    /// Identifier appended in `Via` entries.
    pub via_alias: String,
    pub idle_timeout: Option<Duration>,
    pub use_dnssec: bool,
    pub authenticator: Option<Arc<dyn ProxyAuthenticator>>,
    pub chain: Option<Arc<dyn ChainProxyManager>>,
    pub request_filter: Option<Arc<dyn RequestFilter>>,
    pub response_filters: Option<Arc<dyn ResponseFilterSource>>,
    pub recorder: ActivityRecorder,
    pub resolver: Arc<dyn AddressResolver>,
    pub mitm: Option<Arc<MitmAuthority>>,
    pub upstream_tls: Arc<ClientConfig>,
}

impl ProxyContext {
    /// A context with every optional collaborator switched off.
    pub fn new() -> Result<ProxyContext> {
        Ok(ProxyContext {
            transparent: false,
            via_alias: "tollbooth".to_string(),
            idle_timeout: Some(Duration::from_secs(70)),
            use_dnssec: false,
            authenticator: None,
            chain: None,
            request_filter: None,
            response_filters: None,
            recorder: ActivityRecorder::default(),
            resolver: Arc::new(SystemResolver),
            mitm: None,
            upstream_tls: Arc::new(build_upstream_config(None)?),
        })
    }
}

/// The proxy: an accept loop handing each client connection to its own
/// task. Cheap to clone; all shared state lives behind the context `Arc`.
#[derive(Clone)]
pub struct Proxy {
    ctx: Arc<ProxyContext>,
    listen: String,
}

impl Proxy {
    /// Build a proxy from the YAML configuration, wiring up the
    /// config-file collaborators (auth table, static chain, MITM CA).
    pub fn new(cfg: Config) -> Result<Proxy> {
        let mut ctx = ProxyContext::new()?;
        ctx.transparent = cfg.transparent;
        ctx.use_dnssec = cfg.use_dnssec;
        ctx.idle_timeout = match cfg.idle_timeout_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        if let Some(alias) = cfg.alias {
            ctx.via_alias = alias;
        }
        if let Some(auth) = cfg.auth {
            ctx.authenticator = Some(Arc::new(StaticUserAuthenticator::new(auth.users)));
        }
        if let Some(chain) = cfg.chain {
            ctx.chain = Some(Arc::new(StaticChainManager::new(
                chain.address,
                chain.fallback_direct,
            )));
        }
        if let Some(mitm) = cfg.mitm {
            let authority = match (mitm.ca_cert, mitm.ca_key) {
                (Some(cert), Some(key)) => MitmAuthority::load(cert, key)?,
                _ => {
                    let authority = MitmAuthority::generate()?;
                    info!("no interception CA configured; generated an ephemeral one");
                    authority
                }
            };
            ctx.mitm = Some(Arc::new(authority));
        }
        ctx.upstream_tls = Arc::new(build_upstream_config(cfg.upstream_ca.as_deref())?);

        Ok(Proxy {
            ctx: Arc::new(ctx),
            listen: cfg.listen,
        })
    }

    /// Embed the proxy with hand-built collaborators (tests, library use).
    pub fn with_context(listen: impl Into<String>, ctx: Arc<ProxyContext>) -> Proxy {
        Proxy {
            ctx,
            listen: listen.into(),
        }
    }

    pub fn context(&self) -> Arc<ProxyContext> {
        self.ctx.clone()
    }

    /// Start the proxy:
    /// * runs the accept loop,
    /// * shuts down cleanly on **Ctrl-C**.
    pub async fn run(&self) -> Result<()> {
        info!("Starting proxy — listen={}", self.listen);

        tokio::select! {
            res = self.accept_loop() => {
                res
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received (Ctrl-C). Closing proxy.");
                Ok(())
            }
        }
    }

    async fn accept_loop(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.listen).await?;
        info!("Proxy listening on {}", self.listen);
        self.serve(listener).await
    }

    /// Accept clients off an already-bound listener and spawn one task per
    /// connection. Never returns unless the listener itself fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (sock, peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Failed to accept connection {}", e);
                    continue;
                }
            };
            let ctx = self.ctx.clone();

            tokio::spawn(async move {
                ClientSide::run(ctx, sock, peer_addr).await;
            });
        }
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy").field("listen", &self.listen).finish()
    }
}
