//! Binary entry-point for the tollbooth proxy.

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, fmt, EnvFilter};

use tollbooth::config;
use tollbooth::proxy::Proxy;

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Load CLI flags + YAML config ────────────────────────────────────────
    let (cli, cfg) = config::load_config()?;

    // ── 2. Init structured logging (env -> overrides flag) ─────────────────────
    // e.g. RUST_LOG=debug cargo run
    let log_level = cli
        .log_level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);

    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    if let Some(path) = &cli.config {
        info!("Configuration loaded from {:?}", path);
    }
    info!("Listen      : {}", cfg.listen);
    info!("Transparent : {}", cfg.transparent);
    info!("Auth        : {}", cfg.auth.is_some());
    info!("Chained     : {}", cfg.chain.is_some());
    info!("Intercept   : {}", cfg.mitm.is_some());

    // ── 3. Build and run the proxy ─────────────────────────────────────────────
    let proxy = Proxy::new(cfg)?;
    if let Err(e) = proxy.run().await {
        error!("Proxy exited with error: {:?}", e);
    }

    Ok(())
}
