use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "tollbooth", version, about = "Intercepting HTTP/1.1 forward proxy")]
pub struct Cli {
    /// YAML configuration file. Defaults apply when omitted.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the listen address from the config file.
    #[arg(long)]
    pub listen: Option<String>,

    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Suppress all header rewriting.
    #[serde(default)]
    pub transparent: bool,

    /// Route name resolution through a verifying resolver.
    #[serde(default)]
    pub use_dnssec: bool,

    /// Idle timer on every channel; 0 disables.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,

    /// Identifier used in `Via` entries.
    #[serde(default)]
    pub alias: Option<String>,

    /// Presence enables Basic proxy authentication.
    #[serde(default)]
    pub auth: Option<AuthConfig>,

    /// Presence routes requests through an upstream proxy.
    #[serde(default)]
    pub chain: Option<ChainConfig>,

    /// Presence enables TLS interception of CONNECT traffic.
    #[serde(default)]
    pub mitm: Option<MitmConfig>,

    /// Extra CA bundle trusted on the upstream leg.
    #[serde(default)]
    pub upstream_ca: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub users: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainConfig {
    /// `host:port` of the upstream proxy.
    pub address: String,
    /// Retry direct when the chained connection fails.
    #[serde(default)]
    pub fallback_direct: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MitmConfig {
    /// PEM certificate of the signing CA; generated fresh when omitted.
    pub ca_cert: Option<PathBuf>,
    pub ca_key: Option<PathBuf>,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_idle_timeout() -> u64 {
    70
}

impl Default for Config {
    fn default() -> Config {
        Config {
            listen: default_listen(),
            transparent: false,
            use_dnssec: false,
            idle_timeout_seconds: default_idle_timeout(),
            alias: None,
            auth: None,
            chain: None,
            mitm: None,
            upstream_ca: None,
        }
    }
}

pub fn load_config() -> Result<(Cli, Config)> {
    let cli = Cli::parse();

    let mut cfg = match &cli.config {
        Some(path) => {
            let yaml = fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_yaml::from_str(&yaml)
                .with_context(|| format!("Failed to parse YAML in {}", path.display()))?
        }
        None => Config::default(),
    };

    if let Some(listen) = &cli.listen {
        cfg.listen = listen.clone();
    }
    Ok((cli, cfg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_yaml_fills_defaults() {
        let cfg: Config = serde_yaml::from_str("listen: 0.0.0.0:3128\n").unwrap();
        assert_eq!(cfg.listen, "0.0.0.0:3128");
        assert_eq!(cfg.idle_timeout_seconds, 70);
        assert!(!cfg.transparent);
        assert!(cfg.auth.is_none());
    }

    #[test]
    fn full_yaml_parses() {
        let cfg: Config = serde_yaml::from_str(
            "listen: 127.0.0.1:8080\n\
             transparent: true\n\
             idle_timeout_seconds: 30\n\
             alias: edge-1\n\
             auth:\n\
             \x20 users:\n\
             \x20   user: pass\n\
             chain:\n\
             \x20 address: upstream:3128\n\
             \x20 fallback_direct: true\n\
             mitm: {}\n",
        )
        .unwrap();
        assert!(cfg.transparent);
        assert_eq!(cfg.alias.as_deref(), Some("edge-1"));
        assert_eq!(cfg.auth.unwrap().users["user"], "pass");
        let chain = cfg.chain.unwrap();
        assert_eq!(chain.address, "upstream:3128");
        assert!(chain.fallback_direct);
        assert!(cfg.mitm.is_some());
    }
}
