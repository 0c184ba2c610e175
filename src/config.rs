use std::net::SocketAddr;

use anyhow::{Context, Result, anyhow};

pub const DEFAULT_LISTEN_ADDR: &str = "[::1]:50051";

/// Gateway settings, read from `GATEWAY_*` environment variables.
///
/// - `GATEWAY_LISTEN_ADDR`: socket address to serve on.
/// - `GATEWAY_BACKENDS`: `host=uri` pairs, comma separated, e.g.
///   `api.example.com=http://10.0.0.5:50051`.
/// - `GATEWAY_DEFAULT_BACKEND`: uri for calls whose host has no entry.
/// - `GATEWAY_BLOCKED_PREFIXES`: comma separated service name prefixes that
///   are never proxied.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    pub backends: Vec<(String, String)>,
    pub default_backend: Option<String>,
    pub blocked_prefixes: Vec<String>,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr = lookup("GATEWAY_LISTEN_ADDR")
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        let listen_addr = listen_addr
            .parse()
            .with_context(|| format!("invalid GATEWAY_LISTEN_ADDR '{listen_addr}'"))?;

        let backends = match lookup("GATEWAY_BACKENDS") {
            Some(raw) => parse_backends(&raw)?,
            None => Vec::new(),
        };

        let default_backend = lookup("GATEWAY_DEFAULT_BACKEND")
            .map(|uri| uri.trim().to_string())
            .filter(|uri| !uri.is_empty());

        let blocked_prefixes = lookup("GATEWAY_BLOCKED_PREFIXES")
            .map(|raw| list(&raw).map(str::to_string).collect())
            .unwrap_or_default();

        Ok(Self {
            listen_addr,
            backends,
            default_backend,
            blocked_prefixes,
        })
    }
}

fn list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|item| !item.is_empty())
}

fn parse_backends(raw: &str) -> Result<Vec<(String, String)>> {
    list(raw)
        .map(|entry| {
            let (host, uri) = entry
                .split_once('=')
                .ok_or_else(|| anyhow!("backend entry '{entry}' is not host=uri"))?;
            let (host, uri) = (host.trim(), uri.trim());
            if host.is_empty() || uri.is_empty() {
                return Err(anyhow!("backend entry '{entry}' has an empty host or uri"));
            }
            Ok((host.to_ascii_lowercase(), uri.to_string()))
        })
        .collect()
}
