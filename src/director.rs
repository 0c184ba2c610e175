use std::collections::HashMap;

use anyhow::{Context, Result};
use rpcproxy::{CallContext, Route, StreamDirector};
use tonic::Status;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

use crate::config::GatewayConfig;

/// Routes calls by the host the caller addressed.
///
/// Channels are created once at startup and connect lazily on first use, so
/// an unreachable backend only fails the calls sent to it.
#[derive(Debug, Clone)]
pub struct GatewayDirector {
    backends: HashMap<String, Channel>,
    default_backend: Option<Channel>,
    blocked_prefixes: Vec<String>,
}

impl GatewayDirector {
    /// Must be called from within a tokio runtime.
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let backends = config
            .backends
            .iter()
            .map(|(host, uri)| Ok((host.clone(), lazy_channel(uri)?)))
            .collect::<Result<HashMap<_, _>>>()?;

        let default_backend = config
            .default_backend
            .as_deref()
            .map(lazy_channel)
            .transpose()?;

        Ok(Self {
            backends,
            default_backend,
            blocked_prefixes: config.blocked_prefixes.clone(),
        })
    }

    fn is_blocked(&self, call: &CallContext) -> bool {
        let service = call.method().service();
        self.blocked_prefixes
            .iter()
            .any(|prefix| service.starts_with(prefix.as_str()))
    }

    fn select(&self, call: &CallContext) -> Option<&Channel> {
        call.host()
            .and_then(|host| self.backends.get(&host.to_ascii_lowercase()))
            .or(self.default_backend.as_ref())
    }
}

fn lazy_channel(uri: &str) -> Result<Channel> {
    let endpoint = Endpoint::from_shared(uri.to_string())
        .with_context(|| format!("invalid backend uri '{uri}'"))?;
    Ok(endpoint.connect_lazy())
}

#[tonic::async_trait]
impl StreamDirector for GatewayDirector {
    async fn connect(&self, call: &CallContext) -> Result<Route, Status> {
        if self.is_blocked(call) {
            debug!(call_id = %call.id(), method = %call.method(), "Method is blocked");
            return Err(Status::unimplemented("Unknown method"));
        }

        let backend = self.select(call).ok_or_else(|| {
            debug!(
                call_id = %call.id(),
                method = %call.method(),
                authority = ?call.authority(),
                "No backend for host"
            );
            Status::unimplemented("Unknown method")
        })?;

        Ok(Route::new(backend.clone()))
    }
}
