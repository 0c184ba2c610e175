use std::net::SocketAddr;

use tonic::metadata::MetadataMap;
use uuid::Uuid;

use crate::path::MethodPath;

/// Everything a director may look at to route one inbound call.
///
/// Built by the proxy handler from the inbound request before any frame is
/// read. The incoming metadata is a snapshot; changing it here has no effect
/// on what the backend receives unless the director hands it back through
/// [`Route::with_metadata`](crate::Route::with_metadata).
#[derive(Debug, Clone)]
pub struct CallContext {
    id: Uuid,
    method: MethodPath,
    authority: Option<String>,
    metadata: MetadataMap,
    remote_addr: Option<SocketAddr>,
}

impl CallContext {
    pub fn new(method: MethodPath, metadata: MetadataMap) -> Self {
        Self {
            id: Uuid::new_v4(),
            method,
            authority: None,
            metadata,
            remote_addr: None,
        }
    }

    /// Set the `:authority` the caller addressed.
    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = Some(authority.into());
        self
    }

    /// Set the caller's socket address.
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Unique id of this call, also used in log events and the call registry.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn method(&self) -> &MethodPath {
        &self.method
    }

    /// The `:authority` pseudo-header, e.g. `api.example.com:443`.
    pub fn authority(&self) -> Option<&str> {
        self.authority.as_deref()
    }

    /// The authority without any port suffix.
    pub fn host(&self) -> Option<&str> {
        let authority = self.authority.as_deref()?;
        if let Some(rest) = authority.strip_prefix('[') {
            return rest.split_once(']').map(|(host, _)| host);
        }
        Some(
            authority
                .rsplit_once(':')
                .map_or(authority, |(host, _)| host),
        )
    }

    /// Metadata the caller sent with the call.
    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }
}
