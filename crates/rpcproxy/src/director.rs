use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tonic::Status;
use tonic::metadata::MetadataMap;
use tonic::transport::Channel;

use crate::context::CallContext;

/// Callback invoked once when a proxied call ends, with the final error if
/// there was one.
pub type DoneFn = Box<dyn FnOnce(Option<&Status>) + Send + 'static>;

/// Routing policy consulted once for every inbound call.
///
/// The director decides which backend receives the call, or rejects it by
/// returning an error. A rejection is sent to the caller as the call's final
/// status and nothing is relayed.
///
/// Implementations run concurrently for independent calls and should not
/// block indefinitely; see [`ProxyConfig::resolve_timeout`](crate::ProxyConfig)
/// for an upper bound enforced by the proxy.
///
/// # Example
///
/// ```ignore
/// struct Static(Channel);
///
/// #[tonic::async_trait]
/// impl StreamDirector for Static {
///     async fn connect(&self, call: &CallContext) -> Result<Route, Status> {
///         if call.method().service().starts_with("com.example.internal.") {
///             return Err(Status::unimplemented("Unknown method"));
///         }
///         Ok(Route::new(self.0.clone()))
///     }
/// }
/// ```
#[tonic::async_trait]
pub trait StreamDirector: Send + Sync + 'static {
    async fn connect(&self, call: &CallContext) -> Result<Route, Status>;
}

#[tonic::async_trait]
impl<D> StreamDirector for Arc<D>
where
    D: StreamDirector + ?Sized,
{
    async fn connect(&self, call: &CallContext) -> Result<Route, Status> {
        (**self).connect(call).await
    }
}

/// A director built from an async closure. See [`director_fn`].
pub struct FnDirector<F> {
    f: F,
}

/// Helper to create a director from an async closure.
///
/// The closure receives its own copy of the call context so the returned
/// future does not borrow from the proxy.
pub fn director_fn<F, Fut>(f: F) -> FnDirector<F>
where
    F: Fn(CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Route, Status>> + Send + 'static,
{
    FnDirector { f }
}

#[tonic::async_trait]
impl<F, Fut> StreamDirector for FnDirector<F>
where
    F: Fn(CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Route, Status>> + Send + 'static,
{
    async fn connect(&self, call: &CallContext) -> Result<Route, Status> {
        (self.f)(call.clone()).await
    }
}

/// The routing decision for one call.
///
/// Only the backend is required. The channel belongs to the director: the
/// proxy clones it to open one stream and never closes it, so one channel can
/// serve any number of concurrent calls.
pub struct Route {
    backend: Channel,
    method: Option<String>,
    metadata: Option<MetadataMap>,
    scope: Option<CancellationToken>,
    on_done: Option<DoneFn>,
}

impl Route {
    pub fn new(backend: Channel) -> Self {
        Self {
            backend,
            method: None,
            metadata: None,
            scope: None,
            on_done: None,
        }
    }

    /// Call a different method on the backend, e.g. `/v2.Echo/Echo`.
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    /// Send exactly this metadata to the backend.
    ///
    /// The inbound metadata is then not copied and no forwarded-for entry is
    /// added; the two sources are never merged.
    pub fn with_metadata(mut self, metadata: MetadataMap) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Run the backend call inside this cancellation scope.
    ///
    /// Cancelling the token aborts the call. The proxy cancels it exactly
    /// once when the call ends, however it ends, which is the signal to
    /// release anything the director set up for this call. Without a scope
    /// the proxy creates a fresh one.
    pub fn with_scope(mut self, scope: CancellationToken) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Run `f` exactly once when the call ends, with the final error if any.
    pub fn on_done<F>(mut self, f: F) -> Self
    where
        F: FnOnce(Option<&Status>) + Send + 'static,
    {
        self.on_done = Some(Box::new(f));
        self
    }

    pub fn backend(&self) -> &Channel {
        &self.backend
    }

    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    pub fn metadata(&self) -> Option<&MetadataMap> {
        self.metadata.as_ref()
    }

    pub fn scope(&self) -> Option<&CancellationToken> {
        self.scope.as_ref()
    }

    pub(crate) fn into_parts(self) -> RouteParts {
        RouteParts {
            backend: self.backend,
            method: self.method,
            metadata: self.metadata,
            scope: self.scope.unwrap_or_else(CancellationToken::new),
            on_done: self.on_done,
        }
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("metadata", &self.metadata)
            .field("scope", &self.scope)
            .field("on_done", &self.on_done.is_some())
            .finish_non_exhaustive()
    }
}

pub(crate) struct RouteParts {
    pub backend: Channel,
    pub method: Option<String>,
    pub metadata: Option<MetadataMap>,
    pub scope: CancellationToken,
    pub on_done: Option<DoneFn>,
}
