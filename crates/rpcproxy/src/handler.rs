use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::codec::Streaming;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::codegen::{Body, Service, StdError, http};
use tonic::server::{Grpc, StreamingService};
use tonic::transport::Channel;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::calls::CallRegistry;
use crate::codec::{Frame, OpaqueCodec};
use crate::config::ProxyConfig;
use crate::context::CallContext;
use crate::director::{Route, StreamDirector};
use crate::metadata;
use crate::path::MethodPath;
use crate::relay::{self, Abort};

/// The proxy as a gRPC handler.
///
/// `ProxyService` answers any method it is mounted on with a bidirectional
/// stream, whatever the cardinality of the method on the backend: unary and
/// server-streaming calls are just streams of one request frame. Mount it with
/// [`ProxyRouter`](crate::ProxyRouter).
///
/// Cloning is cheap; clones share the director, config and call registry.
#[derive(Clone)]
pub struct ProxyService {
    inner: Arc<Inner>,
}

struct Inner {
    director: Arc<dyn StreamDirector>,
    config: ProxyConfig,
    calls: Arc<CallRegistry>,
}

impl ProxyService {
    pub fn new<D: StreamDirector>(director: D) -> Self {
        Self::with_config(director, ProxyConfig::default())
    }

    pub fn with_config<D: StreamDirector>(director: D, config: ProxyConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                director: Arc::new(director),
                config,
                calls: Arc::new(CallRegistry::new()),
            }),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.inner.config
    }

    /// Get the number of calls currently being relayed.
    pub fn active_calls(&self) -> usize {
        self.inner.calls.len()
    }

    /// The registry of in-flight calls.
    pub fn calls(&self) -> &Arc<CallRegistry> {
        &self.inner.calls
    }

    /// Cancel every in-flight call. Callers see `Cancelled`.
    ///
    /// Returns how many calls were cancelled. Calls arriving afterwards are
    /// still served.
    pub fn shutdown(&self) -> usize {
        let cancelled = self.inner.calls.cancel_all();
        info!(calls = cancelled, "Cancelled in-flight proxied calls");
        cancelled
    }
}

impl std::fmt::Debug for ProxyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyService")
            .field("config", &self.inner.config)
            .field("active_calls", &self.inner.calls.len())
            .finish_non_exhaustive()
    }
}

impl<B> Service<http::Request<B>> for ProxyService
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let call = ProxyCall {
            inner: Arc::clone(&self.inner),
            path: req.uri().path().to_owned(),
            authority: req.uri().authority().map(|authority| authority.to_string()),
        };
        let config = &self.inner.config;
        let mut grpc = Grpc::new(OpaqueCodec).apply_max_message_size_config(
            config.max_decoding_message_size,
            config.max_encoding_message_size,
        );

        Box::pin(async move { Ok(grpc.streaming(call, req).await) })
    }
}

/// One inbound call, before its stream has been accepted.
struct ProxyCall {
    inner: Arc<Inner>,
    path: String,
    authority: Option<String>,
}

impl StreamingService<Frame> for ProxyCall {
    type Response = Frame;
    type ResponseStream = ReceiverStream<Result<Frame, Status>>;
    type Future = BoxFuture<'static, Result<Response<Self::ResponseStream>, Status>>;

    fn call(&mut self, request: Request<Streaming<Frame>>) -> Self::Future {
        let inner = Arc::clone(&self.inner);
        let path = std::mem::take(&mut self.path);
        let authority = self.authority.take();

        Box::pin(async move { inner.proxy(path, authority, request).await })
    }
}

impl Inner {
    async fn proxy(
        self: Arc<Self>,
        path: String,
        authority: Option<String>,
        request: Request<Streaming<Frame>>,
    ) -> Result<Response<ReceiverStream<Result<Frame, Status>>>, Status> {
        let method = MethodPath::parse(&path).inspect_err(|e| {
            warn!(path = %path, error = %e, "Rejecting call with malformed method path");
        })?;

        let mut call = CallContext::new(method, request.metadata().clone());
        if let Some(authority) = authority {
            call = call.with_authority(authority);
        }
        if let Some(addr) = request.remote_addr() {
            call = call.with_remote_addr(addr);
        }

        let route = self.resolve(&call).await.inspect_err(|status| {
            info!(
                call_id = %call.id(),
                method = %call.method(),
                code = ?status.code(),
                error = %status.message(),
                "Director rejected call"
            );
        })?;

        let route = route.into_parts();
        let guard = self
            .calls
            .track(call.id(), call.method().full_path(), route.scope.clone(), route.on_done);

        let backend_method = route
            .method
            .unwrap_or_else(|| call.method().full_path());
        let backend_path = match backend_path(&backend_method) {
            Ok(path) => path,
            Err(status) => {
                guard.finish(&Err(status.clone()));
                return Err(status);
            }
        };

        let outgoing = route.metadata.unwrap_or_else(|| {
            let peer = call
                .remote_addr()
                .filter(|_| self.config.forward_peer_address);
            metadata::propagate(call.metadata(), peer)
        });

        let abort = Arc::new(Abort::new(route.scope.child_token()));

        // Frames start flowing to the backend before its response headers
        // arrive; some backends wait for the first request before answering.
        let (upstream_tx, upstream_rx) = mpsc::channel(1);
        let upstream = tokio::spawn(relay::pump_upstream(
            request.into_inner(),
            upstream_tx,
            Arc::clone(&abort),
        ));

        let mut outbound = Request::new(ReceiverStream::new(upstream_rx));
        *outbound.metadata_mut() = outgoing;

        let opened = tokio::select! {
            opened = self.open(route.backend, backend_path, outbound) => opened,
            _ = abort.cancelled() => Err(abort.reason()),
        };

        let response = match opened {
            Ok(response) => response,
            Err(status) => {
                warn!(
                    call_id = %call.id(),
                    method = %call.method(),
                    backend_method = %backend_method,
                    code = ?status.code(),
                    error = %status.message(),
                    "Failed to open backend stream"
                );
                abort.abort(status.clone());
                if let Err(e) = upstream.await {
                    warn!(call_id = %call.id(), error = %e, "Upstream relay task failed");
                }
                guard.finish(&Err(status.clone()));
                return Err(status);
            }
        };

        debug!(
            call_id = %call.id(),
            method = %call.method(),
            backend_method = %backend_method,
            "Backend stream opened"
        );

        let (mut headers, backend_frames, _extensions) = response.into_parts();
        metadata::strip_transport_headers(&mut headers);

        let (downstream_tx, downstream_rx) = mpsc::channel(1);
        let call_id = call.id();
        let method = call.method().clone();

        tokio::spawn(async move {
            let mut result =
                relay::pump_downstream(backend_frames, downstream_tx, Arc::clone(&abort)).await;
            // Once the backend is done there is nothing left to forward to it.
            abort.close();

            if let Err(e) = upstream.await {
                warn!(call_id = %call_id, error = %e, "Upstream relay task failed");
                if result.is_ok() {
                    result = Err(Status::internal("upstream relay task failed"));
                }
            }

            match &result {
                Ok(()) => info!(call_id = %call_id, method = %method, "Proxied call completed"),
                Err(status) => info!(
                    call_id = %call_id,
                    method = %method,
                    code = ?status.code(),
                    error = %status.message(),
                    "Proxied call ended with error"
                ),
            }

            guard.finish(&result);
        });

        let mut response = Response::new(ReceiverStream::new(downstream_rx));
        *response.metadata_mut() = headers;
        Ok(response)
    }

    async fn resolve(&self, call: &CallContext) -> Result<Route, Status> {
        let connect = self.director.connect(call);
        match self.config.resolve_timeout {
            Some(limit) => tokio::time::timeout(limit, connect).await.map_err(|_| {
                Status::deadline_exceeded(format!("no route resolved within {limit:?}"))
            })?,
            None => connect.await,
        }
    }

    async fn open(
        &self,
        backend: Channel,
        path: PathAndQuery,
        request: Request<ReceiverStream<Frame>>,
    ) -> Result<Response<Streaming<Frame>>, Status> {
        let mut client = tonic::client::Grpc::new(backend);
        if let Some(limit) = self.config.max_decoding_message_size {
            client = client.max_decoding_message_size(limit);
        }
        if let Some(limit) = self.config.max_encoding_message_size {
            client = client.max_encoding_message_size(limit);
        }

        client
            .ready()
            .await
            .map_err(|e| Status::unavailable(format!("backend not ready: {e}")))?;
        client.streaming(request, path, OpaqueCodec).await
    }
}

// A director override is held to the same shape as an inbound path.
fn backend_path(method: &str) -> Result<PathAndQuery, Status> {
    MethodPath::parse(method)
        .map_err(|e| e.to_string())
        .and_then(|parsed| PathAndQuery::try_from(parsed.full_path()).map_err(|e| e.to_string()))
        .map_err(|e| {
            Status::internal(format!("director returned an invalid method '{method}': {e}"))
        })
}
