#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_stream::stream;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use rpcproxy::{CallContext, Frame, OpaqueCodec, Route, StreamDirector, director_fn};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::codec::Streaming;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::codegen::{Body, Service, StdError, http};
use tonic::metadata::MetadataMap;
use tonic::server::{Grpc, StreamingService, UnaryService};
use tonic::service::Routes;
use tonic::transport::{Channel, Endpoint, Server};
use tonic::{Code, Request, Response, Status};
use tonic_prost::ProstCodec;

pub const TYPED_PING: &str = "/vgough.testproto.TestService/Ping";

/// Serve `routes` on an ephemeral localhost port.
pub async fn serve(routes: Routes) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        Server::builder()
            .add_routes(routes)
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    addr
}

pub async fn connect(addr: SocketAddr) -> Channel {
    Endpoint::from_shared(format!("http://{addr}"))
        .unwrap()
        .connect()
        .await
        .unwrap()
}

/// Start the test backend: typed `Ping` plus opaque methods on any service.
pub async fn start_backend() -> (SocketAddr, Arc<BackendState>) {
    let state = Arc::new(BackendState::default());
    let router = axum::Router::new()
        .route_service(TYPED_PING, TypedBackend)
        .fallback_service(OpaqueBackend {
            state: Arc::clone(&state),
        });

    (serve(Routes::from(router)).await, state)
}

/// What the director saw, for assertions.
#[derive(Default)]
pub struct Observed {
    pub done: Mutex<Vec<Option<Code>>>,
    pub scopes: Mutex<Vec<CancellationToken>>,
}

impl Observed {
    pub fn done(&self) -> Vec<Option<Code>> {
        self.done.lock().unwrap().clone()
    }

    pub fn scope(&self, index: usize) -> CancellationToken {
        self.scopes.lock().unwrap()[index].clone()
    }
}

/// Routes everything outside `internal.*` to `backend`, with a fresh scope
/// and a done callback per call.
pub fn forwarding_director(backend: Channel, observed: Arc<Observed>) -> impl StreamDirector {
    director_fn(move |call: CallContext| {
        let backend = backend.clone();
        let observed = Arc::clone(&observed);
        async move {
            if call.method().service().starts_with("internal.") {
                return Err(Status::unimplemented("Unknown method"));
            }

            let scope = CancellationToken::new();
            observed.scopes.lock().unwrap().push(scope.clone());

            let sink = Arc::clone(&observed);
            Ok(Route::new(backend)
                .with_scope(scope)
                .on_done(move |err| sink.done.lock().unwrap().push(err.map(Status::code))))
        }
    })
}

/// Open a bidirectional call with raw frames.
pub async fn open(
    channel: Channel,
    path: &'static str,
    request: Request<Vec<Frame>>,
) -> Result<Response<Streaming<Frame>>, Status> {
    let mut client = tonic::client::Grpc::new(channel);
    client
        .ready()
        .await
        .map_err(|e| Status::unavailable(e.to_string()))?;

    let (metadata, extensions, frames) = request.into_parts();
    let request = Request::from_parts(metadata, extensions, stream::iter(frames));
    client
        .streaming(request, PathAndQuery::from_static(path), OpaqueCodec)
        .await
}

/// Read a call to its end. The status is `None` when it ended OK.
pub async fn collect(response: Result<Response<Streaming<Frame>>, Status>) -> (Vec<Frame>, Option<Status>) {
    let mut inbound = match response {
        Ok(response) => response.into_inner(),
        Err(status) => return (Vec::new(), Some(status)),
    };

    let mut frames = Vec::new();
    loop {
        match inbound.message().await {
            Ok(Some(frame)) => frames.push(frame),
            Ok(None) => return (frames, None),
            Err(status) => return (frames, Some(status)),
        }
    }
}

pub async fn exchange(channel: Channel, path: &'static str, frames: Vec<Frame>) -> (Vec<Frame>, Option<Status>) {
    collect(open(channel, path, Request::new(frames)).await).await
}

pub fn frames(items: &[&str]) -> Vec<Frame> {
    items
        .iter()
        .map(|item| Frame::from(item.as_bytes().to_vec()))
        .collect()
}

pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached within 5s");
}

/// Shared record of what the opaque backend saw.
#[derive(Default)]
pub struct BackendState {
    pub calls: AtomicUsize,
    pub released: AtomicUsize,
    pub methods: Mutex<Vec<String>>,
    pub metadata: Mutex<Vec<MetadataMap>>,
}

impl BackendState {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn methods(&self) -> Vec<String> {
        self.methods.lock().unwrap().clone()
    }

    pub fn last_metadata(&self) -> MetadataMap {
        self.metadata.lock().unwrap().last().cloned().unwrap()
    }

    fn record(&self, path: &str, metadata: &MetadataMap) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.methods.lock().unwrap().push(path.to_owned());
        self.metadata.lock().unwrap().push(metadata.clone());
    }
}

/// Backend answering by method name, whatever the service:
/// - `Echo` streams every frame back.
/// - `Collect` reads to end of stream, replies with the frames reversed and a
///   count.
/// - `Fail` refuses the call with `Unavailable`.
/// - `EchoWithTrailer` echoes, then ends OK with a trailer.
/// - `FailAfterFirst` echoes one frame, then fails with a trailer.
/// - `Stall` never answers at all.
/// - `Hang` answers headers and then nothing.
#[derive(Clone)]
pub struct OpaqueBackend {
    state: Arc<BackendState>,
}

impl<B> Service<http::Request<B>> for OpaqueBackend
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
        let call = BackendCall {
            path: req.uri().path().to_owned(),
            state: Arc::clone(&self.state),
        };
        Box::pin(async move { Ok(Grpc::new(OpaqueCodec).streaming(call, req).await) })
    }
}

struct BackendCall {
    path: String,
    state: Arc<BackendState>,
}

struct Released(Arc<BackendState>);

impl Drop for Released {
    fn drop(&mut self) {
        self.0.released.fetch_add(1, Ordering::SeqCst);
    }
}

fn echo(mut inbound: Streaming<Frame>) -> BoxStream<'static, Result<Frame, Status>> {
    Box::pin(stream! {
        loop {
            match inbound.message().await {
                Ok(Some(frame)) => yield Ok(frame),
                Ok(None) => break,
                Err(status) => {
                    yield Err(status);
                    break;
                }
            }
        }
    })
}

fn collect_then_reply(mut inbound: Streaming<Frame>) -> BoxStream<'static, Result<Frame, Status>> {
    Box::pin(stream! {
        let mut received = Vec::new();
        loop {
            match inbound.message().await {
                Ok(Some(frame)) => received.push(frame),
                Ok(None) => break,
                Err(status) => {
                    yield Err(status);
                    return;
                }
            }
        }

        let count = received.len();
        for frame in received.into_iter().rev() {
            yield Ok(frame);
        }
        yield Ok(Frame::from(format!("received {count}").into_bytes()));
    })
}

fn fail_after_first(mut inbound: Streaming<Frame>) -> BoxStream<'static, Result<Frame, Status>> {
    Box::pin(stream! {
        if let Ok(Some(frame)) = inbound.message().await {
            yield Ok(frame);
        }
        let mut status = Status::unavailable("backend unavailable");
        status
            .metadata_mut()
            .insert("x-failure-detail", "disk full".parse().unwrap());
        yield Err(status);
    })
}

fn echo_with_trailer(inbound: Streaming<Frame>) -> BoxStream<'static, Result<Frame, Status>> {
    let mut trailers = MetadataMap::new();
    trailers.insert("x-trailer", "kept".parse().unwrap());
    echo(inbound)
        .chain(stream::once(async move {
            Err(Status::with_metadata(Code::Ok, "", trailers))
        }))
        .boxed()
}

impl StreamingService<Frame> for BackendCall {
    type Response = Frame;
    type ResponseStream = BoxStream<'static, Result<Frame, Status>>;
    type Future = BoxFuture<'static, Result<Response<Self::ResponseStream>, Status>>;

    fn call(&mut self, request: Request<Streaming<Frame>>) -> Self::Future {
        let path = std::mem::take(&mut self.path);
        let state = Arc::clone(&self.state);

        Box::pin(async move {
            state.record(&path, request.metadata());
            let method = path.rsplit('/').next().unwrap_or_default().to_owned();
            let inbound = request.into_inner();

            let replies = match method.as_str() {
                "Echo" => echo(inbound),
                "Collect" => collect_then_reply(inbound),
                "FailAfterFirst" => fail_after_first(inbound),
                "EchoWithTrailer" => echo_with_trailer(inbound),
                "Fail" => return Err(Status::unavailable("backend unavailable")),
                "Stall" => {
                    let _held = (Released(Arc::clone(&state)), inbound);
                    let never: Infallible = std::future::pending().await;
                    match never {}
                }
                "Hang" => {
                    let held = (Released(Arc::clone(&state)), inbound);
                    stream::pending()
                        .inspect(move |_: &Result<Frame, Status>| {
                            let _held = &held;
                        })
                        .boxed()
                }
                other => return Err(Status::unimplemented(format!("no method {other}"))),
            };

            let mut response = Response::new(replies);
            response
                .metadata_mut()
                .insert("x-backend", "opaque".parse().unwrap());
            Ok(response)
        })
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PingRequest {
    #[prost(string, tag = "1")]
    pub value: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PingResponse {
    #[prost(string, tag = "1")]
    pub value: String,
    #[prost(int32, tag = "2")]
    pub counter: i32,
}

/// A conventional, schema-aware unary method.
#[derive(Clone)]
pub struct TypedBackend;

struct PingHandler;

impl UnaryService<PingRequest> for PingHandler {
    type Response = PingResponse;
    type Future = BoxFuture<'static, Result<Response<PingResponse>, Status>>;

    fn call(&mut self, request: Request<PingRequest>) -> Self::Future {
        Box::pin(async move {
            let ping = request.into_inner();
            Ok(Response::new(PingResponse {
                value: ping.value,
                counter: 42,
            }))
        })
    }
}

impl<B> Service<http::Request<B>> for TypedBackend
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
        Box::pin(async move {
            let codec = ProstCodec::<PingResponse, PingRequest>::default();
            Ok(Grpc::new(codec).unary(PingHandler, req).await)
        })
    }
}

pub async fn typed_ping(channel: Channel, value: &str) -> Result<PingResponse, Status> {
    let mut client = tonic::client::Grpc::new(channel);
    client
        .ready()
        .await
        .map_err(|e| Status::unavailable(e.to_string()))?;

    let request = Request::new(PingRequest {
        value: value.to_owned(),
    });
    let codec = ProstCodec::<PingRequest, PingResponse>::default();
    client
        .unary(request, PathAndQuery::from_static(TYPED_PING), codec)
        .await
        .map(Response::into_inner)
}
