//! A transparent gRPC proxy.
//!
//! Calls are relayed frame by frame without being decoded: a
//! [`StreamDirector`] picks the backend for each call, and the proxy splices
//! the caller's stream onto a new stream to that backend, forwarding
//! metadata (plus `x-forwarded-for`), frames in both directions, half-close,
//! cancellation and the backend's final status.
//!
//! ```ignore
//! let backend = Endpoint::from_static("http://[::1]:50051").connect_lazy();
//!
//! let proxy = ProxyService::new(director_fn(move |call: CallContext| {
//!     let backend = backend.clone();
//!     async move {
//!         if call.method().service().starts_with("internal.") {
//!             return Err(Status::unimplemented("Unknown method"));
//!         }
//!         Ok(Route::new(backend))
//!     }
//! }));
//!
//! Server::builder()
//!     .add_routes(ProxyRouter::new(proxy).transparent().into_routes())
//!     .serve(addr)
//!     .await?;
//! ```

mod calls;
mod codec;
mod config;
mod context;
mod director;
mod error;
mod handler;
mod metadata;
mod path;
mod relay;
mod router;

pub use calls::{ActiveCall, CallRegistry};
pub use codec::{Frame, OpaqueCodec, OpaqueDecoder, OpaqueEncoder};
pub use config::ProxyConfig;
pub use context::CallContext;
pub use director::{DoneFn, FnDirector, Route, StreamDirector, director_fn};
pub use error::ProxyError;
pub use handler::ProxyService;
pub use metadata::{FORWARDED_FOR, propagate};
pub use path::MethodPath;
pub use router::ProxyRouter;
