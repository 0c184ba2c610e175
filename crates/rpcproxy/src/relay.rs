//! The two pump loops that splice an inbound call onto a backend call.
//!
//! Each direction runs as its own loop and relays one frame at a time, in
//! arrival order. The loops share nothing but an [`Abort`] signal: the first
//! loop to fail records its status there and cancels the other.
//!
//! - upstream (caller -> backend): a clean end of the caller's stream closes
//!   the backend's send side and is not an error; the backend keeps
//!   answering.
//! - downstream (backend -> caller): the backend's final status becomes the
//!   caller's final status, verbatim, trailing metadata included.

use std::future::Future;
use std::sync::{Arc, OnceLock};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::codec::Streaming;
use tonic::metadata::MetadataMap;
use tonic::{Code, Status};
use tracing::debug;

use crate::codec::Frame;
use crate::metadata;

/// The response side of a backend call: frames, then trailing metadata once
/// the frames are exhausted.
pub(crate) trait BackendStream: Stream<Item = Result<Frame, Status>> + Unpin + Send {
    fn trailers(&mut self) -> impl Future<Output = Result<Option<MetadataMap>, Status>> + Send;
}

impl BackendStream for Streaming<Frame> {
    fn trailers(&mut self) -> impl Future<Output = Result<Option<MetadataMap>, Status>> + Send {
        Streaming::trailers(self)
    }
}

/// Shared abort signal of one call's relay.
#[derive(Debug)]
pub(crate) struct Abort {
    token: CancellationToken,
    reason: OnceLock<Status>,
}

impl Abort {
    /// `token` should be a child of the call's scope, so cancelling the scope
    /// stops the relay but stopping the relay does not end the scope.
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            reason: OnceLock::new(),
        }
    }

    /// Stop both loops because of `status`. The first reason recorded wins.
    pub fn abort(&self, status: Status) {
        if self.reason.set(status).is_err() {
            debug!("Relay already aborted, keeping the first reason");
        }
        self.token.cancel();
    }

    /// Stop whatever is still running without recording a failure.
    pub fn close(&self) {
        self.token.cancel();
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Why the relay stopped. A scope cancelled from outside reads as
    /// `Cancelled`.
    pub fn reason(&self) -> Status {
        self.reason
            .get()
            .cloned()
            .unwrap_or_else(|| Status::cancelled("call scope cancelled"))
    }
}

/// Relay frames from the caller to the backend.
///
/// Returning drops `outbound`, which half-closes the backend call when the
/// caller finished cleanly. If the backend stopped taking frames the loop ends
/// quietly: the backend's own status, seen downstream, decides the outcome.
pub(crate) async fn pump_upstream<S>(mut inbound: S, outbound: mpsc::Sender<Frame>, abort: Arc<Abort>)
where
    S: Stream<Item = Result<Frame, Status>> + Unpin,
{
    let mut relayed: u64 = 0;

    loop {
        let next = tokio::select! {
            _ = abort.cancelled() => return,
            next = inbound.next() => next,
        };

        match next {
            Some(Ok(frame)) => {
                tokio::select! {
                    _ = abort.cancelled() => return,
                    sent = outbound.send(frame) => {
                        if sent.is_err() {
                            debug!(frames = relayed, "Backend stopped accepting frames");
                            return;
                        }
                    }
                }
                relayed += 1;
            }
            None => {
                debug!(frames = relayed, "Caller closed its send side");
                return;
            }
            Some(Err(status)) => {
                debug!(frames = relayed, error = %status, "Caller stream failed");
                abort.abort(status);
                return;
            }
        }
    }
}

/// Relay frames from the backend to the caller.
///
/// Returns the outcome of the whole call: `Ok` when the backend finished with
/// an OK status, otherwise the status the caller was given.
///
/// Trailers of an OK end are handed to the caller as an `Ok`-coded status;
/// tonic writes it out as the caller's trailers with `grpc-status: 0`.
pub(crate) async fn pump_downstream<S>(
    mut outbound: S,
    inbound: mpsc::Sender<Result<Frame, Status>>,
    abort: Arc<Abort>,
) -> Result<(), Status>
where
    S: BackendStream,
{
    let mut relayed: u64 = 0;

    loop {
        let next = tokio::select! {
            _ = abort.cancelled() => return Err(deliver(&inbound, abort.reason()).await),
            _ = inbound.closed() => return Err(caller_gone(&abort)),
            next = outbound.next() => next,
        };

        match next {
            Some(Ok(frame)) => {
                tokio::select! {
                    _ = abort.cancelled() => return Err(deliver(&inbound, abort.reason()).await),
                    sent = inbound.send(Ok(frame)) => {
                        if sent.is_err() {
                            return Err(caller_gone(&abort));
                        }
                    }
                }
                relayed += 1;
            }
            None => {
                debug!(frames = relayed, "Backend finished");
                return match outbound.trailers().await {
                    Ok(Some(mut trailers)) => {
                        metadata::strip_transport_headers(&mut trailers);
                        if !trailers.is_empty() {
                            deliver(&inbound, Status::with_metadata(Code::Ok, "", trailers)).await;
                        }
                        Ok(())
                    }
                    Ok(None) => Ok(()),
                    Err(status) => {
                        abort.abort(status.clone());
                        Err(deliver(&inbound, status).await)
                    }
                };
            }
            Some(Err(status)) => {
                debug!(frames = relayed, code = ?status.code(), "Backend ended with an error status");
                abort.abort(status.clone());
                return Err(deliver(&inbound, status).await);
            }
        }
    }
}

// Hand the final status to the caller, unless the caller is already gone.
async fn deliver(inbound: &mpsc::Sender<Result<Frame, Status>>, status: Status) -> Status {
    tokio::select! {
        _ = inbound.send(Err(status.clone())) => {}
        _ = inbound.closed() => {}
    }
    status
}

fn caller_gone(abort: &Abort) -> Status {
    let status = Status::cancelled("caller cancelled the call");
    abort.abort(status.clone());
    status
}
