//! Edge-facing surfaces.
//!
//! The edge server (the single public port terminating WebSocket and HTTP
//! traffic) is an external collaborator. This module defines the capability
//! traits an edge binding implements (the per-request reply handle and the
//! request header view) plus the bounded body pipe an edge binding uses to
//! stream a request body into the forwarding engine.

pub mod decode;
pub mod reply;
#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

pub use decode::{decode_request, DecodedRequest};

/// Per-request reply capability handed over by the edge.
///
/// The handle is single-owner with a strict lifecycle: it is written to for
/// exactly one response, only from within a [`cork`](ReplyHandle::cork)
/// scope, and only by whichever of the pipeline or the dispatcher error path
/// is acting. Write methods mirror the edge's native backpressure contract:
/// `write` returns `false` when the edge buffered the chunk but wants the
/// producer to pause; `try_end` returns `(accepted, done)` and accepts
/// nothing when backpressured.
#[async_trait]
pub trait ReplyHandle: Send {
    /// Write the response status. Must precede any header or body write.
    fn write_status(&mut self, status: u16, message: &str);

    /// Write one response header.
    fn write_header(&mut self, name: &str, value: &str);

    /// Stream a body chunk without a known total size. Returns `false` when
    /// the producer must pause until [`writable`](ReplyHandle::writable).
    fn write(&mut self, chunk: &[u8]) -> bool;

    /// Write a body chunk with the response's total size known up front.
    /// Returns `(accepted, done)`; when not accepted, nothing was written
    /// and the producer retries from the reported write offset after the
    /// next writable signal.
    fn try_end(&mut self, chunk: &[u8], total_size: usize) -> (bool, bool);

    /// Finish the response, optionally with a final chunk.
    fn end(&mut self, chunk: Option<&[u8]>);

    /// Number of body bytes the edge has accepted so far.
    fn write_offset(&self) -> usize;

    /// Whether the client aborted this reply.
    fn is_aborted(&self) -> bool;

    /// Remote address of the originating client, when the edge exposes it.
    fn remote_address(&self) -> Option<String>;

    /// Run `f` with writes coalesced into a single edge syscall where the
    /// edge supports it. Implementations without native corking call `f`
    /// directly.
    fn cork(&mut self, f: &mut dyn FnMut(&mut dyn ReplyHandle));

    /// Forcibly close the underlying reply without a valid response.
    fn close(&mut self);

    /// Wait until the edge can accept more body bytes. Resolves with the
    /// current write offset, or `None` once the reply has been aborted.
    async fn writable(&mut self) -> Option<usize>;
}

/// Read-only view of a decoded edge request's head.
pub trait EdgeRequestView {
    fn method(&self) -> &str;
    fn url(&self) -> &str;
    fn query(&self) -> &str;
    fn for_each_header(&self, f: &mut dyn FnMut(&str, &str));
}

/// One event on the request body pipe.
#[derive(Debug, Clone)]
pub enum BodyEvent {
    /// A body chunk, with the edge's end-of-stream marker.
    Chunk(Bytes, bool),
    /// The client aborted the request before the body completed.
    Aborted,
    /// The edge-side body source failed; carries the originating code.
    Failed(String),
}

/// Consumer half of a request body pipe. Owned by the request sender.
pub struct RequestBody {
    rx: mpsc::Receiver<BodyEvent>,
}

impl RequestBody {
    /// Next body event, or `None` when the producer went away.
    pub async fn next(&mut self) -> Option<BodyEvent> {
        self.rx.recv().await
    }
}

/// Producer half of a request body pipe. Held by the edge binding.
#[derive(Clone)]
pub struct BodyPipe {
    tx: mpsc::Sender<BodyEvent>,
}

/// The bounded stack of not-yet-forwarded body chunks is full; the server is
/// too busy to take this request.
#[derive(Debug)]
pub struct BodyPipeFull;

impl std::fmt::Display for BodyPipeFull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("request body pipe is full")
    }
}

impl std::error::Error for BodyPipeFull {}

impl BodyPipe {
    /// Push one chunk. Fails with [`BodyPipeFull`] when the bounded buffer
    /// of stacked chunks is exhausted, at which point the edge binding
    /// answers 504 via [`reply::respond_too_busy`] and stops feeding.
    pub fn push(&self, chunk: Bytes, is_last: bool) -> Result<(), BodyPipeFull> {
        self.tx
            .try_send(BodyEvent::Chunk(chunk, is_last))
            .map_err(|_| BodyPipeFull)
    }

    /// Signal that the client aborted the request body.
    pub fn abort(&self) {
        // An abort that races a full pipe is indistinguishable from the
        // producer going away, which the sender also treats as an abort.
        let _ = self.tx.try_send(BodyEvent::Aborted);
    }

    /// Signal a body source failure, keeping the originating code.
    pub fn fail(&self, code: &str) {
        let _ = self.tx.try_send(BodyEvent::Failed(code.to_string()));
    }
}

/// Create a request body pipe bounded at `capacity` stacked chunks.
pub fn body_pipe(capacity: usize) -> (BodyPipe, RequestBody) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (BodyPipe { tx }, RequestBody { rx })
}
