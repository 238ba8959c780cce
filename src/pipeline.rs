//! Request/response pipeline for one backend connection.
//!
//! A FIFO queue of in-flight requests. Parser events always refer to the
//! oldest in-flight request (the queue head): HTTP/1.1 pipelining returns
//! responses in send order, so correlation is queue-head identity, not a
//! correlation id. The pipeline consumes the parser's typed events and moves
//! response bytes into each request's reply handle, honoring the edge's
//! backpressure signals.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::edge::ReplyHandle;
use crate::error::{UniportError, UniportResult};
use crate::headers::Headers;
use crate::parser::{BodyReadMode, ParserEvent};

/// Final outcome of one forwarded request.
///
/// When a request fails before the pipeline started writing its response,
/// the reply handle travels back with the error so the dispatcher can still
/// synthesize an HTTP error response on it.
pub enum ForwardOutcome {
    /// The backend's response was fully streamed to the edge (or drained
    /// into the void for a request the client had aborted).
    Delivered,
    /// The request failed. `reply` is present only if nothing was written
    /// to it yet.
    Failed {
        error: UniportError,
        reply: Option<Box<dyn ReplyHandle>>,
    },
}

/// One queued request awaiting (or receiving) its response.
pub struct PipelineEntry {
    reply: Box<dyn ReplyHandle>,
    done: Option<oneshot::Sender<ForwardOutcome>>,
    deadline: Instant,
    stale: bool,
    started_writing: bool,
    headers_received: bool,
    response_total: Option<usize>,
}

impl PipelineEntry {
    pub fn new(
        reply: Box<dyn ReplyHandle>,
        done: oneshot::Sender<ForwardOutcome>,
        deadline: Instant,
    ) -> Self {
        Self {
            reply,
            done: Some(done),
            deadline,
            stale: false,
            started_writing: false,
            headers_received: false,
            response_total: None,
        }
    }

    /// Recover the reply handle from an entry that was never queued.
    pub(crate) fn into_reply(self) -> Option<Box<dyn ReplyHandle>> {
        if self.started_writing {
            None
        } else {
            Some(self.reply)
        }
    }

    /// Fail an entry that never made it into a pipeline queue.
    pub(crate) fn fail(mut self, error: UniportError) {
        let reply = if self.started_writing || self.reply.is_aborted() {
            self.reply.close();
            None
        } else {
            Some(self.reply)
        };
        if let Some(done) = self.done.take() {
            let _ = done.send(ForwardOutcome::Failed { error, reply });
        }
    }
}

/// FIFO pipeline bounded by `max_requests`.
pub struct Pipeline {
    queue: VecDeque<PipelineEntry>,
    max_requests: usize,
    timeout: Duration,
    in_flight: Arc<AtomicUsize>,
    locked: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(
        max_requests: usize,
        timeout: Duration,
        in_flight: Arc<AtomicUsize>,
        locked: Arc<AtomicBool>,
    ) -> Self {
        Self {
            queue: VecDeque::new(),
            max_requests,
            timeout,
            in_flight,
            locked,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// False once the queue is full or the pipeline has locked itself after
    /// an until-close response.
    pub fn accepts_more_requests(&self) -> bool {
        !self.locked.load(Ordering::Relaxed) && self.queue.len() < self.max_requests
    }

    /// Deadline of the oldest request still waiting for response headers.
    pub fn head_deadline(&self) -> Option<Instant> {
        self.queue
            .iter()
            .find(|e| !e.headers_received)
            .map(|e| e.deadline)
    }

    /// Register a new entry at the queue tail. Entries arriving past the cap
    /// or after the pipeline locked fail immediately, with the reply handed
    /// back through their outcome channel.
    pub fn push(&mut self, entry: PipelineEntry) {
        if self.locked.load(Ordering::Relaxed) {
            self.complete(entry, Some(UniportError::StreamUntilCloseNotSupported));
            return;
        }
        if self.queue.len() >= self.max_requests {
            self.complete(
                entry,
                Some(UniportError::PipelineOverflow {
                    limit: self.max_requests,
                }),
            );
            return;
        }
        self.queue.push_back(entry);
    }

    /// Consume one parser event. An `Err` return is fatal for the owning
    /// connection; the caller tears it down and calls [`Pipeline::close`].
    pub async fn handle_event(&mut self, event: ParserEvent) -> UniportResult<()> {
        match event {
            ParserEvent::Headers {
                status,
                message,
                headers,
                ..
            } => self.on_headers(status, message, headers),
            ParserEvent::BodyReadMode { mode } => {
                self.on_body_read_mode(mode);
                Ok(())
            }
            ParserEvent::BodyChunk { data, is_last } => self.on_body_chunk(data, is_last).await,
            ParserEvent::Error { error } => Err(error),
        }
    }

    /// The head request timed out waiting for response headers.
    pub fn timeout_error(&self) -> UniportError {
        UniportError::timed_out(self.timeout)
    }

    fn on_headers(&mut self, status: u16, message: String, headers: Headers) -> UniportResult<()> {
        let entry = self.queue.front_mut().ok_or_else(|| {
            UniportError::conn_reset("response headers received with no request in flight")
        })?;
        entry.headers_received = true;
        entry.response_total = headers
            .get("content-length")
            .and_then(|v| v.trim().parse::<usize>().ok());

        if entry.reply.is_aborted() {
            entry.stale = true;
        }
        if entry.stale {
            debug!("discarding response headers for aborted request");
            return Ok(());
        }

        entry.reply.cork(&mut |r| {
            r.write_status(status, &message);
            for (name, value) in headers.iter() {
                // The edge re-frames the body and emits its own framing
                // headers.
                if name.eq_ignore_ascii_case("content-length")
                    || name.eq_ignore_ascii_case("transfer-encoding")
                {
                    continue;
                }
                r.write_header(name, value);
            }
        });
        entry.started_writing = true;
        Ok(())
    }

    fn on_body_read_mode(&mut self, mode: BodyReadMode) {
        if mode != BodyReadMode::UntilClose {
            return;
        }
        // An until-close body means responses behind the head can never
        // arrive on this connection.
        self.locked.store(true, Ordering::Relaxed);
        while self.queue.len() > 1 {
            let entry = self.queue.pop_back().expect("queue length checked");
            self.complete(entry, Some(UniportError::StreamUntilCloseNotSupported));
        }
        warn!("pipeline locked: backend response streams until connection close");
    }

    async fn on_body_chunk(&mut self, data: Bytes, is_last: bool) -> UniportResult<()> {
        let entry = self.queue.front_mut().ok_or_else(|| {
            UniportError::conn_reset("response body received with no request in flight")
        })?;
        if entry.reply.is_aborted() {
            entry.stale = true;
        }

        let mut terminate = false;
        if entry.stale {
            // Keep draining parser output so pipelined responses behind the
            // head stay correctly framed.
            terminate = is_last;
        } else if let Some(total) = entry.response_total {
            let mut pending = data;
            loop {
                let mut result = (false, false);
                entry.reply.cork(&mut |r| {
                    result = r.try_end(&pending, total);
                });
                entry.started_writing = true;
                let (accepted, done) = result;
                if done {
                    terminate = true;
                    break;
                }
                if accepted {
                    break;
                }
                let pending_offset = entry.reply.write_offset();
                match entry.reply.writable().await {
                    Some(offset) => {
                        let skip = offset.saturating_sub(pending_offset).min(pending.len());
                        pending = pending.slice(skip..);
                    }
                    None => {
                        entry.stale = true;
                        break;
                    }
                }
            }
            if is_last && !terminate {
                if !entry.stale {
                    entry.reply.cork(&mut |r| r.end(None));
                }
                terminate = true;
            }
        } else {
            if !data.is_empty() {
                let mut accepted = false;
                entry.reply.cork(&mut |r| {
                    accepted = r.write(&data);
                });
                entry.started_writing = true;
                if !accepted && entry.reply.writable().await.is_none() {
                    entry.stale = true;
                }
            }
            if is_last {
                if !entry.stale {
                    entry.reply.cork(&mut |r| r.end(None));
                }
                terminate = true;
            }
        }

        if terminate {
            let entry = self.queue.pop_front().expect("head entry present");
            self.complete(entry, None);
        }
        Ok(())
    }

    /// Drain the queue, failing every pending request with `error`. Replies
    /// that were never written travel back to the dispatcher; replies with a
    /// partial response are closed.
    pub fn close(&mut self, error: &UniportError) {
        while let Some(entry) = self.queue.pop_front() {
            self.complete(entry, Some(error.clone()));
        }
    }

    fn complete(&mut self, entry: PipelineEntry, error: Option<UniportError>) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        let PipelineEntry {
            mut reply,
            mut done,
            started_writing,
            ..
        } = entry;

        let outcome = match error {
            None => ForwardOutcome::Delivered,
            Some(error) => {
                let reply = if started_writing || reply.is_aborted() {
                    reply.close();
                    None
                } else {
                    Some(reply)
                };
                ForwardOutcome::Failed { error, reply }
            }
        };
        if let Some(done) = done.take() {
            let _ = done.send(outcome);
        }
    }
}
