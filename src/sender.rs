//! Request serialization onto a backend socket.
//!
//! The sender task owns the write half of one backend connection. For each
//! job it registers the pipeline entry first, writes the request head, then
//! streams the request body from the edge's body pipe. Registration before
//! the head write is what keeps parser events matched to the right entry:
//! a response can only arrive after its head reached the backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::edge::{BodyEvent, RequestBody};
use crate::error::{UniportError, UniportResult};
use crate::headers::Headers;
use crate::pipeline::PipelineEntry;

/// Everything needed to write one request to the wire.
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub host: String,
    pub port: u16,
    pub headers: Headers,
}

/// One unit of work for the sender task.
pub(crate) struct SendJob {
    pub head: RequestHead,
    pub body: Option<RequestBody>,
    pub entry: PipelineEntry,
}

impl std::fmt::Debug for SendJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendJob").finish_non_exhaustive()
    }
}

/// Serialize the request head. The sender owns the `host` and `connection`
/// lines; matching headers from the forwarded set are dropped here.
pub fn serialize_head(head: &RequestHead) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(head.method.as_bytes());
    out.push(b' ');
    out.extend_from_slice(head.path.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\nhost: ");
    out.extend_from_slice(head.host.as_bytes());
    out.push(b':');
    out.extend_from_slice(head.port.to_string().as_bytes());
    out.extend_from_slice(b"\r\nconnection: keep-alive\r\n");

    for (name, value) in head.headers.iter() {
        if name.eq_ignore_ascii_case("host")
            || name.eq_ignore_ascii_case("connection")
            || name.eq_ignore_ascii_case("keep-alive")
        {
            continue;
        }
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Body framing the sender must honor on the wire.
struct BodyFraming {
    chunked: bool,
    content_length: Option<u64>,
}

impl BodyFraming {
    fn of(headers: &Headers) -> Self {
        let chunked = headers
            .get_all("transfer-encoding")
            .any(|v| v.to_ascii_lowercase().contains("chunked"));
        let content_length = headers
            .get("content-length")
            .and_then(|v| v.trim().parse::<u64>().ok());
        Self {
            chunked,
            content_length,
        }
    }
}

/// Drive the sender side of one connection until the job channel closes or
/// the socket fails.
pub(crate) async fn run_sender<W>(
    socket: &mut W,
    jobs: &mut mpsc::UnboundedReceiver<SendJob>,
    entries: &mpsc::UnboundedSender<PipelineEntry>,
    in_flight: &Arc<AtomicUsize>,
) -> UniportResult<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(job) = jobs.recv().await {
        let SendJob { head, body, entry } = job;

        if let Err(returned) = entries.send(entry) {
            in_flight.fetch_sub(1, Ordering::Relaxed);
            returned
                .0
                .fail(UniportError::conn_aborted("connection is shutting down"));
            return Ok(());
        }

        let head_bytes = serialize_head(&head);
        socket.write_all(&head_bytes).await?;

        if let Some(mut body) = body {
            stream_body(socket, &mut body, BodyFraming::of(&head.headers)).await?;
        }
    }
    Ok(())
}

/// Stream request body chunks onto the socket, re-framing for chunked
/// transfer encoding and compensating for aborted bodies so the connection's
/// pipeline framing survives.
async fn stream_body<W>(
    socket: &mut W,
    body: &mut RequestBody,
    framing: BodyFraming,
) -> UniportResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut written: u64 = 0;
    loop {
        match body.next().await {
            Some(BodyEvent::Chunk(data, is_last)) => {
                if !data.is_empty() {
                    if framing.chunked {
                        write_chunk_frame(socket, &data).await?;
                    } else {
                        socket.write_all(&data).await?;
                    }
                    written += data.len() as u64;
                }
                if is_last {
                    if framing.chunked {
                        socket.write_all(b"0\r\n\r\n").await?;
                    }
                    return Ok(());
                }
            }
            Some(BodyEvent::Aborted) => {
                debug!("request body aborted after {} bytes", written);
                return compensate_abort(socket, &framing, written).await;
            }
            Some(BodyEvent::Failed(code)) => {
                warn!("request body pipe failed ({})", code);
                return compensate_abort(socket, &framing, written).await;
            }
            None => {
                debug!("request body pipe dropped after {} bytes", written);
                return compensate_abort(socket, &framing, written).await;
            }
        }
    }
}

async fn write_chunk_frame<W>(socket: &mut W, data: &Bytes) -> UniportResult<()>
where
    W: AsyncWrite + Unpin,
{
    let size_line = format!("{:x}\r\n", data.len());
    socket.write_all(size_line.as_bytes()).await?;
    socket.write_all(data).await?;
    socket.write_all(b"\r\n").await?;
    Ok(())
}

/// Keep the wire framing intact when a body source dies early. Aborting the
/// TCP connection instead would kill every pipelined request on it.
async fn compensate_abort<W>(
    socket: &mut W,
    framing: &BodyFraming,
    written: u64,
) -> UniportResult<()>
where
    W: AsyncWrite + Unpin,
{
    if let Some(total) = framing.content_length {
        let mut remaining = total.saturating_sub(written);
        if remaining > 0 {
            debug!("padding aborted request body with {} zero bytes", remaining);
            let zeros = [0u8; 8192];
            while remaining > 0 {
                let take = (remaining as usize).min(zeros.len());
                socket.write_all(&zeros[..take]).await?;
                remaining -= take as u64;
            }
        }
    } else if framing.chunked {
        socket.write_all(b"0\r\n\r\n").await?;
    }
    Ok(())
}
