//! Reply-handle write helpers for synthesized responses.
//!
//! The pipeline streams backend responses through the reply handle itself;
//! these helpers cover the other writer, the dispatcher's error path, and
//! the sender's too-busy rejection. All writes are best-effort: a reply that
//! was already ended or aborted swallows them.

use tracing::debug;

use crate::headers::Headers;

use super::ReplyHandle;

/// Reason phrase for the statuses uniport synthesizes itself.
pub fn status_message(status: u16) -> &'static str {
    match status {
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}

/// Write a complete plain-text response through the reply handle, corked.
pub fn write_plain_response(
    reply: &mut dyn ReplyHandle,
    status: u16,
    message: &str,
    headers: &Headers,
    body: &str,
) {
    if reply.is_aborted() {
        debug!("skipping synthesized {} response: reply already aborted", status);
        return;
    }
    reply.cork(&mut |r| {
        r.write_status(status, message);
        let mut has_content_type = false;
        for (name, value) in headers.iter() {
            if name.eq_ignore_ascii_case("content-type") {
                has_content_type = true;
            }
            r.write_header(name, value);
        }
        if !has_content_type {
            r.write_header("content-type", "text/plain");
        }
        r.end(Some(body.as_bytes()));
    });
}

/// Answer 504 because the bounded buffer of stacked request-body chunks is
/// exhausted. Called by edge bindings when [`super::BodyPipe::push`] fails.
pub fn respond_too_busy(reply: &mut dyn ReplyHandle) {
    write_plain_response(
        reply,
        504,
        status_message(504),
        &Headers::new(),
        "the server is too busy to handle your request",
    );
}
