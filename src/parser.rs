//! Streaming HTTP/1.1 response parser.
//!
//! A byte-driven state machine for server responses on a trusted channel.
//! [`ResponseParser::feed`] consumes any contiguous slice of response bytes
//! and pushes typed events; pipelined responses share the parser instance and
//! the same feed slice; once a response completes the parser re-arms itself
//! and keeps going with the remainder of the slice.
//!
//! Fatal errors (`INVALID_CONTENT_LENGTH`, `INVALID_CHUNK_SIZE`) require the
//! owning connection to be closed. Format leniencies (a solitary LF where
//! CRLF is expected) are tolerated and counted, not surfaced.

use bytes::Bytes;
use tracing::debug;

use crate::error::UniportError;
use crate::headers::Headers;

/// How the body of the current response is framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyReadMode {
    /// Exactly this many bytes follow the headers.
    Fixed(u64),
    /// `transfer-encoding: chunked` framing.
    Chunked,
    /// The body runs until the peer closes the connection. This mode breaks
    /// pipelining; the pipeline locks itself when it sees it.
    UntilClose,
}

/// Typed event stream produced by the parser.
#[derive(Debug, Clone)]
pub enum ParserEvent {
    /// The status line and header block of the next response are complete.
    Headers {
        version: String,
        status: u16,
        message: String,
        headers: Headers,
    },
    /// Fired exactly once per response, before any `BodyChunk`.
    BodyReadMode { mode: BodyReadMode },
    /// A slice of body bytes. The terminator for a zero-body response is an
    /// empty chunk with `is_last` set.
    BodyChunk { data: Bytes, is_last: bool },
    /// Terminal for the current response; the parser has re-armed itself.
    Error { error: UniportError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Version,
    StatusCode,
    StatusMessage,
    StatusLineAlmostDone,
    HeaderStart,
    HeaderName,
    HeaderSkipLf,
    HeaderValueStart,
    HeaderValue,
    HeaderValueAlmostDone,
    HeadersAlmostDone,
    BodyFixed,
    ChunkSize,
    ChunkExt,
    ChunkSizeAlmostDone,
    ChunkData,
    ChunkDataCr,
    ChunkDataLf,
    ChunkTrailerStart,
    ChunkTrailerLine,
    ChunkTrailerAlmostDone,
    UntilClose,
}

/// Streaming response parser. One instance per backend connection.
pub struct ResponseParser {
    state: State,
    scratch: Vec<u8>,
    name_scratch: Vec<u8>,
    version: String,
    status: u16,
    message: String,
    headers: Headers,
    body_remaining: u64,
    chunk_remaining: u64,
    lenient_newlines: u32,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseParser {
    pub fn new() -> Self {
        Self {
            state: State::Version,
            scratch: Vec::with_capacity(64),
            name_scratch: Vec::with_capacity(32),
            version: String::new(),
            status: 0,
            message: String::new(),
            headers: Headers::new(),
            body_remaining: 0,
            chunk_remaining: 0,
            lenient_newlines: 0,
        }
    }

    /// Return the parser to its initial state. Used after a fatal error or a
    /// forced pipeline tear-down.
    pub fn reset(&mut self) {
        self.rearm();
        self.lenient_newlines = 0;
    }

    /// Count of tolerated line endings (LF without a preceding CR) seen so
    /// far.
    pub fn lenient_newlines(&self) -> u32 {
        self.lenient_newlines
    }

    /// Re-arm for the next pipelined response, keeping diagnostics.
    fn rearm(&mut self) {
        self.state = State::Version;
        self.scratch.clear();
        self.name_scratch.clear();
        self.version.clear();
        self.status = 0;
        self.message.clear();
        self.headers = Headers::new();
        self.body_remaining = 0;
        self.chunk_remaining = 0;
    }

    /// Terminate an `UntilClose` body. Called by the connection when the
    /// peer closes the socket; a no-op in any other state.
    pub fn finish(&mut self, events: &mut Vec<ParserEvent>) {
        if self.state == State::UntilClose {
            events.push(ParserEvent::BodyChunk {
                data: Bytes::new(),
                is_last: true,
            });
            self.rearm();
        }
    }

    /// Consume a contiguous slice of response bytes, pushing events in
    /// on-wire order. An empty slice is a no-op. After a fatal error the
    /// remainder of the slice is discarded and the parser is reset.
    pub fn feed(&mut self, data: &[u8], events: &mut Vec<ParserEvent>) {
        let mut i = 0;
        while i < data.len() {
            let b = data[i];
            match self.state {
                State::Version => {
                    i += 1;
                    if b == b' ' {
                        self.version = take_string(&mut self.scratch);
                        self.state = State::StatusCode;
                    } else {
                        self.scratch.push(b);
                    }
                }
                State::StatusCode => {
                    i += 1;
                    match b {
                        b' ' => {
                            self.commit_status();
                            self.state = State::StatusMessage;
                        }
                        b'\r' => {
                            self.commit_status();
                            self.state = State::StatusLineAlmostDone;
                        }
                        b'\n' => {
                            self.commit_status();
                            self.lenient_newlines += 1;
                            self.state = State::HeaderStart;
                        }
                        _ => self.scratch.push(b),
                    }
                }
                State::StatusMessage => {
                    i += 1;
                    match b {
                        b'\r' => {
                            self.message = take_string(&mut self.scratch);
                            self.state = State::StatusLineAlmostDone;
                        }
                        b'\n' => {
                            self.message = take_string(&mut self.scratch);
                            self.lenient_newlines += 1;
                            self.state = State::HeaderStart;
                        }
                        _ => self.scratch.push(b),
                    }
                }
                State::StatusLineAlmostDone => {
                    if b == b'\n' {
                        i += 1;
                    } else {
                        self.lenient_newlines += 1;
                    }
                    self.state = State::HeaderStart;
                }
                State::HeaderStart => match b {
                    b'\r' => {
                        i += 1;
                        self.state = State::HeadersAlmostDone;
                    }
                    b'\n' => {
                        i += 1;
                        self.lenient_newlines += 1;
                        if !self.on_headers_complete(events) {
                            self.rearm();
                            return;
                        }
                    }
                    _ => self.state = State::HeaderName,
                },
                State::HeaderName => {
                    i += 1;
                    match b {
                        b':' => self.state = State::HeaderValueStart,
                        b'\r' => {
                            // Line without a colon: discard it.
                            self.name_scratch.clear();
                            self.state = State::HeaderSkipLf;
                        }
                        b'\n' => {
                            self.name_scratch.clear();
                            self.lenient_newlines += 1;
                            self.state = State::HeaderStart;
                        }
                        _ => self.name_scratch.push(b.to_ascii_lowercase()),
                    }
                }
                State::HeaderSkipLf => {
                    if b == b'\n' {
                        i += 1;
                    } else {
                        self.lenient_newlines += 1;
                    }
                    self.state = State::HeaderStart;
                }
                State::HeaderValueStart => {
                    if b == b' ' {
                        i += 1;
                    }
                    self.state = State::HeaderValue;
                }
                State::HeaderValue => {
                    i += 1;
                    match b {
                        b'\r' => self.state = State::HeaderValueAlmostDone,
                        b'\n' => {
                            self.lenient_newlines += 1;
                            self.commit_header();
                            self.state = State::HeaderStart;
                        }
                        _ => self.scratch.push(b),
                    }
                }
                State::HeaderValueAlmostDone => {
                    if b == b'\n' {
                        i += 1;
                    } else {
                        self.lenient_newlines += 1;
                    }
                    self.commit_header();
                    self.state = State::HeaderStart;
                }
                State::HeadersAlmostDone => {
                    if b == b'\n' {
                        i += 1;
                    } else {
                        self.lenient_newlines += 1;
                    }
                    if !self.on_headers_complete(events) {
                        self.rearm();
                        return;
                    }
                }
                State::BodyFixed => {
                    let avail = data.len() - i;
                    let take = (self.body_remaining as usize).min(avail);
                    self.body_remaining -= take as u64;
                    let is_last = self.body_remaining == 0;
                    events.push(ParserEvent::BodyChunk {
                        data: Bytes::copy_from_slice(&data[i..i + take]),
                        is_last,
                    });
                    i += take;
                    if is_last {
                        self.rearm();
                    }
                }
                State::ChunkSize => {
                    i += 1;
                    match b {
                        b';' => self.state = State::ChunkExt,
                        b'\r' => self.state = State::ChunkSizeAlmostDone,
                        b'\n' => {
                            self.lenient_newlines += 1;
                            if !self.commit_chunk_size(events) {
                                self.rearm();
                                return;
                            }
                        }
                        _ => self.scratch.push(b),
                    }
                }
                State::ChunkExt => {
                    i += 1;
                    match b {
                        b'\r' => self.state = State::ChunkSizeAlmostDone,
                        b'\n' => {
                            self.lenient_newlines += 1;
                            if !self.commit_chunk_size(events) {
                                self.rearm();
                                return;
                            }
                        }
                        _ => {} // chunk extensions are ignored
                    }
                }
                State::ChunkSizeAlmostDone => {
                    if b == b'\n' {
                        i += 1;
                    } else {
                        self.lenient_newlines += 1;
                    }
                    if !self.commit_chunk_size(events) {
                        self.rearm();
                        return;
                    }
                }
                State::ChunkData => {
                    let avail = data.len() - i;
                    let take = (self.chunk_remaining as usize).min(avail);
                    self.chunk_remaining -= take as u64;
                    events.push(ParserEvent::BodyChunk {
                        data: Bytes::copy_from_slice(&data[i..i + take]),
                        is_last: false,
                    });
                    i += take;
                    if self.chunk_remaining == 0 {
                        self.state = State::ChunkDataCr;
                    }
                }
                State::ChunkDataCr => {
                    i += 1;
                    match b {
                        b'\r' => self.state = State::ChunkDataLf,
                        b'\n' => {
                            self.lenient_newlines += 1;
                            self.state = State::ChunkSize;
                        }
                        _ => self.lenient_newlines += 1,
                    }
                }
                State::ChunkDataLf => {
                    i += 1;
                    if b == b'\n' {
                        self.state = State::ChunkSize;
                    } else {
                        self.lenient_newlines += 1;
                    }
                }
                State::ChunkTrailerStart => {
                    i += 1;
                    match b {
                        b'\r' => self.state = State::ChunkTrailerAlmostDone,
                        b'\n' => {
                            self.lenient_newlines += 1;
                            self.finish_chunked(events);
                        }
                        _ => self.state = State::ChunkTrailerLine,
                    }
                }
                State::ChunkTrailerLine => {
                    i += 1;
                    if b == b'\n' {
                        self.state = State::ChunkTrailerStart;
                    }
                }
                State::ChunkTrailerAlmostDone => {
                    if b == b'\n' {
                        i += 1;
                    } else {
                        self.lenient_newlines += 1;
                    }
                    self.finish_chunked(events);
                }
                State::UntilClose => {
                    events.push(ParserEvent::BodyChunk {
                        data: Bytes::copy_from_slice(&data[i..]),
                        is_last: false,
                    });
                    i = data.len();
                }
            }
        }
    }

    fn commit_status(&mut self) {
        let text = take_string(&mut self.scratch);
        self.status = match text.parse::<u16>() {
            Ok(code) => code,
            Err(_) => {
                debug!("unparseable status code {:?}, treating as 0", text);
                0
            }
        };
    }

    fn commit_header(&mut self) {
        let name = take_string(&mut self.name_scratch);
        let value = take_string(&mut self.scratch);
        if !name.is_empty() {
            self.headers.append(name, value);
        }
    }

    /// Resolve the body framing and emit `Headers` + `BodyReadMode` (and the
    /// terminator chunk for zero-length bodies). Returns false on a fatal
    /// error, in which case the caller resets and discards the feed tail.
    fn on_headers_complete(&mut self, events: &mut Vec<ParserEvent>) -> bool {
        let chunked = self
            .headers
            .get_all("transfer-encoding")
            .any(|v| v.to_ascii_lowercase().contains("chunked"));
        if chunked {
            self.headers.remove("content-length");
        }

        let no_body = matches!(self.status, 100..=199 | 204 | 304);

        let mode = if no_body {
            BodyReadMode::Fixed(0)
        } else if chunked {
            BodyReadMode::Chunked
        } else if let Some(value) = self.headers.get("content-length") {
            match value.trim().parse::<u64>() {
                Ok(n) => BodyReadMode::Fixed(n),
                Err(_) => {
                    events.push(ParserEvent::Error {
                        error: UniportError::InvalidContentLength {
                            value: value.to_string(),
                        },
                    });
                    return false;
                }
            }
        } else if matches!(self.status, 302 | 307) {
            // Redirects without a body hint carry no body.
            BodyReadMode::Fixed(0)
        } else {
            BodyReadMode::UntilClose
        };

        events.push(ParserEvent::Headers {
            version: std::mem::take(&mut self.version),
            status: self.status,
            message: std::mem::take(&mut self.message),
            headers: std::mem::take(&mut self.headers),
        });
        events.push(ParserEvent::BodyReadMode { mode });

        match mode {
            BodyReadMode::Fixed(0) => {
                events.push(ParserEvent::BodyChunk {
                    data: Bytes::new(),
                    is_last: true,
                });
                self.rearm();
            }
            BodyReadMode::Fixed(n) => {
                self.body_remaining = n;
                self.state = State::BodyFixed;
            }
            BodyReadMode::Chunked => self.state = State::ChunkSize,
            BodyReadMode::UntilClose => self.state = State::UntilClose,
        }
        true
    }

    /// Parse the accumulated hex chunk-size line. Returns false on a fatal
    /// error.
    fn commit_chunk_size(&mut self, events: &mut Vec<ParserEvent>) -> bool {
        let text = take_string(&mut self.scratch);
        let trimmed = text.trim();
        match u64::from_str_radix(trimmed, 16) {
            Ok(0) => {
                self.state = State::ChunkTrailerStart;
                true
            }
            Ok(size) => {
                self.chunk_remaining = size;
                self.state = State::ChunkData;
                true
            }
            Err(_) => {
                events.push(ParserEvent::Error {
                    error: UniportError::InvalidChunkSize {
                        value: trimmed.to_string(),
                    },
                });
                false
            }
        }
    }

    fn finish_chunked(&mut self, events: &mut Vec<ParserEvent>) {
        events.push(ParserEvent::BodyChunk {
            data: Bytes::new(),
            is_last: true,
        });
        self.rearm();
    }
}

fn take_string(scratch: &mut Vec<u8>) -> String {
    let bytes = std::mem::take(scratch);
    String::from_utf8_lossy(&bytes).into_owned()
}
