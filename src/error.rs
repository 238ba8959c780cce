use std::time::Duration;

use thiserror::Error;

/// Main error type for the uniport forwarding engine.
///
/// Every failure that can surface from the backend link carries one of the
/// canonical codes returned by [`UniportError::code`]; the proxy dispatcher
/// maps a subset of them onto HTTP error responses via
/// [`UniportError::http_status`].
#[derive(Error, Debug, Clone)]
pub enum UniportError {
    /// The backend reset the TCP connection
    #[error("Connection reset: {message}")]
    ConnReset { message: String },

    /// The connection was aborted locally (pool shutdown, forced close)
    #[error("Connection aborted: {message}")]
    ConnAborted { message: String },

    /// The backend refused the connection
    #[error("Connection refused: {message}")]
    ConnRefused { message: String },

    /// The request body pipe failed while streaming to the backend
    #[error("Request body stream failed ({code}): {message}")]
    BodyStream { code: String, message: String },

    /// The backend did not produce response headers within the deadline
    #[error("Backend did not respond within {duration:?}")]
    TimedOut { duration: Duration },

    /// The backend closed the connection in the middle of a response
    #[error("Backend aborted mid-response: {message}")]
    RecipientAborted { message: String },

    /// Response carried an unparseable content-length header
    #[error("Invalid content-length in response: {value:?}")]
    InvalidContentLength { value: String },

    /// Chunked response carried an unparseable chunk-size line
    #[error("Invalid chunk size in response: {value:?}")]
    InvalidChunkSize { value: String },

    /// The per-connection pipeline queue is full
    #[error("Pipeline queue is full ({limit} requests in flight)")]
    PipelineOverflow { limit: usize },

    /// The per-host connection cap is reached and no connection is available
    #[error("Connection cap reached for {key} ({limit} connections)")]
    MaxConnections { key: String, limit: usize },

    /// The backend answered without a length hint; pipelining cannot continue
    #[error(
        "Backend response streams until close; pipelining is not supported on this connection"
    )]
    StreamUntilCloseNotSupported,

    /// The pool was closed and no longer accepts requests
    #[error("Client pool is closed")]
    PoolClosed,

    /// Send was attempted on a connection that is not in the Connected state
    #[error("Connection is not established: {state}")]
    NotConnected { state: &'static str },

    /// Configuration related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// TLS setup or handshake errors on the backend link
    #[error("TLS error: {message}")]
    Tls { message: String },

    /// Uncategorized IO errors
    #[error("IO error: {message}")]
    Io { message: String },
}

impl UniportError {
    /// Create a connection reset error
    pub fn conn_reset<S: Into<String>>(message: S) -> Self {
        Self::ConnReset {
            message: message.into(),
        }
    }

    /// Create a connection aborted error
    pub fn conn_aborted<S: Into<String>>(message: S) -> Self {
        Self::ConnAborted {
            message: message.into(),
        }
    }

    /// Create a connection refused error
    pub fn conn_refused<S: Into<String>>(message: S) -> Self {
        Self::ConnRefused {
            message: message.into(),
        }
    }

    /// Create a request body stream error, keeping the originating code
    pub fn body_stream<C: Into<String>, S: Into<String>>(code: C, message: S) -> Self {
        Self::BodyStream {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Create a backend timeout error
    pub fn timed_out(duration: Duration) -> Self {
        Self::TimedOut { duration }
    }

    /// Create a backend-aborted error
    pub fn recipient_aborted<S: Into<String>>(message: S) -> Self {
        Self::RecipientAborted {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a TLS error
    pub fn tls<S: Into<String>>(message: S) -> Self {
        Self::Tls {
            message: message.into(),
        }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Canonical code for this error, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            UniportError::ConnReset { .. } => "CONN_RESET",
            UniportError::ConnAborted { .. } => "CONN_ABORTED",
            UniportError::ConnRefused { .. } => "CONN_REFUSED",
            UniportError::BodyStream { .. } => "BODY_STREAM",
            UniportError::TimedOut { .. } => "TIMED_OUT",
            UniportError::RecipientAborted { .. } => "RECIPIENT_ABORTED",
            UniportError::InvalidContentLength { .. } => "INVALID_CONTENT_LENGTH",
            UniportError::InvalidChunkSize { .. } => "INVALID_CHUNK_SIZE",
            UniportError::PipelineOverflow { .. } => "PIPELINE_OVERFLOW",
            UniportError::MaxConnections { .. } => "MAX_CONNECTIONS",
            UniportError::StreamUntilCloseNotSupported => "STREAM_UNTIL_CLOSE_NOT_SUPPORTED",
            UniportError::PoolClosed => "POOL_CLOSED",
            UniportError::NotConnected { .. } => "NOT_CONNECTED",
            UniportError::Config { .. } => "CONFIG",
            UniportError::Tls { .. } => "TLS",
            UniportError::Io { .. } => "IO",
        }
    }

    /// HTTP status the proxy answers with when this error reaches a request
    /// whose reply was never started. `None` means the error stays with the
    /// caller and the dispatcher falls back to 500.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            UniportError::ConnReset { .. }
            | UniportError::ConnAborted { .. }
            | UniportError::ConnRefused { .. }
            | UniportError::BodyStream { .. }
            | UniportError::NotConnected { .. }
            | UniportError::Io { .. }
            | UniportError::Tls { .. } => Some(503),
            UniportError::TimedOut { .. } => Some(504),
            UniportError::RecipientAborted { .. }
            | UniportError::InvalidContentLength { .. }
            | UniportError::InvalidChunkSize { .. } => Some(502),
            UniportError::PipelineOverflow { .. }
            | UniportError::MaxConnections { .. }
            | UniportError::StreamUntilCloseNotSupported
            | UniportError::PoolClosed
            | UniportError::Config { .. } => None,
        }
    }

    /// Whether this error must tear down the owning connection.
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(
            self,
            UniportError::ConnReset { .. }
                | UniportError::ConnRefused { .. }
                | UniportError::RecipientAborted { .. }
                | UniportError::InvalidContentLength { .. }
                | UniportError::InvalidChunkSize { .. }
                | UniportError::TimedOut { .. }
                | UniportError::StreamUntilCloseNotSupported
                | UniportError::Io { .. }
                | UniportError::Tls { .. }
        )
    }
}

/// Result type alias for uniport operations
pub type UniportResult<T> = Result<T, UniportError>;

/// Convert from std::io::Error, mapping socket-level kinds onto the
/// canonical codes. OS-level timeouts stay socket-layer `Io` errors;
/// `TimedOut` is reserved for the response-header deadline, which knows the
/// configured duration.
impl From<std::io::Error> for UniportError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused => UniportError::conn_refused(err.to_string()),
            ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => {
                UniportError::conn_reset(err.to_string())
            }
            ErrorKind::ConnectionAborted => UniportError::recipient_aborted(err.to_string()),
            _ => UniportError::io(err.to_string()),
        }
    }
}

impl From<toml::de::Error> for UniportError {
    fn from(err: toml::de::Error) -> Self {
        UniportError::config(format!("TOML parsing error: {}", err))
    }
}

impl From<rustls::Error> for UniportError {
    fn from(err: rustls::Error) -> Self {
        UniportError::tls(err.to_string())
    }
}
