//! uniport: single-port reverse proxy core.
//!
//! Bridges a WebSocket-capable edge server with plain HTTP/1.1 backends
//! through one public port: the edge terminates external traffic and hands
//! every non-WebSocket request to this engine, which forwards it over a
//! pooled, pipelined, keep-alive connection set and streams the backend's
//! response back through the edge's reply surface, honoring backpressure in
//! both directions.
//!
//! The edge itself is an external collaborator; bindings implement the
//! [`edge::ReplyHandle`] and [`edge::EdgeRequestView`] traits and feed
//! request bodies through [`edge::BodyPipe`].

pub mod client;
pub mod config;
pub mod connection;
pub mod edge;
pub mod error;
pub mod headers;
pub mod parser;
pub mod pipeline;
pub mod proxy;
pub mod sender;
mod tls;

// Re-export commonly used types
pub use client::{Client, ForwardRequest};
pub use config::{
    BackendConfig, BackendTlsConfig, BackpressureConfig, ClientConfig, Config, EdgeConfig,
    Protocol, ProxyConfig,
};
pub use connection::ConnState;
pub use edge::{
    body_pipe, decode_request, BodyEvent, BodyPipe, BodyPipeFull, DecodedRequest, EdgeRequestView,
    ReplyHandle, RequestBody,
};
pub use error::{UniportError, UniportResult};
pub use headers::{HeaderValue, Headers};
pub use parser::{BodyReadMode, ParserEvent, ResponseParser};
pub use pipeline::{ForwardOutcome, Pipeline, PipelineEntry};
pub use proxy::{ErrorHook, ErrorResponse, Proxy};
pub use sender::RequestHead;
