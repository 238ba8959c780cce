//! Request dispatcher.
//!
//! Sits between the edge and the pool: decodes the edge request, rewrites
//! the forwarding headers, hands the request to the [`Client`], and turns
//! failures into HTTP error responses on the reply handle. The edge binding
//! registers one handler per configured `(method, route)` pair; the edge
//! offers no way to remove listeners, so registration happens once at
//! startup.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::client::{Client, ForwardRequest};
use crate::config::{BackendConfig, EdgeConfig, ProxyConfig};
use crate::edge::decode::{decode_request, DecodedRequest};
use crate::edge::reply::{status_message, write_plain_response};
use crate::edge::{EdgeRequestView, ReplyHandle, RequestBody};
use crate::error::UniportError;
use crate::headers::Headers;
use crate::pipeline::ForwardOutcome;

/// Custom response produced by an [`ErrorHook`].
#[derive(Debug, Clone)]
pub struct ErrorResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: String,
}

/// Caller-provided override for synthesized error responses. Returning
/// `Ok(None)` keeps the default; a hook error is logged and the default is
/// used.
#[async_trait]
pub trait ErrorHook: Send + Sync {
    async fn on_error(
        &self,
        error: &UniportError,
        request: &DecodedRequest,
    ) -> anyhow::Result<Option<ErrorResponse>>;
}

/// The forwarding dispatcher.
pub struct Proxy {
    client: Client,
    edge: EdgeConfig,
    backend: BackendConfig,
    config: ProxyConfig,
    hook: Option<Arc<dyn ErrorHook>>,
}

impl Proxy {
    pub fn new(
        client: Client,
        edge: EdgeConfig,
        backend: BackendConfig,
        config: ProxyConfig,
    ) -> Self {
        Self {
            client,
            edge,
            backend,
            config,
            hook: None,
        }
    }

    pub fn with_error_hook(mut self, hook: Arc<dyn ErrorHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// `(method, pattern)` pairs the edge binding must register handlers
    /// for.
    pub fn routes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.config
            .routes
            .iter()
            .map(|(method, pattern)| (method.as_str(), pattern.as_str()))
    }

    /// Capacity edge bindings should use when creating request body pipes.
    pub fn max_stacked_buffers(&self) -> usize {
        self.config.backpressure.max_stacked_buffers
    }

    /// Entry point for one edge request.
    pub async fn handle(
        &self,
        reply: Box<dyn ReplyHandle>,
        view: &dyn EdgeRequestView,
        body: Option<RequestBody>,
    ) {
        let decoded = decode_request(view, reply.as_ref());
        self.forward(decoded, reply, body).await;
    }

    /// Forward an already-decoded request.
    pub async fn forward(
        &self,
        mut decoded: DecodedRequest,
        reply: Box<dyn ReplyHandle>,
        body: Option<RequestBody>,
    ) {
        metrics::counter!("uniport_proxy_requests_total").increment(1);
        self.rewrite_headers(&mut decoded);
        debug!("forwarding {} {}", decoded.method, decoded.url);

        let request = ForwardRequest {
            method: decoded.method.clone(),
            path: decoded.path(),
            protocol: self.backend.protocol,
            host: self.backend.host.clone(),
            port: self.backend.port,
            headers: decoded.headers.clone(),
            reply,
            body,
            timeout: self.config.timeout(),
        };

        match self.client.request(request).await {
            ForwardOutcome::Delivered => {}
            ForwardOutcome::Failed {
                error,
                reply: Some(reply),
            } => {
                metrics::counter!("uniport_proxy_errors_total").increment(1);
                self.respond_error(error, &decoded, reply).await;
            }
            ForwardOutcome::Failed { error, reply: None } => {
                metrics::counter!("uniport_proxy_errors_total").increment(1);
                warn!(
                    "{} {} failed after the response started: {}",
                    decoded.method, decoded.url, error
                );
            }
        }
    }

    /// Proxy header rewriting: append this hop to the `x-forwarded-*` set
    /// and strip the hop-by-hop headers the sender owns.
    fn rewrite_headers(&self, decoded: &mut DecodedRequest) {
        let headers = &mut decoded.headers;

        if let Some(addr) = &decoded.remote_address {
            append_forwarded(headers, "x-forwarded-for", addr);
        }
        append_forwarded(headers, "x-forwarded-port", &self.edge.port.to_string());
        append_forwarded(headers, "x-forwarded-proto", self.edge.public_protocol());
        if !headers.contains("x-forwarded-host") {
            if let Some(host) = headers.get("host").map(str::to_string) {
                headers.insert("x-forwarded-host", host);
            }
        }

        headers.remove("connection");
        headers.remove("keep-alive");

        for (name, value) in &self.config.headers {
            headers.insert(name.clone(), value.clone());
        }
    }

    async fn respond_error(
        &self,
        error: UniportError,
        request: &DecodedRequest,
        mut reply: Box<dyn ReplyHandle>,
    ) {
        warn!(
            "{} {} failed: {} ({})",
            request.method,
            request.url,
            error,
            error.code()
        );

        let custom = match &self.hook {
            Some(hook) => match hook.on_error(&error, request).await {
                Ok(custom) => custom,
                Err(hook_error) => {
                    warn!("error hook failed, using default response: {}", hook_error);
                    None
                }
            },
            None => None,
        };

        let (status, headers, body) = match custom {
            Some(response) => (response.status, response.headers, response.body),
            None => {
                let status = error.http_status().unwrap_or(500);
                (
                    status,
                    Headers::new(),
                    format!("{} ({})", error, error.code()),
                )
            }
        };

        write_plain_response(
            reply.as_mut(),
            status,
            status_message(status),
            &headers,
            &body,
        );
    }
}

/// Append a hop value to a comma-joined forwarding header.
fn append_forwarded(headers: &mut Headers, name: &str, value: &str) {
    match headers.get(name).map(str::to_string) {
        Some(existing) if !existing.is_empty() => {
            headers.insert(name, format!("{}, {}", existing, value));
        }
        _ => headers.insert(name, value),
    }
}
