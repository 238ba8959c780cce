//! Keyed backend connection pool.
//!
//! One pool serves any number of `host:port` keys. Below the per-key cap a
//! new connection is opened eagerly (head-of-line blocking on a pipelined
//! connection is worse than an extra socket), and at the cap one of the
//! available connections is picked uniformly at random. A periodic watcher
//! evicts connections that sat idle past the configured age.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rand::Rng;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::{BackendTlsConfig, ClientConfig, Protocol};
use crate::connection::{ConnectTarget, Connection, ConnectionOptions};
use crate::edge::{ReplyHandle, RequestBody};
use crate::error::{UniportError, UniportResult};
use crate::headers::Headers;
use crate::pipeline::{ForwardOutcome, PipelineEntry};
use crate::sender::{RequestHead, SendJob};
use crate::tls;

/// Fallback response-header deadline when a request does not carry one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// A logical request handed to the pool for forwarding.
pub struct ForwardRequest {
    pub method: String,
    pub path: String,
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub headers: Headers,
    pub reply: Box<dyn ReplyHandle>,
    pub body: Option<RequestBody>,
    /// Deadline for the backend's response headers.
    pub timeout: Duration,
}

/// Pooled, pipelining HTTP/1.1 client for the backend link.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    tls_options: BackendTlsConfig,
    tls_config: Mutex<Option<Arc<rustls::ClientConfig>>>,
    pool: Mutex<HashMap<String, Vec<Connection>>>,
    closed: AtomicBool,
    next_id: AtomicU64,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_tls(config, BackendTlsConfig::default())
    }

    /// Create a pool whose HTTPS connections use the given TLS options.
    pub fn with_tls(config: ClientConfig, tls_options: BackendTlsConfig) -> Self {
        let inner = Arc::new(ClientInner {
            config,
            tls_options,
            tls_config: Mutex::new(None),
            pool: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            watcher: Mutex::new(None),
        });
        let watcher = spawn_watcher(&inner);
        *inner.watcher.lock().unwrap() = Some(watcher);
        Self { inner }
    }

    /// Total connections currently tracked (pending and established).
    pub fn connection_count(&self) -> usize {
        self.inner.pool.lock().unwrap().values().map(Vec::len).sum()
    }

    /// Capacity to use for request body pipes when driving the client
    /// directly, without a dispatcher in front.
    pub fn max_stacked_buffers(&self) -> usize {
        self.inner.config.max_stacked_buffers
    }

    /// Forward one request. The outcome resolves once the response was fully
    /// streamed to the reply handle, or with the failure (carrying the reply
    /// handle back when nothing was written to it).
    pub async fn request(&self, request: ForwardRequest) -> ForwardOutcome {
        if self.inner.closed.load(Ordering::Relaxed) {
            return ForwardOutcome::Failed {
                error: UniportError::PoolClosed,
                reply: Some(request.reply),
            };
        }

        let ForwardRequest {
            method,
            path,
            protocol,
            host,
            port,
            headers,
            reply,
            body,
            timeout,
        } = request;

        let connection = match self.get_connection(&host, port, protocol).await {
            Ok(connection) => connection,
            Err(error) => {
                return ForwardOutcome::Failed {
                    error,
                    reply: Some(reply),
                }
            }
        };

        let (done_tx, done_rx) = oneshot::channel();
        let deadline = Instant::now() + timeout;
        let job = SendJob {
            head: RequestHead {
                method,
                path,
                host,
                port,
                headers,
            },
            body,
            entry: PipelineEntry::new(reply, done_tx, deadline),
        };

        if let Err((error, job)) = connection.send(job) {
            return ForwardOutcome::Failed {
                error,
                reply: job.entry.into_reply(),
            };
        }

        match done_rx.await {
            Ok(outcome) => outcome,
            Err(_) => ForwardOutcome::Failed {
                error: UniportError::conn_aborted("connection went away mid-request"),
                reply: None,
            },
        }
    }

    /// Pick or open a connection for the key. Opens eagerly below the cap,
    /// picks uniformly at random among available connections at the cap.
    async fn get_connection(
        &self,
        host: &str,
        port: u16,
        protocol: Protocol,
    ) -> UniportResult<Connection> {
        let key = format!("{}:{}", host, port);
        let tls = match protocol {
            Protocol::Https => Some((self.tls_config()?, self.server_name(host))),
            Protocol::Http => None,
        };

        let connection = {
            let mut pool = self.inner.pool.lock().unwrap();
            let connections = pool.entry(key.clone()).or_default();
            connections.retain(|c| !c.is_closed());

            if connections.len() < self.inner.config.max_connections_by_host {
                let connection = self.open_connection(&key, host, port, tls);
                connections.push(connection.clone());
                connection
            } else {
                let available: Vec<Connection> = connections
                    .iter()
                    .filter(|c| c.is_available())
                    .cloned()
                    .collect();
                if available.is_empty() {
                    return Err(UniportError::MaxConnections {
                        key,
                        limit: self.inner.config.max_connections_by_host,
                    });
                }
                let index = rand::thread_rng().gen_range(0..available.len());
                available[index].clone()
            }
        };

        connection.ready().await?;
        Ok(connection)
    }

    fn open_connection(
        &self,
        key: &str,
        host: &str,
        port: u16,
        tls: Option<(Arc<rustls::ClientConfig>, String)>,
    ) -> Connection {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let config = &self.inner.config;
        let max_pipelined = if config.pipelining {
            config.max_pipelined_requests_by_connection
        } else {
            // Sequential mode: one request in flight per connection.
            1
        };
        let opts = ConnectionOptions {
            reconnection_attempts: config.reconnection_attempts,
            reconnection_delay: config.reconnection_delay(),
            keep_alive: config.keep_alive(),
            keep_alive_initial_delay: config.keep_alive_initial_delay(),
            max_pipelined_requests: max_pipelined,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        };

        let weak = Arc::downgrade(&self.inner);
        let pool_key = key.to_string();
        let on_close = Box::new(move || {
            remove_connection(&weak, &pool_key, id);
        });

        debug!("opening connection {} to {}", id, key);
        Connection::open(
            id,
            ConnectTarget {
                host: host.to_string(),
                port,
                tls,
            },
            opts,
            on_close,
        )
    }

    fn tls_config(&self) -> UniportResult<Arc<rustls::ClientConfig>> {
        let mut cached = self.inner.tls_config.lock().unwrap();
        if let Some(config) = cached.as_ref() {
            return Ok(config.clone());
        }
        let config = tls::build_client_config(&self.inner.tls_options)?;
        *cached = Some(config.clone());
        Ok(config)
    }

    fn server_name(&self, host: &str) -> String {
        self.inner
            .tls_options
            .sni
            .clone()
            .unwrap_or_else(|| host.to_string())
    }

    /// Close every connection, stop the watcher, and reject further
    /// requests.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(watcher) = self.inner.watcher.lock().unwrap().take() {
            watcher.abort();
        }
        let connections: Vec<Connection> = {
            let mut pool = self.inner.pool.lock().unwrap();
            pool.drain().flat_map(|(_, list)| list).collect()
        };
        for connection in &connections {
            connection.close();
        }
        info!("client pool closed ({} connections)", connections.len());
    }

    /// Close the connections of a single `host:port` key.
    pub fn close_key(&self, host: &str, port: u16) {
        let key = format!("{}:{}", host, port);
        let connections = {
            let mut pool = self.inner.pool.lock().unwrap();
            pool.remove(&key).unwrap_or_default()
        };
        for connection in &connections {
            connection.close();
        }
        debug!("closed {} connections for {}", connections.len(), key);
    }
}

fn remove_connection(inner: &Weak<ClientInner>, key: &str, id: u64) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let mut pool = inner.pool.lock().unwrap();
    if let Some(list) = pool.get_mut(key) {
        list.retain(|c| c.id() != id);
        if list.is_empty() {
            pool.remove(key);
        }
    }
}

/// Periodic eviction of connections that are available but idle. In-flight
/// connections are never touched.
fn spawn_watcher(inner: &Arc<ClientInner>) -> JoinHandle<()> {
    let weak = Arc::downgrade(inner);
    let interval = inner.config.connection_watcher_interval();
    let idle_timeout = inner.config.connection_timeout();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            let idle: Vec<Connection> = {
                let pool = inner.pool.lock().unwrap();
                pool.values()
                    .flatten()
                    .filter(|c| {
                        c.is_available() && c.in_flight() == 0 && c.idle_for() > idle_timeout
                    })
                    .cloned()
                    .collect()
            };
            for connection in idle {
                debug!("evicting idle connection {}", connection.id());
                connection.close();
            }
        }
    })
}
