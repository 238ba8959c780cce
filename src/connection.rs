//! One connection to a backend.
//!
//! A connection owns a TCP (optionally TLS) socket plus the three pieces
//! that speak HTTP/1.1 over it: the request sender on the write half, and
//! the response parser feeding the pipeline on the read half. The pool holds
//! cheap clonable handles; the state machine runs in its own task.
//!
//! States move `Connecting -> Connected -> Closed` and never back. A refused
//! connect is retried up to the configured attempt count before the
//! connection reports itself closed.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{UniportError, UniportResult};
use crate::parser::{ParserEvent, ResponseParser};
use crate::pipeline::{Pipeline, PipelineEntry};
use crate::sender::{run_sender, SendJob};
use crate::tls;

const READ_BUFFER_SIZE: usize = 16 * 1024;

pub(crate) trait BackendIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> BackendIo for T {}

pub(crate) type BackendStream = Box<dyn BackendIo>;

/// Where and how to connect.
#[derive(Clone)]
pub(crate) struct ConnectTarget {
    pub host: String,
    pub port: u16,
    /// TLS client config and server name, for HTTPS backends.
    pub tls: Option<(Arc<rustls::ClientConfig>, String)>,
}

/// Connection-level tunables, extracted from the pool configuration.
#[derive(Clone)]
pub(crate) struct ConnectionOptions {
    pub reconnection_attempts: u32,
    pub reconnection_delay: Duration,
    pub keep_alive: Duration,
    pub keep_alive_initial_delay: Duration,
    pub max_pipelined_requests: usize,
    pub request_timeout: Duration,
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Connected,
    Closed,
}

impl ConnState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnState::Connecting => "connecting",
            ConnState::Connected => "connected",
            ConnState::Closed => "closed",
        }
    }
}

/// Clonable handle to one backend connection.
#[derive(Clone)]
pub(crate) struct Connection {
    id: u64,
    jobs: mpsc::UnboundedSender<SendJob>,
    state_rx: watch::Receiver<ConnState>,
    shutdown: Arc<watch::Sender<bool>>,
    in_flight: Arc<AtomicUsize>,
    locked: Arc<AtomicBool>,
    last_activity: Arc<Mutex<Instant>>,
    connect_error: Arc<Mutex<Option<UniportError>>>,
    max_pipelined: usize,
}

impl Connection {
    /// Open a connection and spawn its task. `on_close` runs exactly once
    /// when the task finishes, whatever the reason.
    pub fn open(
        id: u64,
        target: ConnectTarget,
        opts: ConnectionOptions,
        on_close: Box<dyn FnOnce() + Send>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let locked = Arc::new(AtomicBool::new(false));
        let last_activity = Arc::new(Mutex::new(Instant::now()));
        let connect_error = Arc::new(Mutex::new(None));

        let handle = Self {
            id,
            jobs: jobs_tx,
            state_rx,
            shutdown: Arc::new(shutdown_tx),
            in_flight: in_flight.clone(),
            locked: locked.clone(),
            last_activity: last_activity.clone(),
            connect_error: connect_error.clone(),
            max_pipelined: opts.max_pipelined_requests,
        };

        tokio::spawn(run(
            id,
            target,
            opts,
            state_tx,
            jobs_rx,
            shutdown_rx,
            in_flight,
            locked,
            last_activity,
            connect_error,
            on_close,
        ));

        handle
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnState {
        *self.state_rx.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnState::Closed
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Connected, not locked by an until-close response, and below the
    /// pipeline cap.
    pub fn is_available(&self) -> bool {
        self.state() == ConnState::Connected
            && !self.locked.load(Ordering::Relaxed)
            && self.in_flight() < self.max_pipelined
    }

    /// Time since the socket last saw activity.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    /// Resolves once the connection is usable, or with the connect failure.
    pub async fn ready(&self) -> UniportResult<()> {
        let mut rx = self.state_rx.clone();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                ConnState::Connected => return Ok(()),
                ConnState::Closed => {
                    let error = self.connect_error.lock().unwrap().clone();
                    return Err(error.unwrap_or_else(|| {
                        UniportError::conn_aborted("connection closed before becoming ready")
                    }));
                }
                ConnState::Connecting => {
                    if rx.changed().await.is_err() {
                        return Err(UniportError::conn_aborted("connection task is gone"));
                    }
                }
            }
        }
    }

    /// Hand a request to the sender task. Fails synchronously when the
    /// connection is not usable, returning the job to the caller.
    pub fn send(&self, job: SendJob) -> Result<(), (UniportError, SendJob)> {
        let state = self.state();
        if state != ConnState::Connected {
            return Err((UniportError::NotConnected { state: state.name() }, job));
        }
        if self.locked.load(Ordering::Relaxed) {
            return Err((UniportError::StreamUntilCloseNotSupported, job));
        }
        let previous = self.in_flight.fetch_add(1, Ordering::Relaxed);
        if previous >= self.max_pipelined {
            self.in_flight.fetch_sub(1, Ordering::Relaxed);
            return Err((
                UniportError::PipelineOverflow {
                    limit: self.max_pipelined,
                },
                job,
            ));
        }
        self.jobs.send(job).map_err(|returned| {
            self.in_flight.fetch_sub(1, Ordering::Relaxed);
            (
                UniportError::conn_aborted("connection task is gone"),
                returned.0,
            )
        })
    }

    /// Ask the connection task to shut down. In-flight requests are drained
    /// as aborted.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    id: u64,
    target: ConnectTarget,
    opts: ConnectionOptions,
    state_tx: watch::Sender<ConnState>,
    mut jobs_rx: mpsc::UnboundedReceiver<SendJob>,
    mut shutdown_rx: watch::Receiver<bool>,
    in_flight: Arc<AtomicUsize>,
    locked: Arc<AtomicBool>,
    last_activity: Arc<Mutex<Instant>>,
    connect_error: Arc<Mutex<Option<UniportError>>>,
    on_close: Box<dyn FnOnce() + Send>,
) {
    let stream = match establish(&target, &opts, &mut shutdown_rx).await {
        Ok(stream) => stream,
        Err(error) => {
            warn!(
                "connection {} to {}:{} failed: {}",
                id, target.host, target.port, error
            );
            *connect_error.lock().unwrap() = Some(error.clone());
            let _ = state_tx.send(ConnState::Closed);
            drain_jobs(&mut jobs_rx, &in_flight, &error);
            on_close();
            return;
        }
    };

    *last_activity.lock().unwrap() = Instant::now();
    let _ = state_tx.send(ConnState::Connected);
    debug!("connection {} to {}:{} established", id, target.host, target.port);

    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let (entries_tx, mut entries_rx) = mpsc::unbounded_channel::<PipelineEntry>();
    let mut pipeline = Pipeline::new(
        opts.max_pipelined_requests,
        opts.request_timeout,
        in_flight.clone(),
        locked.clone(),
    );
    let mut parser = ResponseParser::new();

    let result = {
        let sender = run_sender(&mut write_half, &mut jobs_rx, &entries_tx, &in_flight);
        let reader = run_reader(
            &mut read_half,
            &mut entries_rx,
            &mut pipeline,
            &mut parser,
            &last_activity,
        );
        tokio::pin!(sender, reader);
        tokio::select! {
            result = &mut sender => result,
            result = &mut reader => result,
            _ = shutdown_rx.changed() => Ok(()),
        }
    };

    let error = match result {
        Ok(()) => UniportError::conn_aborted("connection closed"),
        Err(error) => {
            warn!(
                "connection {} to {}:{} failed: {}",
                id, target.host, target.port, error
            );
            error
        }
    };

    pipeline.close(&error);
    drain_entries(&mut entries_rx, &in_flight, &error);
    drain_jobs(&mut jobs_rx, &in_flight, &error);
    let _ = state_tx.send(ConnState::Closed);
    debug!("connection {} to {}:{} closed", id, target.host, target.port);
    on_close();
}

/// Connect, retrying refused connects with the configured delay.
async fn establish(
    target: &ConnectTarget,
    opts: &ConnectionOptions,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> UniportResult<BackendStream> {
    let mut attempts = 0u32;
    loop {
        match open_stream(target, opts).await {
            Ok(stream) => return Ok(stream),
            Err(error @ UniportError::ConnRefused { .. })
                if attempts < opts.reconnection_attempts =>
            {
                attempts += 1;
                warn!(
                    "backend {}:{} refused connection (attempt {}/{}), retrying in {:?}",
                    target.host,
                    target.port,
                    attempts,
                    opts.reconnection_attempts,
                    opts.reconnection_delay
                );
                debug!("last refusal: {}", error);
                tokio::select! {
                    _ = tokio::time::sleep(opts.reconnection_delay) => {}
                    _ = shutdown_rx.changed() => {
                        return Err(UniportError::conn_aborted("closed while reconnecting"));
                    }
                }
            }
            Err(error) => return Err(error),
        }
    }
}

async fn open_stream(
    target: &ConnectTarget,
    opts: &ConnectionOptions,
) -> UniportResult<BackendStream> {
    let stream = TcpStream::connect((target.host.as_str(), target.port)).await?;
    configure_socket(&stream, opts)?;
    match &target.tls {
        Some((config, server_name)) => {
            let tls_stream = tls::connect(stream, server_name, config.clone()).await?;
            Ok(Box::new(tls_stream))
        }
        None => Ok(Box::new(stream)),
    }
}

fn configure_socket(stream: &TcpStream, opts: &ConnectionOptions) -> UniportResult<()> {
    stream.set_nodelay(true)?;
    let sock = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(opts.keep_alive_initial_delay)
        .with_interval(opts.keep_alive);
    sock.set_tcp_keepalive(&keepalive)?;
    Ok(())
}

/// Read-side loop: feed inbound bytes to the parser and its events to the
/// pipeline, register entries, and watch the head's response deadline.
async fn run_reader(
    socket: &mut ReadHalf<BackendStream>,
    entries_rx: &mut mpsc::UnboundedReceiver<PipelineEntry>,
    pipeline: &mut Pipeline,
    parser: &mut ResponseParser,
    last_activity: &Arc<Mutex<Instant>>,
) -> UniportResult<()> {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let mut events: Vec<ParserEvent> = Vec::new();
    loop {
        let deadline = pipeline.head_deadline();
        tokio::select! {
            entry = entries_rx.recv() => {
                match entry {
                    Some(entry) => pipeline.push(entry),
                    None => return Ok(()),
                }
            }
            result = socket.read_buf(&mut buf) => {
                let n = result?;
                if n == 0 {
                    parser.finish(&mut events);
                    for event in events.drain(..) {
                        pipeline.handle_event(event).await?;
                    }
                    if pipeline.is_empty() {
                        return Ok(());
                    }
                    return Err(UniportError::recipient_aborted(
                        "backend closed the connection mid-response",
                    ));
                }
                *last_activity.lock().unwrap() = Instant::now();

                // Entries are registered before their request head is
                // written, so drain registrations before parsing the bytes
                // that may answer them.
                while let Ok(entry) = entries_rx.try_recv() {
                    pipeline.push(entry);
                }

                parser.feed(&buf, &mut events);
                buf.clear();
                for event in events.drain(..) {
                    pipeline.handle_event(event).await?;
                }
            }
            _ = tokio::time::sleep_until(
                deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400))
            ), if deadline.is_some() => {
                return Err(pipeline.timeout_error());
            }
        }
    }
}

fn drain_jobs(
    jobs_rx: &mut mpsc::UnboundedReceiver<SendJob>,
    in_flight: &Arc<AtomicUsize>,
    error: &UniportError,
) {
    while let Ok(job) = jobs_rx.try_recv() {
        in_flight.fetch_sub(1, Ordering::Relaxed);
        job.entry.fail(error.clone());
    }
}

fn drain_entries(
    entries_rx: &mut mpsc::UnboundedReceiver<PipelineEntry>,
    in_flight: &Arc<AtomicUsize>,
    error: &UniportError,
) {
    while let Ok(entry) = entries_rx.try_recv() {
        in_flight.fetch_sub(1, Ordering::Relaxed);
        entry.fail(error.clone());
    }
}
