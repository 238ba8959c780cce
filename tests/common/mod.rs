//! Shared helpers for integration tests: a recording reply handle, a static
//! edge request view, and scripted TCP backends.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use uniport::{EdgeRequestView, ReplyHandle};

/// Reply handle that records writes and can be scripted to refuse a number
/// of body writes or to look aborted.
#[derive(Clone, Default)]
pub struct MockReply {
    inner: Arc<Mutex<MockReplyState>>,
}

#[derive(Default)]
struct MockReplyState {
    refuse_writes: usize,
    aborted: bool,
    status: Option<(u16, String)>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    ended: bool,
    closed: bool,
}

impl MockReply {
    pub fn refusing(n: usize) -> Self {
        let reply = Self::default();
        reply.inner.lock().unwrap().refuse_writes = n;
        reply
    }

    pub fn abort(&self) {
        self.inner.lock().unwrap().aborted = true;
    }

    pub fn status(&self) -> Option<u16> {
        self.inner.lock().unwrap().status.as_ref().map(|s| s.0)
    }

    pub fn headers(&self) -> Vec<(String, String)> {
        self.inner.lock().unwrap().headers.clone()
    }

    pub fn body(&self) -> Vec<u8> {
        self.inner.lock().unwrap().body.clone()
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body()).into_owned()
    }

    pub fn ended(&self) -> bool {
        self.inner.lock().unwrap().ended
    }

    pub fn closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}

#[async_trait]
impl ReplyHandle for MockReply {
    fn write_status(&mut self, status: u16, message: &str) {
        self.inner.lock().unwrap().status = Some((status, message.to_string()));
    }

    fn write_header(&mut self, name: &str, value: &str) {
        self.inner
            .lock()
            .unwrap()
            .headers
            .push((name.to_string(), value.to_string()));
    }

    fn write(&mut self, chunk: &[u8]) -> bool {
        let mut state = self.inner.lock().unwrap();
        state.body.extend_from_slice(chunk);
        if state.refuse_writes > 0 {
            state.refuse_writes -= 1;
            false
        } else {
            true
        }
    }

    fn try_end(&mut self, chunk: &[u8], total_size: usize) -> (bool, bool) {
        let mut state = self.inner.lock().unwrap();
        if state.refuse_writes > 0 {
            state.refuse_writes -= 1;
            return (false, false);
        }
        state.body.extend_from_slice(chunk);
        let done = state.body.len() >= total_size;
        if done {
            state.ended = true;
        }
        (true, done)
    }

    fn end(&mut self, chunk: Option<&[u8]>) {
        let mut state = self.inner.lock().unwrap();
        if let Some(chunk) = chunk {
            state.body.extend_from_slice(chunk);
        }
        state.ended = true;
    }

    fn write_offset(&self) -> usize {
        self.inner.lock().unwrap().body.len()
    }

    fn is_aborted(&self) -> bool {
        self.inner.lock().unwrap().aborted
    }

    fn remote_address(&self) -> Option<String> {
        Some("203.0.113.9".to_string())
    }

    fn cork(&mut self, f: &mut dyn FnMut(&mut dyn ReplyHandle)) {
        f(self)
    }

    fn close(&mut self) {
        self.inner.lock().unwrap().closed = true;
    }

    async fn writable(&mut self) -> Option<usize> {
        let state = self.inner.lock().unwrap();
        if state.aborted {
            None
        } else {
            Some(state.body.len())
        }
    }
}

/// Static edge request view.
pub struct MockView {
    pub method: String,
    pub url: String,
    pub query: String,
    pub headers: Vec<(String, String)>,
}

impl MockView {
    pub fn get(url: &str) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.to_string(),
            query: String::new(),
            headers: vec![("host".to_string(), "edge.example".to_string())],
        }
    }
}

impl EdgeRequestView for MockView {
    fn method(&self) -> &str {
        &self.method
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn query(&self) -> &str {
        &self.query
    }

    fn for_each_header(&self, f: &mut dyn FnMut(&str, &str)) {
        for (name, value) in &self.headers {
            f(name, value);
        }
    }
}

/// Backend that parses request heads and answers each `GET /echo/<token>`
/// with a fixed-length body `echo-<token>`, in arrival order. Bodies are not
/// expected on inbound requests.
pub async fn echo_path_backend() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut pending = String::new();
                let mut buf = vec![0u8; 8192];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            pending.push_str(&String::from_utf8_lossy(&buf[..n]));
                            while let Some(end) = pending.find("\r\n\r\n") {
                                let head: String = pending.drain(..end + 4).collect();
                                let token = head
                                    .lines()
                                    .next()
                                    .and_then(|line| line.split(' ').nth(1))
                                    .and_then(|path| path.strip_prefix("/echo/"))
                                    .unwrap_or("none")
                                    .to_string();
                                let body = format!("echo-{}", token);
                                let response = format!(
                                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                                    body.len(),
                                    body
                                );
                                if socket.write_all(response.as_bytes()).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
            });
        }
    });
    port
}

/// Backend that answers every request head with the same canned bytes.
pub async fn canned_backend(response: &'static [u8]) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            if socket.write_all(response).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}

/// Backend that writes its canned bytes and immediately closes the socket.
pub async fn close_after_backend(response: &'static [u8]) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                if matches!(socket.read(&mut buf).await, Ok(n) if n > 0) {
                    let _ = socket.write_all(response).await;
                    let _ = socket.shutdown().await;
                }
            });
        }
    });
    port
}

/// Backend that accepts connections and never answers.
pub async fn stalling_backend() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            held.push(socket);
        }
    });
    port
}

/// A bound-then-dropped port: connecting to it is refused.
pub async fn refused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}
