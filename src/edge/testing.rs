//! Scripted reply handle for unit tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::ReplyHandle;

/// A reply handle that records everything written to it and can be scripted
/// to refuse a number of body writes (simulating edge backpressure) or to
/// look aborted.
#[derive(Clone, Default)]
pub(crate) struct TestReply {
    inner: Arc<Mutex<TestReplyState>>,
}

#[derive(Default)]
struct TestReplyState {
    refuse_writes: usize,
    aborted: bool,
    status: Option<(u16, String)>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    ended: bool,
    closed: bool,
    corked: usize,
    writable_waits: usize,
}

impl TestReply {
    /// Refuse the first `n` body writes before accepting.
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

    pub fn corked(&self) -> usize {
        self.inner.lock().unwrap().corked
    }

    pub fn writable_waits(&self) -> usize {
        self.inner.lock().unwrap().writable_waits
    }
}

#[async_trait]
impl ReplyHandle for TestReply {
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
        Some("198.51.100.4".to_string())
    }

    fn cork(&mut self, f: &mut dyn FnMut(&mut dyn ReplyHandle)) {
        self.inner.lock().unwrap().corked += 1;
        f(self)
    }

    fn close(&mut self) {
        self.inner.lock().unwrap().closed = true;
    }

    async fn writable(&mut self) -> Option<usize> {
        let mut state = self.inner.lock().unwrap();
        state.writable_waits += 1;
        if state.aborted {
            None
        } else {
            Some(state.body.len())
        }
    }
}
