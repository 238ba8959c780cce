//! Decoding of a raw edge request into a forwardable shape.

use crate::headers::Headers;

use super::{EdgeRequestView, ReplyHandle};

/// A decoded edge request head, ready for header rewriting and dispatch.
#[derive(Debug, Clone)]
pub struct DecodedRequest {
    pub method: String,
    pub url: String,
    pub query: String,
    pub headers: Headers,
    pub remote_address: Option<String>,
}

impl DecodedRequest {
    /// Request path as sent to the backend: the url plus the raw query
    /// string when one is present.
    pub fn path(&self) -> String {
        if self.query.is_empty() {
            self.url.clone()
        } else {
            format!("{}?{}", self.url, self.query)
        }
    }
}

/// Decode an edge request. The remote address is read through the reply
/// handle: some edges expose it only on the reply side.
pub fn decode_request(view: &dyn EdgeRequestView, reply: &dyn ReplyHandle) -> DecodedRequest {
    let mut headers = Headers::new();
    view.for_each_header(&mut |name, value| {
        headers.append(name, value);
    });

    DecodedRequest {
        method: view.method().to_ascii_uppercase(),
        url: view.url().to_string(),
        query: view.query().to_string(),
        headers,
        remote_address: reply.remote_address(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FakeView;

    impl EdgeRequestView for FakeView {
        fn method(&self) -> &str {
            "post"
        }
        fn url(&self) -> &str {
            "/api/items"
        }
        fn query(&self) -> &str {
            "page=2"
        }
        fn for_each_header(&self, f: &mut dyn FnMut(&str, &str)) {
            f("Host", "public.example");
            f("Accept", "text/html");
            f("Accept", "application/json");
        }
    }

    struct FakeReply;

    #[async_trait]
    impl ReplyHandle for FakeReply {
        fn write_status(&mut self, _status: u16, _message: &str) {}
        fn write_header(&mut self, _name: &str, _value: &str) {}
        fn write(&mut self, _chunk: &[u8]) -> bool {
            true
        }
        fn try_end(&mut self, _chunk: &[u8], _total_size: usize) -> (bool, bool) {
            (true, true)
        }
        fn end(&mut self, _chunk: Option<&[u8]>) {}
        fn write_offset(&self) -> usize {
            0
        }
        fn is_aborted(&self) -> bool {
            false
        }
        fn remote_address(&self) -> Option<String> {
            Some("203.0.113.7".to_string())
        }
        fn cork(&mut self, f: &mut dyn FnMut(&mut dyn ReplyHandle)) {
            f(self)
        }
        fn close(&mut self) {}
        async fn writable(&mut self) -> Option<usize> {
            Some(0)
        }
    }

    #[test]
    fn test_decode_uppercases_method_and_collects_headers() {
        let decoded = decode_request(&FakeView, &FakeReply);
        assert_eq!(decoded.method, "POST");
        assert_eq!(decoded.url, "/api/items");
        assert_eq!(decoded.path(), "/api/items?page=2");
        assert_eq!(decoded.headers.get("host"), Some("public.example"));
        let accepts: Vec<_> = decoded.headers.get_all("accept").collect();
        assert_eq!(accepts, vec!["text/html", "application/json"]);
        assert_eq!(decoded.remote_address.as_deref(), Some("203.0.113.7"));
    }

    #[test]
    fn test_path_without_query() {
        let decoded = DecodedRequest {
            method: "GET".into(),
            url: "/".into(),
            query: String::new(),
            headers: Headers::new(),
            remote_address: None,
        };
        assert_eq!(decoded.path(), "/");
    }
}
