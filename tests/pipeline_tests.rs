//! Pipelining behavior over real sockets: FIFO correlation, keep-alive
//! reuse, stale-entry draining, and connection teardown.

mod common;

use std::time::Duration;

use common::{canned_backend, close_after_backend, echo_path_backend, MockReply};
use uniport::{Client, ClientConfig, ForwardOutcome, ForwardRequest, Headers, Protocol};

fn single_connection_config() -> ClientConfig {
    ClientConfig {
        max_connections_by_host: 1,
        reconnection_attempts: 0,
        reconnection_delay: 10,
        connection_timeout: 60_000,
        ..Default::default()
    }
}

fn request(port: u16, path: &str, reply: &MockReply) -> ForwardRequest {
    ForwardRequest {
        method: "GET".to_string(),
        path: path.to_string(),
        protocol: Protocol::Http,
        host: "127.0.0.1".to_string(),
        port,
        headers: Headers::new(),
        reply: Box::new(reply.clone()),
        body: None,
        timeout: Duration::from_secs(5),
    }
}

#[tokio::test]
async fn pipelined_requests_get_their_own_responses() {
    let port = echo_path_backend().await;
    let client = Client::new(single_connection_config());

    // Establish the single connection first; at the cap, the pool only
    // hands out connections that are already connected.
    let warmup = MockReply::default();
    assert!(matches!(
        client.request(request(port, "/echo/warmup", &warmup)).await,
        ForwardOutcome::Delivered
    ));

    let mut tasks = Vec::new();
    let mut replies = Vec::new();
    for i in 0..12 {
        let reply = MockReply::default();
        replies.push((i, reply.clone()));
        let client = client.clone();
        let req = request(port, &format!("/echo/{}", i), &reply);
        tasks.push(tokio::spawn(async move { client.request(req).await }));
    }

    for task in tasks {
        assert!(matches!(task.await.unwrap(), ForwardOutcome::Delivered));
    }
    // Everything rode a single pipelined connection, and each reply carries
    // exactly the body for its own request.
    assert_eq!(client.connection_count(), 1);
    for (i, reply) in replies {
        assert_eq!(reply.status(), Some(200));
        assert_eq!(reply.body_text(), format!("echo-{}", i));
        assert!(reply.ended());
    }
    client.close();
}

#[tokio::test]
async fn chunked_response_is_streamed() {
    let port = canned_backend(
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n6\r\nHello \r\n6\r\nWorld!\r\n0\r\n\r\n",
    )
    .await;
    let client = Client::new(single_connection_config());

    let reply = MockReply::default();
    let outcome = client.request(request(port, "/", &reply)).await;
    assert!(matches!(outcome, ForwardOutcome::Delivered));
    assert_eq!(reply.status(), Some(200));
    assert_eq!(reply.body_text(), "Hello World!");
    assert!(reply.ended());
    // Framing headers are not forwarded; the edge re-frames.
    assert!(reply
        .headers()
        .iter()
        .all(|(name, _)| name != "transfer-encoding"));
    client.close();
}

#[tokio::test]
async fn aborted_request_preserves_framing_for_the_next_one() {
    let port = echo_path_backend().await;
    let client = Client::new(single_connection_config());

    let aborted = MockReply::default();
    aborted.abort();
    let first = {
        let client = client.clone();
        let req = request(port, "/echo/discarded", &aborted);
        tokio::spawn(async move { client.request(req).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let healthy = MockReply::default();
    let outcome = client.request(request(port, "/echo/kept", &healthy)).await;

    assert!(matches!(first.await.unwrap(), ForwardOutcome::Delivered));
    assert!(matches!(outcome, ForwardOutcome::Delivered));

    // The aborted reply saw none of the discarded response bytes, and the
    // follow-up request on the same connection got exactly its own body.
    assert!(aborted.status().is_none());
    assert!(aborted.body().is_empty());
    assert_eq!(healthy.body_text(), "echo-kept");
    assert_eq!(client.connection_count(), 1);
    client.close();
}

#[tokio::test]
async fn backend_closing_mid_response_fails_the_request() {
    // Advertises 100 bytes but closes after 6.
    let port =
        close_after_backend(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\npartia").await;
    let client = Client::new(single_connection_config());

    let reply = MockReply::default();
    match client.request(request(port, "/", &reply)).await {
        ForwardOutcome::Failed { error, reply: returned } => {
            assert_eq!(error.code(), "RECIPIENT_ABORTED");
            // The response had started; the reply cannot be reused.
            assert!(returned.is_none());
        }
        ForwardOutcome::Delivered => panic!("truncated response must fail"),
    }
    assert!(reply.closed());
    client.close();
}

#[tokio::test]
async fn until_close_response_is_delivered_and_tears_down_the_connection() {
    // No content-length, no chunking: body runs until the peer closes.
    let port = close_after_backend(b"HTTP/1.1 200 OK\r\nServer: legacy\r\n\r\nstream-tail").await;
    let client = Client::new(single_connection_config());

    let reply = MockReply::default();
    let outcome = client.request(request(port, "/", &reply)).await;
    assert!(matches!(outcome, ForwardOutcome::Delivered));
    assert_eq!(reply.body_text(), "stream-tail");
    assert!(reply.ended());

    // The connection is gone; a fresh request opens a new one and works.
    let reply = MockReply::default();
    let outcome = client.request(request(port, "/", &reply)).await;
    assert!(matches!(outcome, ForwardOutcome::Delivered));
    client.close();
}

#[tokio::test]
async fn reply_backpressure_pauses_delivery() {
    let port =
        canned_backend(b"HTTP/1.1 200 OK\r\nContent-Length: 9\r\n\r\nslow-edge").await;
    let client = Client::new(single_connection_config());

    let reply = MockReply::refusing(1);
    let outcome = client.request(request(port, "/", &reply)).await;
    assert!(matches!(outcome, ForwardOutcome::Delivered));
    assert_eq!(reply.body_text(), "slow-edge");
    assert!(reply.ended());
    client.close();
}
