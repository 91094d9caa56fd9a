mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{FakeRuntime, LOG_METHOD, STOPPED_EXIT_CODE, fast_settings, request, spec};
use mcp_runner::container::ContainerRuntimeApi;
use mcp_runner::session::{LogBatch, McpSession, Subscription};
use mcp_runner_protocol::{CloseReason, JsonRpcMessage, LogStream, RequestId};

const WAIT: Duration = Duration::from_secs(5);

fn start(runtime: &Arc<FakeRuntime>) -> McpSession {
    let api: Arc<dyn ContainerRuntimeApi> = runtime.clone();
    McpSession::start("ses_test", api, spec(), fast_settings())
}

/// Next outgoing message that is not a runner-originated ping.
async fn next_reply(outgoing: &mut Subscription<JsonRpcMessage>) -> JsonRpcMessage {
    loop {
        let message = tokio::time::timeout(WAIT, outgoing.recv())
            .await
            .expect("timed out waiting for outgoing message")
            .expect("outgoing stream ended");
        if message.is_internal_ping() {
            continue;
        }
        return message;
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_forwards_messages_in_order() {
    let runtime = FakeRuntime::new();
    let session = start(&runtime);
    let mut outgoing = session.subscribe_outgoing();

    session.incoming_message(vec![request(1, "tools/list"), request(2, "tools/call")]);

    let first = next_reply(&mut outgoing).await;
    let second = next_reply(&mut outgoing).await;
    assert_eq!(first.id(), Some(&RequestId::Number(1)));
    assert_eq!(second.id(), Some(&RequestId::Number(2)));

    session.stop().await;
}

#[tokio::test]
async fn test_client_ping_answered_locally() {
    let runtime = FakeRuntime::new();
    let session = start(&runtime);
    let mut outgoing = session.subscribe_outgoing();

    session.incoming_message(vec![request(7, "ping")]);
    let pong = next_reply(&mut outgoing).await;
    match pong {
        JsonRpcMessage::Response(response) => {
            assert_eq!(response.id, RequestId::Number(7));
            assert_eq!(response.result, serde_json::json!({}));
        }
        other => panic!("expected ping response, got {other:?}"),
    }

    // A later request travels the same stdin path, so once it is answered
    // the ping would have arrived too.
    session.incoming_message(vec![request(8, "tools/list")]);
    let reply = next_reply(&mut outgoing).await;
    assert_eq!(reply.id(), Some(&RequestId::Number(8)));

    let received = runtime.received(session.container().name());
    assert!(received.iter().any(|line| line.contains("tools/list")));
    assert!(!received.iter().any(|line| line.contains("\"id\":7")));

    session.stop().await;
}

#[tokio::test]
async fn test_container_ping_answered_and_not_forwarded() {
    let runtime = FakeRuntime::new();
    let session = start(&runtime);
    let mut outgoing = session.subscribe_outgoing();

    session.container().wait_for_handle().await.unwrap();
    // The runner pings the container on the first liveness tick; the fake
    // server answers and that answer must not reach the client.
    wait_until(|| {
        runtime
            .received(session.container().name())
            .iter()
            .any(|line| line.contains("mcp-runner/ping/"))
    })
    .await;

    session.incoming_message(vec![request(3, "tools/list")]);
    let reply = next_reply(&mut outgoing).await;
    assert_eq!(reply.id(), Some(&RequestId::Number(3)));

    session.stop().await;
}

#[tokio::test]
async fn test_non_protocol_output_becomes_logs() {
    let runtime = FakeRuntime::new();
    let session = start(&runtime);
    let mut outgoing = session.subscribe_outgoing();
    let mut logs = session.subscribe_logs();

    session.incoming_message(vec![request(3, LOG_METHOD)]);
    let reply = next_reply(&mut outgoing).await;
    assert_eq!(reply.id(), Some(&RequestId::Number(3)));

    let mut lines = Vec::new();
    while lines.len() < 2 {
        let LogBatch { lines: batch, .. } = tokio::time::timeout(WAIT, logs.recv())
            .await
            .expect("timed out waiting for logs")
            .expect("log stream ended");
        lines.extend(batch);
    }

    assert!(
        lines
            .iter()
            .any(|l| l.stream == LogStream::Stdout && l.line == "plain text on stdout")
    );
    assert!(
        lines
            .iter()
            .any(|l| l.stream == LogStream::Stderr && l.line == "something on stderr")
    );

    session.stop().await;
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let runtime = FakeRuntime::new();
    let session = start(&runtime);
    session.container().wait_for_handle().await.unwrap();
    let mut closes = session.subscribe_close();

    tokio::join!(session.stop(), session.stop());
    session.stop().await;

    let event = closes.recv().await.unwrap();
    assert_eq!(event.reason, CloseReason::ServerStopped);
    assert_eq!(closes.recv().await, None);
    assert_eq!(runtime.stop_count(), 1);
    assert!(session.is_stopped());
}

#[tokio::test]
async fn test_stop_before_spawn_skips_container() {
    let runtime = FakeRuntime::new();
    let session = start(&runtime);

    session.stop().await;

    let event = session.wait_closed().await;
    assert_eq!(event.reason, CloseReason::ServerStopped);
    assert_eq!(runtime.spawns.load(Ordering::SeqCst), 0);
    assert_eq!(runtime.stop_count(), 0);
}

#[tokio::test]
async fn test_pull_failure_closes_session() {
    let runtime = FakeRuntime::new();
    runtime.fail_pull.store(true, Ordering::SeqCst);
    let session = start(&runtime);

    let event = tokio::time::timeout(WAIT, session.wait_closed()).await.unwrap();
    assert_eq!(event.reason, CloseReason::ServerFailedToStart);
    assert_eq!(runtime.spawns.load(Ordering::SeqCst), 0);
    assert_eq!(runtime.stop_count(), 0);
    assert!(session.is_stopped());
}

#[tokio::test]
async fn test_invisible_container_fails_to_start() {
    let runtime = FakeRuntime::new();
    runtime.visible.store(false, Ordering::SeqCst);
    let session = start(&runtime);

    let event = tokio::time::timeout(WAIT, session.wait_closed()).await.unwrap();
    assert_eq!(event.reason, CloseReason::ServerFailedToStart);
    assert_eq!(runtime.spawns.load(Ordering::SeqCst), 1);
    assert_eq!(runtime.stop_count(), 0);
}

#[tokio::test]
async fn test_container_exit_closes_session() {
    let runtime = FakeRuntime::new();
    let session = start(&runtime);
    session.container().wait_for_handle().await.unwrap();

    runtime.exit_container(session.container().name());

    let event = tokio::time::timeout(WAIT, session.wait_closed()).await.unwrap();
    assert_eq!(event.reason, CloseReason::ServerExitedError);
    assert_eq!(event.exit_code, Some(STOPPED_EXIT_CODE));
}

#[tokio::test]
async fn test_messages_after_stop_are_dropped() {
    let runtime = FakeRuntime::new();
    let session = start(&runtime);
    session.container().wait_for_handle().await.unwrap();
    session.stop().await;

    let mut outgoing = session.subscribe_outgoing();
    session.incoming_message(vec![request(1, "ping")]);
    assert_eq!(outgoing.recv().await, None);
}

#[tokio::test(start_paused = true)]
async fn test_silent_client_times_out() {
    let runtime = FakeRuntime::new();
    let session = start(&runtime);

    let event = session.wait_closed().await;
    assert_eq!(event.reason, CloseReason::ClientTimeout);
    wait_until(|| runtime.stop_count() == 1).await;
}

#[tokio::test(start_paused = true)]
async fn test_unresponsive_server_times_out() {
    let runtime = FakeRuntime::new();
    runtime.answer_pings.store(false, Ordering::SeqCst);
    let session = start(&runtime);

    let client = session.clone();
    let keepalive = tokio::spawn(async move {
        let mut n = 1000;
        loop {
            client.incoming_message(vec![request(n, "ping")]);
            n += 1;
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    });

    let event = session.wait_closed().await;
    keepalive.abort();
    assert_eq!(event.reason, CloseReason::ServerTimeout);
    wait_until(|| runtime.stop_count() == 1).await;
}
