//! End-to-end request/response tests against the `tether-echo` worker.

mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common::{call_once, ready_client, TAG};
use serde_json::{json, Value};
use tether::worker::{Completion, Continuation, WorkerError, WorkerEvent};
use tokio::sync::mpsc;

#[tokio::test]
async fn test_echo_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let client = ready_client(dir.path()).await;

    let reply = client
        .call_timeout("echo", json!({ "x": 1, "list": ["a", "b"] }), Duration::from_secs(5))
        .await;

    assert!(reply.is_ok(), "unexpected error: {}", reply.error_text());
    assert_eq!(reply.data, json!({ "x": 1, "list": ["a", "b"] }));
    assert_eq!(client.pending_len(), 0);
}

#[tokio::test]
async fn test_typed_helpers() {
    let dir = tempfile::tempdir().unwrap();
    let client = ready_client(dir.path()).await;

    assert_eq!(client.ping().await.unwrap(), json!({}));

    #[derive(serde::Deserialize)]
    struct Slept {
        slept: u64,
    }
    let slept: Slept = client.request("sleep", json!({ "ms": 5 })).await.unwrap();
    assert_eq!(slept.slept, 5);
}

#[tokio::test]
async fn test_concurrent_calls_get_their_own_replies() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(ready_client(dir.path()).await);

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..50 {
        let client = client.clone();
        tasks.spawn(async move {
            let reply = client
                .call_timeout("echo", json!({ "i": i }), Duration::from_secs(5))
                .await;
            (i, reply.into_result().unwrap())
        });
    }

    let mut seen = 0;
    while let Some(joined) = tasks.join_next().await {
        let (i, data) = joined.unwrap();
        assert_eq!(data, json!({ "i": i }));
        seen += 1;
    }
    assert_eq!(seen, 50);
    assert_eq!(client.pending_len(), 0);
}

#[tokio::test]
async fn test_requests_are_written_in_submission_order() {
    let dir = tempfile::tempdir().unwrap();
    let client = ready_client(dir.path()).await;

    let methods = ["echo", "b64", "ping", "sleep", "echo", "pid"];
    for method in methods {
        client.call(method, json!({}), Completion::once(|_| {}));
    }

    let reply = call_once(&client, "history", json!({})).await;
    let mut expected: Vec<Value> = methods.iter().map(|m| json!(m)).collect();
    expected.push(json!("history"));
    assert_eq!(reply.into_result().unwrap()["methods"], Value::Array(expected));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submitters_keep_write_order() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(ready_client(dir.path()).await);
    let submitted = Arc::new(Mutex::new(Vec::new()));

    let mut tasks = tokio::task::JoinSet::new();
    for task in 0..8 {
        let client = client.clone();
        let submitted = submitted.clone();
        tasks.spawn(async move {
            for i in 0..25 {
                let method = format!("task-{}-{}", task, i);
                {
                    // recorded order is the call order
                    let mut order = submitted.lock().unwrap();
                    order.push(method.clone());
                    client.call(&method, json!({}), Completion::once(|_| {}));
                }
                tokio::task::yield_now().await;
            }
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap();
    }

    let reply = call_once(&client, "history", json!({})).await;
    let mut received = reply.into_result().unwrap()["methods"]
        .as_array()
        .unwrap()
        .clone();
    assert_eq!(received.pop(), Some(json!("history")));

    let expected: Vec<Value> = submitted.lock().unwrap().iter().map(|m| json!(m)).collect();
    assert_eq!(expected.len(), 200);
    assert_eq!(received, expected);
}

#[tokio::test]
async fn test_replies_are_delivered_in_arrival_order() {
    let dir = tempfile::tempdir().unwrap();
    let client = ready_client(dir.path()).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    for (method, params) in [("sleep", json!({ "ms": 300 })), ("echo", json!({ "fast": true }))] {
        let tx = tx.clone();
        client.call(
            method,
            params,
            Completion::once(move |reply| {
                let _ = tx.send(reply.data);
            }),
        );
    }

    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    assert_eq!(first, json!({ "fast": true }));
    assert_eq!(second, json!({ "slept": 300 }));
}

#[tokio::test]
async fn test_base64_strings_are_expanded() {
    let dir = tempfile::tempdir().unwrap();
    let client = ready_client(dir.path()).await;

    let reply = client
        .call_timeout("b64", json!({ "text": "héllo\nworld" }), Duration::from_secs(5))
        .await;

    assert_eq!(reply.into_result().unwrap(), json!({ "text": "héllo\nworld" }));
}

#[tokio::test]
async fn test_streaming_replies_share_one_token() {
    let dir = tempfile::tempdir().unwrap();
    let client = ready_client(dir.path()).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    client.call(
        "stream",
        json!({ "count": 4 }),
        Completion::new(move |reply| {
            let done = reply.data["done"].as_bool().unwrap_or(true);
            let _ = tx.send(reply.data);
            if done {
                Continuation::Close
            } else {
                Continuation::KeepOpen
            }
        }),
    );

    let mut indexes = Vec::new();
    for _ in 0..4 {
        let data = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        indexes.push(data["i"].as_u64().unwrap());
    }
    assert_eq!(indexes, vec![0, 1, 2, 3]);

    // handler closed on the last reply, so the sender side is gone too
    assert!(rx.recv().await.is_none());
    assert_eq!(client.pending_len(), 0);
}

#[tokio::test]
async fn test_worker_errors_reach_the_caller() {
    let dir = tempfile::tempdir().unwrap();
    let client = ready_client(dir.path()).await;

    let reply = client
        .call_timeout("fail", json!({ "message": "bad input" }), Duration::from_secs(5))
        .await;
    assert_eq!(reply.error_text(), "bad input");
    assert!(matches!(reply.error, Some(WorkerError::Remote(_))));

    let reply = client
        .call_timeout("no-such-method", json!({}), Duration::from_secs(5))
        .await;
    assert_eq!(reply.error_text(), "unknown method: no-such-method");
}

#[tokio::test]
async fn test_garbage_and_stray_tokens_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let client = ready_client(dir.path()).await;

    let reply = client
        .call_timeout("noise", json!({ "kept": 1 }), Duration::from_secs(5))
        .await;
    assert_eq!(reply.into_result().unwrap(), json!({ "kept": 1 }));

    // the worker is still usable afterwards
    let reply = client.call_timeout("echo", json!([1]), Duration::from_secs(5)).await;
    assert_eq!(reply.into_result().unwrap(), json!([1]));
}

#[tokio::test]
async fn test_timed_call_gives_up_but_leaves_request_in_flight() {
    let dir = tempfile::tempdir().unwrap();
    let client = ready_client(dir.path()).await;

    let reply = client
        .call_timeout("silent", json!({}), Duration::from_millis(200))
        .await;

    assert!(matches!(
        reply.error,
        Some(WorkerError::Timeout { ref method, .. }) if method == "silent"
    ));
    assert_eq!(reply.data, json!({}));
    assert_eq!(client.pending_len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_calls() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(ready_client(dir.path()).await);

    let blocking = client.clone();
    let (echoed, silent, elapsed) = tokio::task::spawn_blocking(move || {
        let echoed =
            blocking.call_blocking("echo", json!({ "sync": true }), Duration::from_secs(5));
        let started = Instant::now();
        let silent = blocking.call_blocking("silent", json!({}), Duration::from_secs(1));
        (echoed, silent, started.elapsed())
    })
    .await
    .unwrap();

    assert_eq!(echoed.into_result().unwrap(), json!({ "sync": true }));
    assert_eq!(silent.error_text(), "call(silent) timed out after 1s");
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(3));
}

#[tokio::test]
async fn test_tag_mismatch_is_reported_and_reply_delivered() {
    let dir = tempfile::tempdir().unwrap();
    let client = ready_client(dir.path()).await;
    let mut events = client.subscribe();

    let reply = client
        .call_timeout("tag", json!({ "tag": "stale-worker" }), Duration::from_secs(5))
        .await;
    assert!(reply.is_ok());

    let mismatch = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let WorkerEvent::TagMismatch { expected, received } = events.recv().await.unwrap() {
                return (expected, received);
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(mismatch, (TAG.to_string(), "stale-worker".to_string()));
}

#[tokio::test]
async fn test_panicking_handler_does_not_stop_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let client = ready_client(dir.path()).await;

    client.call(
        "echo",
        json!({}),
        Completion::once(|_| panic!("handler bug")),
    );

    let reply = call_once(&client, "echo", json!({ "after": "panic" })).await;
    assert_eq!(reply.into_result().unwrap(), json!({ "after": "panic" }));
}

#[tokio::test]
async fn test_shutdown_refuses_new_calls() {
    let dir = tempfile::tempdir().unwrap();
    let client = ready_client(dir.path()).await;

    let reply = call_once(&client, "echo", Value::Null).await;
    assert!(reply.is_ok());

    client.shutdown();
    let reply = call_once(&client, "echo", Value::Null).await;
    assert!(matches!(reply.error, Some(WorkerError::Shutdown)));
}
