use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use llm_bridge::http::HttpMethod;
use llm_bridge::http::headers::bearer_headers;
use llm_bridge::{
    BridgeError, Request, RequestOptions, RequestPool, RequestTask, TaskKind, TaskOutput,
    partition_batch,
};
use mockito::{Matcher, Server};
use serde_json::{Value, json};

const UNREACHABLE: &str = "http://127.0.0.1:1/unreachable";

fn session() -> Request {
    Request::new()
        .expect("reqwest transport")
        .with_timeout(Duration::from_secs(5))
        .enable_logging(true)
}

#[test]
fn batch_with_one_unreachable_url_keeps_siblings() {
    let mut server = Server::new();
    let first = server
        .mock("GET", "/models/a")
        .with_status(200)
        .with_body(r#"{"id":"a"}"#)
        .create();
    let second = server
        .mock("GET", "/models/b")
        .with_status(200)
        .with_body(r#"{"id":"b"}"#)
        .create();

    let urls = vec![
        format!("{}/models/a", server.url()),
        UNREACHABLE.to_string(),
        format!("{}/models/b", server.url()),
    ];
    let request = session();
    let results = request
        .get(&urls, &RequestOptions::default())
        .expect("batch never fails as a whole")
        .into_batch()
        .expect("batch result");

    first.assert();
    second.assert();
    assert_eq!(results.len(), 3);
    let failures: Vec<&String> = results
        .values()
        .filter_map(|outcome| outcome.as_ref().err())
        .collect();
    assert_eq!(failures.len(), 1, "failures: {failures:?}");
    assert!(failures[0].contains("127.0.0.1:1"));

    let body: Value = results[&urls[2]]
        .as_ref()
        .expect("second response")
        .json()
        .expect("json");
    assert_eq!(body["id"], "b");
    assert_eq!(request.len(), 3);

    let (ok, failed) = partition_batch(results);
    assert_eq!(ok.len(), 2);
    assert!(failed.contains_key(UNREACHABLE));
}

#[test]
fn single_post_sends_json_headers_and_query() {
    let mut server = Server::new();
    let mock = server
        .mock("POST", "/v1/chat/completions")
        .match_query(Matcher::UrlEncoded("trace".into(), "on".into()))
        .match_header("authorization", "Bearer sk-test")
        .match_header("content-type", "application/json")
        .match_body(Matcher::PartialJson(json!({"model": "gpt-4o-mini"})))
        .with_status(201)
        .with_body(r#"{"ok":true}"#)
        .create();

    let options = RequestOptions::json(json!({"model": "gpt-4o-mini", "messages": []}))
        .with_headers(bearer_headers("sk-test", false))
        .with_query("trace", "on");
    let response = session()
        .post(&[format!("{}/v1/chat/completions", server.url())], &options)
        .expect("post")
        .into_single()
        .expect("single response");

    mock.assert();
    assert_eq!(response.status, 201);
    assert!(response.is_success());
}

#[test]
fn non_success_status_is_still_a_response() {
    let mut server = Server::new();
    let mock = server
        .mock("DELETE", "/items/7")
        .with_status(404)
        .with_body("gone")
        .create();

    let response = session()
        .delete(&[format!("{}/items/7", server.url())], &RequestOptions::default())
        .expect("delete")
        .into_single()
        .expect("single response");

    mock.assert();
    assert_eq!(response.status, 404);
    assert!(!response.is_success());
    assert_eq!(response.text(), "gone");
}

#[test]
fn single_unreachable_url_raises_transport_error() {
    let err = session()
        .get(&[UNREACHABLE], &RequestOptions::default())
        .expect_err("connection refused");
    match err {
        BridgeError::Transport { url, .. } => assert!(url.contains("127.0.0.1:1")),
        other => panic!("unexpected error type: {other:?}"),
    }
}

#[test]
fn sse_stream_yields_events_in_order() {
    let mut server = Server::new();
    let mock = server
        .mock("POST", "/stream")
        .match_header("accept", "text/event-stream")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(concat!(
            ": connected\n\n",
            "event: delta\ndata: {\"text\":\"Hel\"}\n\n",
            "event: delta\ndata: {\"text\":\"lo\"}\n\n",
            "data: [DONE]\n\n",
        ))
        .create();

    let events: Vec<_> = session()
        .request_sse(
            HttpMethod::Post,
            &format!("{}/stream", server.url()),
            &RequestOptions::json(json!({"stream": true})),
        )
        .expect("stream opened")
        .collect::<Result<_, _>>()
        .expect("events");

    mock.assert();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].event.as_deref(), Some("delta"));
    assert_eq!(events[1].json().expect("json")["text"], "lo");
    assert!(events[2].is_done());
}

#[test]
fn sse_handshake_rejects_error_status() {
    let mut server = Server::new();
    let _denied = server
        .mock("GET", "/stream")
        .with_status(401)
        .with_body(r#"{"error":"invalid api key"}"#)
        .create();

    let result = session().request_sse(
        HttpMethod::Get,
        &format!("{}/stream", server.url()),
        &RequestOptions::default(),
    );
    match result {
        Err(BridgeError::HttpStatus { status, body, .. }) => {
            assert_eq!(status, 401);
            assert!(body.contains("invalid api key"));
        }
        Err(other) => panic!("unexpected error type: {other:?}"),
        Ok(_) => panic!("expected status error"),
    }
}

/// Serves one SSE response that writes `count` events, sleeping `gap` before each, then
/// holds the connection open for `linger` before closing it.
fn trickle_server(count: usize, gap: Duration, linger: Duration) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");
    thread::spawn(move || {
        let Ok((mut socket, _)) = listener.accept() else {
            return;
        };
        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        while !head.windows(4).any(|window| window == b"\r\n\r\n") {
            match socket.read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(n) => head.extend_from_slice(&buf[..n]),
            }
        }
        let _ = socket.write_all(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n",
        );
        let _ = socket.flush();
        for i in 0..count {
            thread::sleep(gap);
            if socket.write_all(format!("data: {i}\n\n").as_bytes()).is_err() {
                return;
            }
            let _ = socket.flush();
        }
        thread::sleep(linger);
    });
    format!("http://{addr}/stream")
}

#[test]
fn sse_stream_outlives_session_timeout_while_data_keeps_arriving() {
    let url = trickle_server(6, Duration::from_millis(300), Duration::ZERO);
    let request = Request::new()
        .expect("reqwest transport")
        .with_timeout(Duration::from_secs(1));

    let data: Vec<String> = request
        .request_sse(HttpMethod::Get, &url, &RequestOptions::default())
        .expect("stream opened")
        .map(|event| event.map(|event| event.data))
        .collect::<Result<_, _>>()
        .expect("every event arrives");

    assert_eq!(data, ["0", "1", "2", "3", "4", "5"]);
}

#[test]
fn sse_stream_fails_when_server_goes_silent() {
    let url = trickle_server(1, Duration::ZERO, Duration::from_millis(1500));
    let request = Request::new()
        .expect("reqwest transport")
        .with_timeout(Duration::from_millis(300));

    let items: Vec<_> = request
        .request_sse(HttpMethod::Get, &url, &RequestOptions::default())
        .expect("stream opened")
        .collect();

    assert_eq!(items.len(), 2, "items: {items:?}");
    assert_eq!(items[0].as_ref().expect("first event").data, "0");
    match &items[1] {
        Err(BridgeError::Transport { message, .. }) => {
            assert!(message.contains("no data received"), "message: {message}");
        }
        other => panic!("expected idle timeout, got {other:?}"),
    }
}

#[test]
fn pool_runs_mixed_tasks_independently() {
    let mut server = Server::new();
    let _save = server
        .mock("PUT", "/config")
        .with_status(200)
        .with_body("saved")
        .create();
    let _events = server
        .mock("GET", "/events")
        .with_status(200)
        .with_body("data: one\n\ndata: two\n\n")
        .create();

    let tasks = vec![
        RequestTask::new(
            "save",
            TaskKind::Http(HttpMethod::Put),
            vec![format!("{}/config", server.url())],
        )
        .with_options(RequestOptions::json(json!({"k": "v"}))),
        RequestTask::new(
            "listen",
            TaskKind::Sse(HttpMethod::Get),
            vec![format!("{}/events", server.url())],
        ),
        RequestTask::new("broken", TaskKind::Http(HttpMethod::Get), vec![UNREACHABLE.to_string()]),
        RequestTask::new("empty", TaskKind::Http(HttpMethod::Get), Vec::new()),
    ];

    let pool = RequestPool::new(Arc::new(session())).with_max_workers(2);
    let results = pool.execute_all(tasks);

    let ids: Vec<&str> = results.iter().map(|result| result.task_id.as_str()).collect();
    assert_eq!(ids, ["save", "listen", "broken", "empty"]);

    match &results[0].outcome {
        Ok(TaskOutput::Response(response)) => assert_eq!(response.text(), "saved"),
        other => panic!("unexpected outcome: {other:?}"),
    }
    match &results[1].outcome {
        Ok(TaskOutput::Events(events)) => {
            let data: Vec<&str> = events.iter().map(|event| event.data.as_str()).collect();
            assert_eq!(data, ["one", "two"]);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(!results[2].is_success());
    let message = results[3].outcome.as_ref().expect_err("empty url list");
    assert!(message.contains("URL"), "message: {message}");
}
