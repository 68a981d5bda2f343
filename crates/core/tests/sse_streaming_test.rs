mod common;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use common::{app_state, dispatcher, write_agent};
use futures::StreamExt;
use lavs_core::build_router;
use serde_json::json;
use std::time::Duration;
use tower::ServiceExt;

fn feed_manifest() -> serde_json::Value {
    json!({
        "name": "feed",
        "endpoints": [
            { "id": "events", "method": "subscription", "handler": { "type": "function", "function": "noop" } },
            { "id": "post", "method": "mutation", "handler": { "type": "function", "function": "post" } },
            { "id": "list", "method": "query", "handler": { "type": "function", "function": "post" } }
        ]
    })
}

async fn next_chunk<S>(stream: &mut S) -> String
where
    S: futures::Stream<Item = Result<axum::body::Bytes, axum::Error>> + Unpin,
{
    let chunk = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("SSE frame within 2s")
        .expect("stream still open")
        .unwrap();
    String::from_utf8(chunk.to_vec()).unwrap()
}

#[tokio::test]
async fn test_subscribe_streams_connected_and_events() {
    let root = tempfile::tempdir().unwrap();
    write_agent(root.path(), "feed", &feed_manifest());

    let d = dispatcher(root.path());
    d.functions().register_fn("post", |input, _ctx| async move { anyhow::Ok(input) });
    let app = build_router(app_state(d.clone()));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/lavs/feed/events/subscribe")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "text/event-stream"
    );

    let mut stream = response.into_body().into_data_stream();
    let first = next_chunk(&mut stream).await;
    assert!(first.contains("event: connected"));
    assert!(first.contains("\"endpointId\":\"events\""));
    assert_eq!(d.subscriptions().count(), 1);

    d.call_endpoint("feed", "post", json!({ "text": "hi" }), None)
        .await
        .unwrap();
    let second = next_chunk(&mut stream).await;
    assert!(second.contains("event: post:mutated"));
    assert!(second.contains("\"text\":\"hi\""));

    let sent = d
        .subscriptions()
        .publish("feed", "events", "custom", &json!({ "n": 1 }));
    assert_eq!(sent, 1);
    let third = next_chunk(&mut stream).await;
    assert!(third.contains("event: custom"));

    // client goes away
    drop(stream);
    assert_eq!(d.subscriptions().count(), 0);
}

#[tokio::test]
async fn test_subscribe_rejects_non_subscription_endpoint() {
    let root = tempfile::tempdir().unwrap();
    write_agent(root.path(), "feed", &feed_manifest());
    let app = build_router(app_state(dispatcher(root.path())));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/lavs/feed/list/subscribe")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_shutdown_sends_disconnected_and_ends_stream() {
    let root = tempfile::tempdir().unwrap();
    write_agent(root.path(), "feed", &feed_manifest());
    let d = dispatcher(root.path());
    let app = build_router(app_state(d.clone()));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/lavs/feed/events/subscribe")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let mut stream = response.into_body().into_data_stream();
    let _connected = next_chunk(&mut stream).await;

    d.shutdown();

    let bye = next_chunk(&mut stream).await;
    assert!(bye.contains("event: disconnected"));
    let end = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .unwrap();
    assert!(end.is_none());
}
