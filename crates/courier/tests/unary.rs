mod common;

use std::time::{Duration, Instant};

use axum::Router;
use axum::body::Bytes;
use axum::extract::RawQuery;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use courier_client::{
    ApiClient, ClientConfig, ClientEvent, FormData, RequestError, RequestSpec,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

const PNG: &[u8] = b"\x89PNG\r\n\x1a\n";

#[derive(Debug, Deserialize, PartialEq)]
struct User {
    id: u64,
    name: String,
}

async fn user() -> Response {
    common::ok(json!({"id": 1, "name": "kiki"})).into_response()
}

async fn invalid() -> Response {
    common::failure(40022, "name already taken", json!({"field": "name"})).into_response()
}

async fn boom() -> (StatusCode, &'static str) {
    (StatusCode::INTERNAL_SERVER_ERROR, "internal")
}

async fn avatar() -> Response {
    ([(header::CONTENT_TYPE, "image/png")], PNG).into_response()
}

async fn query(RawQuery(query): RawQuery) -> Response {
    common::ok(json!(query)).into_response()
}

async fn echo(headers: HeaderMap, body: Bytes) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    common::ok(json!({
        "content_type": content_type,
        "body": String::from_utf8_lossy(&body),
    }))
    .into_response()
}

async fn hang() -> StatusCode {
    std::future::pending::<()>().await;
    StatusCode::OK
}

async fn client() -> ApiClient {
    let app = Router::new()
        .route("/api/user", get(user))
        .route("/api/invalid", get(invalid))
        .route("/api/boom", get(boom))
        .route("/api/avatar", get(avatar))
        .route("/api/query", get(query))
        .route("/api/echo", any(echo))
        .route("/api/hang", get(hang));
    let addr = common::serve(app).await;
    ApiClient::new(ClientConfig::new(common::base_url(addr))).unwrap()
}

#[tokio::test]
async fn envelope_success_yields_data() {
    let client = client().await;
    let user: User = client.get("/user").await.unwrap();
    assert_eq!(
        user,
        User {
            id: 1,
            name: "kiki".to_string()
        }
    );
}

#[tokio::test]
async fn envelope_failure_carries_message_and_data() {
    let client = client().await;
    let mut events = client.subscribe();

    let err = client.get::<User>("/invalid").await.unwrap_err();
    match &err {
        RequestError::Envelope {
            code,
            message,
            data,
        } => {
            assert_eq!(*code, 40022);
            assert_eq!(message, "name already taken");
            assert_eq!(data, &json!({"field": "name"}));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    match events.recv().await.unwrap() {
        ClientEvent::RequestFailed { message, .. } => assert_eq!(message, "name already taken"),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn http_failure_is_not_an_envelope() {
    let client = client().await;
    let err = client.get::<User>("/boom").await.unwrap_err();
    match err {
        RequestError::HttpStatus { status, body, .. } => {
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(body, "internal");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn blob_skips_envelope() {
    let client = client().await;
    let bytes = client.blob(RequestSpec::get("/avatar")).await.unwrap();
    assert_eq!(&bytes[..], PNG);
}

#[tokio::test]
async fn query_string_drops_missing_values() {
    let client = client().await;
    let seen: String = client
        .send(
            RequestSpec::get("/query")
                .query("a", 1)
                .query_opt("b", None::<String>)
                .query("c", "x y"),
        )
        .await
        .unwrap();
    assert_eq!(seen, "a=1&c=x%20y");
}

#[tokio::test]
async fn content_type_follows_body() {
    let client = client().await;

    let seen: Value = client.post("/echo", &json!({"a": 1})).await.unwrap();
    assert_eq!(seen["content_type"], "application/json;charset=UTF-8");
    assert_eq!(seen["body"], r#"{"a":1}"#);

    let seen: Value = client.send(RequestSpec::post("/echo")).await.unwrap();
    assert_eq!(seen["content_type"], "text/plain;charset=UTF-8");

    let form = FormData::new()
        .text("name", "kiki")
        .file("avatar", "a.png", PNG, Some("image/png"));
    let seen: Value = client
        .send(RequestSpec::post("/echo").form(form))
        .await
        .unwrap();
    let content_type = seen["content_type"].as_str().unwrap();
    assert!(content_type.starts_with("multipart/form-data; boundary="));
    assert!(seen["body"].as_str().unwrap().contains("name=\"name\""));
}

#[tokio::test]
async fn short_timeout_aborts_the_call() {
    let client = client().await;
    let started = Instant::now();
    let err = client
        .send::<Value>(RequestSpec::get("/hang").timeout(Duration::from_millis(1)))
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "{err:?}");
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn caller_cancellation_aborts_the_call() {
    let client = client().await;
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let err = client
        .send::<Value>(RequestSpec::get("/hang").cancel_on(token))
        .await
        .unwrap_err();
    assert!(matches!(err, RequestError::Cancelled { .. }));
}

#[tokio::test]
async fn shutdown_aborts_in_flight_calls() {
    let client = client().await;
    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.get::<Value>("/hang").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.shutdown();

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, RequestError::Cancelled { .. }));
    assert!(client.is_shut_down());
}
