#![allow(dead_code)]

use std::net::SocketAddr;

use axum::Json;
use axum::Router;
use serde_json::{Value, json};
use tokio::net::TcpListener;

/// Serve `app` on an ephemeral port and return its address.
pub async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

pub fn base_url(addr: SocketAddr) -> String {
    format!("http://{addr}/api")
}

pub fn ok(data: Value) -> Json<Value> {
    Json(json!({"code": 0, "message": "ok", "data": data}))
}

pub fn failure(code: i64, message: &str, data: Value) -> Json<Value> {
    Json(json!({"code": code, "message": message, "data": data}))
}
