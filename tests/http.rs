//! End-to-end tests of the HTTP surface against a mock encoder

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use bytes::Bytes;
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tower::ServiceExt;

use encoder_relay::encoder::{EncoderConfig, ExitReason, MockSpawner};
use encoder_relay::{HttpServer, Relay, RelayHandle, ServerConfig};

fn setup() -> (Router, RelayHandle, MockSpawner) {
    let spawner = MockSpawner::new();
    let (relay, handle) = Relay::new(Arc::new(EncoderConfig::default()), spawner.clone());
    tokio::spawn(relay.run());

    let server = HttpServer::new(ServerConfig::default(), handle.clone());
    (server.router(), handle, spawner)
}

fn request(method: Method, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn health_json(app: &Router) -> serde_json::Value {
    let response = app
        .clone()
        .oneshot(request(Method::GET, "/health"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_health_when_idle() {
    let (app, _handle, _spawner) = setup();

    let response = app
        .clone()
        .oneshot(request(Method::GET, "/health"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/json"
    );
    assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");

    let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
    assert_eq!(&body[..], br#"{"ok":true,"encoder":false}"#);
}

#[tokio::test]
async fn test_preflight_has_no_side_effects() {
    let (app, handle, spawner) = setup();

    for uri in ["/stream", "/health", "/anything"] {
        let response = app
            .clone()
            .oneshot(request(Method::OPTIONS, uri))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let headers = response.headers();
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_METHODS], "GET, OPTIONS");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_HEADERS], "*");
    }

    assert_eq!(spawner.spawn_count(), 0);
    assert_eq!(handle.health().await.unwrap().clients, 0);
}

#[tokio::test]
async fn test_unknown_path_is_not_found() {
    let (app, _handle, spawner) = setup();

    for (method, uri) in [
        (Method::GET, "/"),
        (Method::GET, "/stream.webm"),
        (Method::DELETE, "/stream"),
        (Method::POST, "/health"),
    ] {
        let response = app.clone().oneshot(request(method, uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    assert_eq!(spawner.spawn_count(), 0);
}

#[tokio::test]
async fn test_stream_delivers_encoder_output() {
    let (app, _handle, spawner) = setup();

    let response = app
        .clone()
        .oneshot(request(Method::GET, "/stream"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "video/webm");
    assert_eq!(
        response.headers()[header::CACHE_CONTROL],
        "no-cache, no-store"
    );
    assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");

    // Encoder started on first attach
    assert_eq!(health_json(&app).await["encoder"], true);
    let instance = spawner.last_instance().unwrap();

    let mut body = response.into_body().into_data_stream();
    spawner.emit_chunk(instance, &b"\x1a\x45\xdf\xa3"[..]).await;
    spawner.emit_chunk(instance, &b"cluster"[..]).await;

    let first = body.next().await.unwrap().unwrap();
    let second = body.next().await.unwrap().unwrap();
    assert_eq!(first, Bytes::from_static(b"\x1a\x45\xdf\xa3"));
    assert_eq!(second, Bytes::from_static(b"cluster"));
}

#[tokio::test]
async fn test_disconnect_stops_encoder() {
    let (app, _handle, spawner) = setup();

    let first = app
        .clone()
        .oneshot(request(Method::GET, "/stream"))
        .await
        .unwrap();
    let second = app
        .clone()
        .oneshot(request(Method::GET, "/stream"))
        .await
        .unwrap();
    assert_eq!(spawner.spawn_count(), 1);
    let instance = spawner.last_instance().unwrap();

    drop(first);
    assert_eq!(health_json(&app).await["encoder"], true);

    drop(second);
    assert_eq!(health_json(&app).await["encoder"], false);
    assert_eq!(spawner.terminated(), vec![instance]);
}

#[tokio::test(start_paused = true)]
async fn test_stream_survives_encoder_crash() {
    let (app, handle, spawner) = setup();

    let response = app
        .clone()
        .oneshot(request(Method::GET, "/stream"))
        .await
        .unwrap();
    let mut body = response.into_body().into_data_stream();
    let first = spawner.last_instance().unwrap();

    spawner.emit_chunk(first, &b"before"[..]).await;
    assert_eq!(body.next().await.unwrap().unwrap(), Bytes::from_static(b"before"));

    spawner
        .emit_exit(first, ExitReason::Exited { code: Some(1) })
        .await;
    assert_eq!(health_json(&app).await["encoder"], false);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(spawner.spawn_count(), 2);
    assert_eq!(health_json(&app).await["encoder"], true);

    let second = spawner.last_instance().unwrap();
    spawner.emit_chunk(second, &b"after"[..]).await;
    assert_eq!(body.next().await.unwrap().unwrap(), Bytes::from_static(b"after"));

    assert_eq!(handle.stats().await.unwrap().restarts, 1);
}

#[tokio::test]
async fn test_shutdown_ends_open_streams() {
    let (app, handle, spawner) = setup();

    let response = app
        .clone()
        .oneshot(request(Method::GET, "/stream"))
        .await
        .unwrap();
    let mut body = response.into_body().into_data_stream();
    let instance = spawner.last_instance().unwrap();

    handle.shutdown().await.unwrap();
    assert!(body.next().await.is_none());
    assert_eq!(spawner.terminated(), vec![instance]);

    let response = app.oneshot(request(Method::GET, "/stream")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_serves_over_tcp_until_shutdown() {
    let spawner = MockSpawner::new();
    let (relay, handle) = Relay::new(Arc::new(EncoderConfig::default()), spawner.clone());
    let relay_task = tokio::spawn(relay.run());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let server = HttpServer::new(ServerConfig::with_addr(addr), handle);
    let server_task = tokio::spawn(async move {
        server
            .serve(listener, async {
                let _ = stop_rx.await;
            })
            .await
    });

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw);

    assert!(text.starts_with("HTTP/1.1 200 OK"));
    assert!(text.contains(r#"{"ok":true,"encoder":false}"#));

    stop_tx.send(()).unwrap();
    server_task.await.unwrap().unwrap();

    // Server dropped its handle, so the event loop winds down
    let stats = relay_task.await.unwrap();
    assert_eq!(stats.spawns, 0);
}
