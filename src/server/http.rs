//! HTTP routes
//!
//! | Method | Path      | Response                                      |
//! |--------|-----------|-----------------------------------------------|
//! | GET    | `/stream` | Live WebM body, open until the client leaves  |
//! | GET    | `/health` | `{"ok":true,"encoder":<bool>}`                |
//! | OPTIONS| any       | 204, CORS headers only                        |
//! | other  | any       | 404                                           |
//!
//! Every response carries permissive CORS headers.

use axum::{
    body::Body,
    extract::State,
    http::{
        header::{
            ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
            ACCESS_CONTROL_ALLOW_ORIGIN, CACHE_CONTROL, CONNECTION, CONTENT_TYPE,
        },
        HeaderValue, Method, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tower::ServiceBuilder;
use tower_http::{set_header::SetResponseHeaderLayer, trace::TraceLayer};

use crate::encoder::EncoderPhase;
use crate::relay::{HealthReport, RelayError, RelayHandle};

/// Media type of the encoder output
pub const STREAM_CONTENT_TYPE: &str = "video/webm";

#[derive(Clone)]
struct AppState {
    relay: RelayHandle,
    max_pending_bytes: usize,
}

/// Build the relay router
pub fn router(relay: RelayHandle, max_pending_bytes: usize) -> Router {
    let state = AppState {
        relay,
        max_pending_bytes,
    };

    Router::new()
        .route(
            "/stream",
            get(stream_handler)
                .head(not_found)
                .options(preflight)
                .fallback(not_found),
        )
        .route(
            "/health",
            get(health_handler)
                .head(not_found)
                .options(preflight)
                .fallback(not_found),
        )
        .fallback(fallback)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(SetResponseHeaderLayer::overriding(
                    ACCESS_CONTROL_ALLOW_ORIGIN,
                    HeaderValue::from_static("*"),
                ))
                .layer(SetResponseHeaderLayer::overriding(
                    ACCESS_CONTROL_ALLOW_METHODS,
                    HeaderValue::from_static("GET, OPTIONS"),
                ))
                .layer(SetResponseHeaderLayer::overriding(
                    ACCESS_CONTROL_ALLOW_HEADERS,
                    HeaderValue::from_static("*"),
                )),
        )
}

/// `GET /stream`
///
/// Attaches a consumer and streams every chunk broadcast after the attach.
/// The consumer detaches when the body is dropped.
async fn stream_handler(State(state): State<AppState>) -> Response {
    let subscription = match state.relay.subscribe(state.max_pending_bytes).await {
        Ok(subscription) => subscription,
        Err(RelayError::ShuttingDown) | Err(RelayError::Closed) => {
            return (StatusCode::SERVICE_UNAVAILABLE, "relay is shutting down\n").into_response();
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to attach consumer");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    tracing::info!(sink_id = %subscription.id(), "Consumer connected");

    (
        [
            (CONTENT_TYPE, STREAM_CONTENT_TYPE),
            (CACHE_CONTROL, "no-cache, no-store"),
            (CONNECTION, "keep-alive"),
        ],
        Body::from_stream(subscription.into_stream()),
    )
        .into_response()
}

/// `GET /health`
async fn health_handler(State(state): State<AppState>) -> Response {
    match state.relay.health().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "Health check without relay");
            let report = HealthReport {
                ok: false,
                encoder: false,
                phase: EncoderPhase::NotRunning,
                clients: 0,
            };
            (StatusCode::SERVICE_UNAVAILABLE, Json(report)).into_response()
        }
    }
}

async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Unrouted paths: preflight for OPTIONS, 404 otherwise
async fn fallback(method: Method) -> StatusCode {
    if method == Method::OPTIONS {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}
