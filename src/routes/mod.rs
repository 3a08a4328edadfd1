//! REST route handlers
//!
//! Small authenticated surface for third-party operators, served from the
//! same listener as the handshake WebSocket. Handlers return plain
//! `Response<Full<Bytes>>` bodies; routing lives in `server::http`.

pub mod api;
pub mod health;

pub use api::handle_api_request;
pub use health::{health_check, readiness_check, status_check, version_info};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde_json::json;

pub(crate) fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

pub(crate) fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, &json!({ "error": message }))
}

pub(crate) fn not_found_response(path: &str) -> Response<Full<Bytes>> {
    error_response(StatusCode::NOT_FOUND, &format!("no route for {path}"))
}

pub(crate) fn bad_request_response(message: &str) -> Response<Full<Bytes>> {
    error_response(StatusCode::BAD_REQUEST, message)
}

/// CORS preflight for browser-based operator tooling.
pub(crate) fn preflight_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, DELETE, OPTIONS")
        .header("Access-Control-Allow-Headers", "Content-Type, X-API-Key")
        .body(Full::new(Bytes::new()))
        .unwrap()
}
