//! Liveness, readiness, version, and status routes

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde_json::json;

use crate::directory::RegistrationStatus;
use crate::routes::json_response;
use crate::server::http::AppState;
use crate::server::protocol::PROTOCOL_VERSION;

/// Liveness probe: 200 whenever the process is serving.
pub fn health_check(state: Arc<AppState>) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::OK,
        &json!({
            "status": "ok",
            "service": "neuron",
            "organization_npi": state.args.organization_npi,
        }),
    )
}

/// Readiness probe: 200 only while the directory registration is healthy.
/// Degraded mode still serves handshakes; readiness reflects directory
/// linkage only.
pub async fn readiness_check(state: Arc<AppState>) -> Response<Full<Bytes>> {
    let status = state.registration.status().await;
    let ready = status == RegistrationStatus::Registered;
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    json_response(
        code,
        &json!({
            "ready": ready,
            "registration_status": status.as_str(),
        }),
    )
}

pub fn version_info() -> Response<Full<Bytes>> {
    json_response(
        StatusCode::OK,
        &json!({
            "version": env!("CARGO_PKG_VERSION"),
            "protocol": PROTOCOL_VERSION,
        }),
    )
}

/// Runtime status: session pressure, registration standing, audit head.
pub async fn status_check(state: Arc<AppState>) -> Response<Full<Bytes>> {
    let registration = state.registration.summary().await;
    let uptime_secs = (Utc::now() - state.started_at).num_seconds().max(0);

    json_response(
        StatusCode::OK,
        &json!({
            "organization_npi": state.args.organization_npi,
            "uptime_secs": uptime_secs,
            "sessions": {
                "active": state.admission.active_count(),
                "queued": state.admission.queued_count(),
                "ceiling": state.admission.ceiling(),
                "list": state.sessions.snapshot(),
            },
            "registration": registration,
            "audit": {
                "head_sequence": state.audit.head_sequence(),
            },
        }),
    )
}
