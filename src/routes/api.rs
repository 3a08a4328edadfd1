//! Operator REST API (`/api/v1/*`)
//!
//! Consumer of the relationship store, termination handler, registration
//! service, and audit log. When an API key is configured every request must
//! carry it in `X-API-Key`; every request is audited under `api_access`.

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::audit::AuditCategory;
use crate::directory::ProviderError;
use crate::relationship::RelationshipStatus;
use crate::routes::{bad_request_response, error_response, json_response, not_found_response};
use crate::server::http::AppState;
use crate::types::NeuronError;

#[derive(Debug, Deserialize)]
struct TerminateRequest {
    provider_npi: String,
    reason: String,
}

#[derive(Debug, Deserialize)]
struct AddProviderRequest {
    provider_npi: String,
}

/// Entry point for everything under `/api/v1`.
pub async fn handle_api_request(
    state: Arc<AppState>,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(|q| q.to_string());

    if let Some(expected) = state.args.api_key.as_deref() {
        let presented = req
            .headers()
            .get("x-api-key")
            .and_then(|v| v.to_str().ok());
        if presented != Some(expected) {
            return error_response(StatusCode::UNAUTHORIZED, "missing or invalid API key");
        }
    }

    if let Err(e) = state.audit.append(
        AuditCategory::ApiAccess,
        "api_request",
        None,
        Some(json!({ "method": method.as_str(), "path": path })),
    ) {
        warn!("Failed to audit API access: {}", e);
    }

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return bad_request_response(&format!("unreadable body: {e}")),
    };

    match (method, path.as_str()) {
        (Method::GET, "/api/v1/relationships") => list_relationships(&state, query.as_deref()),
        (Method::GET, p) if p.starts_with("/api/v1/relationships/") => {
            match p.trim_start_matches("/api/v1/relationships/") {
                id if !id.contains('/') => get_relationship(&state, id),
                _ => not_found_response(p),
            }
        }
        (Method::POST, p)
            if p.starts_with("/api/v1/relationships/") && p.ends_with("/terminate") =>
        {
            let id = p
                .trim_start_matches("/api/v1/relationships/")
                .trim_end_matches("/terminate");
            terminate_relationship(&state, id, &body)
        }
        (Method::GET, "/api/v1/providers") => list_providers(&state),
        (Method::POST, "/api/v1/providers") => add_provider(&state, &body).await,
        (Method::DELETE, p) if p.starts_with("/api/v1/providers/") => {
            let npi = p.trim_start_matches("/api/v1/providers/");
            remove_provider(&state, npi).await
        }
        (Method::GET, "/api/v1/audit/verify") => verify_audit(&state),
        (Method::GET, "/api/v1/directory/search") => {
            directory_search(&state, query.as_deref()).await
        }
        (Method::GET, p) if p.starts_with("/api/v1/directory/") => {
            let npi = p.trim_start_matches("/api/v1/directory/");
            directory_lookup(&state, npi).await
        }
        (_, p) => not_found_response(p),
    }
}

async fn directory_lookup(state: &Arc<AppState>, npi: &str) -> Response<Full<Bytes>> {
    match state.registration.lookup_by_npi(npi).await {
        Ok(Some(listing)) => json_response(StatusCode::OK, &json!({ "neuron": listing })),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "no neuron registered for that NPI"),
        Err(e) => error_response(StatusCode::BAD_GATEWAY, &format!("directory error: {e}")),
    }
}

async fn directory_search(state: &Arc<AppState>, query: Option<&str>) -> Response<Full<Bytes>> {
    let q = match query_param(query, "q") {
        Some(q) if !q.is_empty() => q,
        _ => return bad_request_response("missing search query parameter 'q'"),
    };
    match state.registration.search(&q).await {
        Ok(results) => {
            let count = results.len();
            json_response(StatusCode::OK, &json!({ "results": results, "count": count }))
        }
        Err(e) => error_response(StatusCode::BAD_GATEWAY, &format!("directory error: {e}")),
    }
}

fn list_relationships(state: &Arc<AppState>, query: Option<&str>) -> Response<Full<Bytes>> {
    let patient = query_param(query, "patient");
    let provider = query_param(query, "provider");
    let status = query_param(query, "status");

    let result = if let Some(patient) = patient {
        state.relationships.find_by_patient(&patient)
    } else if let Some(provider) = provider {
        state.relationships.find_by_provider(&provider)
    } else if let Some(status) = status {
        match status.as_str() {
            "active" => state.relationships.find_by_status(RelationshipStatus::Active),
            "terminated" => state
                .relationships
                .find_by_status(RelationshipStatus::Terminated),
            other => return bad_request_response(&format!("unknown status filter: {other}")),
        }
    } else {
        state.relationships.find_all()
    };

    match result {
        Ok(relationships) => {
            let count = relationships.len();
            json_response(
                StatusCode::OK,
                &json!({ "relationships": relationships, "count": count }),
            )
        }
        Err(e) => storage_error(&e),
    }
}

fn get_relationship(state: &Arc<AppState>, id: &str) -> Response<Full<Bytes>> {
    match state.relationships.find_by_id(id) {
        Ok(Some(relationship)) => {
            let termination = state.termination.record_for(id).ok().flatten();
            json_response(
                StatusCode::OK,
                &json!({ "relationship": relationship, "termination": termination }),
            )
        }
        Ok(None) => error_response(StatusCode::NOT_FOUND, "relationship not found"),
        Err(e) => storage_error(&e),
    }
}

fn terminate_relationship(
    state: &Arc<AppState>,
    id: &str,
    body: &Bytes,
) -> Response<Full<Bytes>> {
    let request: TerminateRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => return bad_request_response(&format!("invalid terminate request: {e}")),
    };

    match state
        .termination
        .terminate(id, &request.provider_npi, &request.reason)
    {
        Ok(record) => json_response(StatusCode::OK, &json!({ "termination": record })),
        Err(NeuronError::NotFound(_)) => {
            error_response(StatusCode::NOT_FOUND, "relationship not found")
        }
        Err(NeuronError::AlreadyTerminated(_)) => {
            error_response(StatusCode::CONFLICT, "ALREADY_TERMINATED")
        }
        Err(NeuronError::ProviderMismatch(_)) => error_response(
            StatusCode::FORBIDDEN,
            "relationship belongs to a different provider",
        ),
        Err(e) => storage_error(&e),
    }
}

fn list_providers(state: &Arc<AppState>) -> Response<Full<Bytes>> {
    match state.registration.providers() {
        Ok(providers) => {
            let count = providers.len();
            json_response(
                StatusCode::OK,
                &json!({ "providers": providers, "count": count }),
            )
        }
        Err(e) => storage_error(&e),
    }
}

async fn add_provider(state: &Arc<AppState>, body: &Bytes) -> Response<Full<Bytes>> {
    let request: AddProviderRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => return bad_request_response(&format!("invalid provider request: {e}")),
    };

    match state.registration.add_provider(&request.provider_npi).await {
        Ok(provider) => json_response(StatusCode::OK, &json!({ "provider": provider })),
        Err(e) => provider_error(&e),
    }
}

async fn remove_provider(state: &Arc<AppState>, npi: &str) -> Response<Full<Bytes>> {
    match state.registration.remove_provider(npi).await {
        Ok(()) => json_response(StatusCode::OK, &json!({ "removed": npi })),
        Err(e) => provider_error(&e),
    }
}

/// Offline chain verification, exposed for operator tooling.
fn verify_audit(state: &Arc<AppState>) -> Response<Full<Bytes>> {
    match crate::audit::verify(state.audit.path()) {
        Ok(report) => json_response(StatusCode::OK, &serde_json::to_value(&report).unwrap_or_default()),
        Err(e) => storage_error(&NeuronError::Audit(e.to_string())),
    }
}

fn provider_error(error: &ProviderError) -> Response<Full<Bytes>> {
    match error {
        ProviderError::InvalidNpi(npi) => {
            bad_request_response(&format!("invalid provider NPI: {npi}"))
        }
        ProviderError::NotRegistered => error_response(
            StatusCode::CONFLICT,
            "neuron is not registered with the directory",
        ),
        ProviderError::Directory(e) => {
            error_response(StatusCode::BAD_GATEWAY, &format!("directory error: {e}"))
        }
        ProviderError::Storage(NeuronError::NotFound(npi)) => {
            error_response(StatusCode::NOT_FOUND, &format!("unknown provider: {npi}"))
        }
        ProviderError::Storage(e) => storage_error(e),
    }
}

fn storage_error(error: &NeuronError) -> Response<Full<Bytes>> {
    warn!("API storage error: {}", error);
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    let query = query?;
    for param in query.split('&') {
        if let Some((key, value)) = param.split_once('=') {
            if key == name {
                return Some(value.to_string());
            }
        }
    }
    None
}
