//! WebSocket handshake connections
//!
//! Upgrade handling and the per-connection state machine:
//!
//! ```text
//! CONNECTED -> AUTHENTICATING -> (existing) COMPLETED
//!                             -> CHALLENGED -> COMPLETED | FAILED
//! ```
//!
//! The admission permit is acquired before the upgrade and released when the
//! connection task ends, so client close, timers, verification failure, and
//! server shutdown all converge on the same cleanup. After a successful
//! handshake the broker returns the provider endpoint and closes: it never
//! relays traffic between agents.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use serde_json::json;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::audit::AuditCategory;
use crate::consent::challenge::CHALLENGE_TTL;
use crate::consent::{verifier, AuthOutcome, HandshakeError};
use crate::server::admission::{Admission, AdmissionPermit};
use crate::server::http::AppState;
use crate::server::protocol::{
    self, codes, ClientFrame, ServerFrame, CLOSE_AUTH_TIMEOUT, CLOSE_GOING_AWAY,
    CLOSE_INVALID_MESSAGE, CLOSE_NORMAL,
};
use crate::server::session::SessionStatus;

type WsStream =
    hyper_tungstenite::WebSocketStream<hyper_util::rt::TokioIo<hyper::upgrade::Upgraded>>;

/// Handle an upgrade request on the handshake path.
///
/// At the ceiling the request is held (not upgraded, not refused) until a
/// session slot opens or the queue timer fires; the timer path answers 503
/// and is the only rejection.
pub async fn handle_handshake_upgrade(
    state: Arc<AppState>,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let permit = match state.admission.admit() {
        Admission::Immediate(permit) => permit,
        Admission::Queued(queued) => {
            let timeout = Duration::from_millis(state.args.queue_timeout_ms);
            match queued.wait(timeout).await {
                Some(permit) => permit,
                None => {
                    debug!("Queued handshake upgrade timed out at the ceiling");
                    return Response::builder()
                        .status(StatusCode::SERVICE_UNAVAILABLE)
                        .header("Content-Type", "application/json")
                        .body(Full::new(Bytes::from(format!(
                            r#"{{"error":"{}","message":"handshake ceiling wait expired"}}"#,
                            codes::CEILING_TIMEOUT
                        ))))
                        .unwrap();
                }
            }
        }
    };

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(state.args.max_frame_bytes);
    ws_config.max_frame_size = Some(state.args.max_frame_bytes);

    match hyper_tungstenite::upgrade(req, Some(ws_config)) {
        Ok((response, websocket)) => {
            tokio::spawn(async move {
                match websocket.await {
                    Ok(ws) => run_connection(state, ws, permit).await,
                    Err(e) => {
                        warn!("Handshake WebSocket upgrade failed: {:?}", e);
                        drop(permit);
                    }
                }
            });
            response.map(|_| Full::new(Bytes::new()))
        }
        Err(e) => {
            warn!("Handshake WebSocket upgrade error: {:?}", e);
            drop(permit);
            Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(Full::new(Bytes::from(format!(
                    "WebSocket upgrade failed: {e}"
                ))))
                .unwrap()
        }
    }
}

async fn run_connection(state: Arc<AppState>, mut ws: WsStream, permit: AdmissionPermit) {
    let session_id = state.sessions.open();
    let mut shutdown = state.shutdown.subscribe();

    drive(&state, &mut ws, session_id, &mut shutdown).await;

    state.sessions.close(session_id);
    // Releases the admission slot; the oldest queued upgrade promotes.
    drop(permit);
}

enum FrameOutcome {
    Frame(String),
    ClosedByPeer,
    Timeout,
    Shutdown,
    Binary,
    TooLarge,
    StreamError,
}

async fn next_text_frame(
    ws: &mut WsStream,
    wait: Duration,
    shutdown: &mut broadcast::Receiver<()>,
    max_bytes: usize,
) -> FrameOutcome {
    loop {
        tokio::select! {
            result = tokio::time::timeout(wait, ws.next()) => match result {
                Err(_) => return FrameOutcome::Timeout,
                Ok(None) => return FrameOutcome::ClosedByPeer,
                Ok(Some(Err(e))) => {
                    debug!("WebSocket read error: {}", e);
                    return FrameOutcome::StreamError;
                }
                Ok(Some(Ok(message))) => match message {
                    Message::Text(text) => {
                        if text.len() > max_bytes {
                            return FrameOutcome::TooLarge;
                        }
                        return FrameOutcome::Frame(text);
                    }
                    Message::Binary(_) => return FrameOutcome::Binary,
                    Message::Ping(payload) => {
                        let _ = ws.send(Message::Pong(payload)).await;
                        continue;
                    }
                    Message::Close(_) => return FrameOutcome::ClosedByPeer,
                    _ => continue,
                },
            },
            _ = shutdown.recv() => return FrameOutcome::Shutdown,
        }
    }
}

async fn drive(
    state: &Arc<AppState>,
    ws: &mut WsStream,
    session_id: Uuid,
    shutdown: &mut broadcast::Receiver<()>,
) {
    let auth_timeout = Duration::from_millis(state.args.auth_timeout_ms);
    let max_bytes = state.args.max_frame_bytes;

    // ---- first frame: handshake.auth ----
    let text = match next_text_frame(ws, auth_timeout, shutdown, max_bytes).await {
        FrameOutcome::Frame(text) => text,
        FrameOutcome::Timeout => {
            audit_connection(state, "timeout", None, json!({ "session_id": session_id }));
            state
                .sessions
                .update(session_id, |s| s.status = SessionStatus::Failed);
            send_frame(
                ws,
                &ServerFrame::error(codes::AUTH_TIMEOUT, "no auth message received"),
            )
            .await;
            close_with(ws, CLOSE_AUTH_TIMEOUT, "auth timeout").await;
            return;
        }
        other => {
            reject_invalid_frame(state, ws, session_id, other).await;
            return;
        }
    };

    let auth = match serde_json::from_str::<ClientFrame>(&text) {
        Ok(ClientFrame::Auth(auth)) => auth,
        Ok(_) => {
            send_frame(
                ws,
                &ServerFrame::error(codes::INVALID_MESSAGE, "expected handshake.auth"),
            )
            .await;
            close_with(ws, CLOSE_INVALID_MESSAGE, "invalid message").await;
            return;
        }
        Err(e) => {
            send_frame(
                ws,
                &ServerFrame::error(codes::INVALID_MESSAGE, format!("unparseable frame: {e}")),
            )
            .await;
            close_with(ws, CLOSE_INVALID_MESSAGE, "invalid message").await;
            return;
        }
    };

    audit_connection(
        state,
        "handshake_started",
        Some(&auth.patient_agent_id),
        json!({ "session_id": session_id }),
    );
    state.sessions.update(session_id, |s| {
        s.patient_agent_id = Some(auth.patient_agent_id.clone());
    });

    // Decode the token parts; the payload bytes stay exactly as transmitted.
    let decoded = verifier::decode_payload(&auth.consent_token_payload)
        .and_then(|payload| {
            let signature = verifier::decode_signature(&auth.consent_token_signature)?;
            Ok((payload, signature))
        })
        .and_then(|(payload, signature)| {
            let key = verifier::import_public_key(&auth.patient_public_key)?;
            Ok((payload, signature, key))
        });
    let (payload, token_signature, patient_key) = match decoded {
        Ok(parts) => parts,
        Err(e) => {
            fail_handshake(state, ws, session_id, &HandshakeError::Consent(e)).await;
            return;
        }
    };

    let outcome = state.engine.authenticate(
        &payload,
        &token_signature,
        &auth.patient_agent_id,
        &patient_key,
    );
    let challenge = match outcome {
        Err(e) => {
            fail_handshake(state, ws, session_id, &e).await;
            return;
        }
        Ok(AuthOutcome::Existing {
            relationship_id,
            claims,
        }) => {
            complete_session(state, ws, session_id, &relationship_id, &claims.provider_npi, "existing")
                .await;
            return;
        }
        Ok(AuthOutcome::Challenged { challenge, claims }) => {
            state.sessions.update(session_id, |s| {
                s.status = SessionStatus::Challenged;
                s.provider_npi = Some(claims.provider_npi.clone());
            });
            challenge
        }
    };

    send_frame(
        ws,
        &ServerFrame::Challenge {
            nonce: challenge.nonce.clone(),
            provider_npi: challenge.provider_npi.clone(),
            organization_npi: challenge.organization_npi.clone(),
        },
    )
    .await;

    // ---- second frame: handshake.challenge_response ----
    // Bounded by the challenge TTL so a silent peer cannot hold a slot past
    // nonce expiry.
    let text = match next_text_frame(ws, CHALLENGE_TTL, shutdown, max_bytes).await {
        FrameOutcome::Frame(text) => text,
        FrameOutcome::Timeout => {
            audit_connection(state, "timeout", None, json!({ "session_id": session_id }));
            state
                .sessions
                .update(session_id, |s| s.status = SessionStatus::Failed);
            send_frame(
                ws,
                &ServerFrame::error(codes::AUTH_TIMEOUT, "no challenge response received"),
            )
            .await;
            close_with(ws, CLOSE_AUTH_TIMEOUT, "auth timeout").await;
            return;
        }
        other => {
            reject_invalid_frame(state, ws, session_id, other).await;
            return;
        }
    };

    let signed_nonce = match serde_json::from_str::<ClientFrame>(&text) {
        Ok(ClientFrame::ChallengeResponse { signed_nonce }) => signed_nonce,
        Ok(_) => {
            send_frame(
                ws,
                &ServerFrame::error(codes::INVALID_MESSAGE, "expected handshake.challenge_response"),
            )
            .await;
            close_with(ws, CLOSE_INVALID_MESSAGE, "invalid message").await;
            return;
        }
        Err(e) => {
            send_frame(
                ws,
                &ServerFrame::error(codes::INVALID_MESSAGE, format!("unparseable frame: {e}")),
            )
            .await;
            close_with(ws, CLOSE_INVALID_MESSAGE, "invalid message").await;
            return;
        }
    };

    let signed_nonce = match verifier::decode_signature(&signed_nonce) {
        Ok(signature) => signature,
        Err(e) => {
            fail_handshake(state, ws, session_id, &HandshakeError::Consent(e)).await;
            return;
        }
    };

    match state
        .engine
        .complete(&challenge.nonce, &signed_nonce, &payload, &token_signature)
    {
        Ok(outcome) => {
            complete_session(
                state,
                ws,
                session_id,
                &outcome.relationship_id,
                &outcome.provider_npi,
                outcome.status.as_str(),
            )
            .await;
        }
        Err(e) => {
            fail_handshake(state, ws, session_id, &e).await;
        }
    }
}

/// Send `handshake.complete`, audit it, and step out (close 1000).
async fn complete_session(
    state: &Arc<AppState>,
    ws: &mut WsStream,
    session_id: Uuid,
    relationship_id: &str,
    provider_npi: &str,
    status: &'static str,
) {
    state.sessions.update(session_id, |s| {
        s.status = SessionStatus::Completed;
        s.provider_npi = Some(provider_npi.to_string());
    });
    audit_connection(
        state,
        "handshake_completed",
        None,
        json!({
            "session_id": session_id,
            "relationship_id": relationship_id,
            "status": status,
        }),
    );
    send_frame(
        ws,
        &ServerFrame::Complete {
            relationship_id: relationship_id.to_string(),
            provider_endpoint: state.engine.provider_endpoint(provider_npi),
            status,
        },
    )
    .await;
    close_with(ws, CLOSE_NORMAL, "handshake complete").await;
}

async fn fail_handshake(
    state: &Arc<AppState>,
    ws: &mut WsStream,
    session_id: Uuid,
    error: &HandshakeError,
) {
    let (code, close_code) = protocol::error_mapping(error);
    let detail_code = match error {
        HandshakeError::Consent(consent) => consent.code(),
        _ => code,
    };
    audit_connection(
        state,
        "handshake_failed",
        None,
        json!({ "session_id": session_id, "code": detail_code }),
    );
    state
        .sessions
        .update(session_id, |s| s.status = SessionStatus::Failed);
    send_frame(ws, &ServerFrame::error(code, error.to_string())).await;
    close_with(ws, close_code, "handshake failed").await;
}

async fn reject_invalid_frame(
    state: &Arc<AppState>,
    ws: &mut WsStream,
    session_id: Uuid,
    outcome: FrameOutcome,
) {
    match outcome {
        FrameOutcome::Binary => {
            state
                .sessions
                .update(session_id, |s| s.status = SessionStatus::Failed);
            send_frame(
                ws,
                &ServerFrame::error(codes::INVALID_MESSAGE, "binary frames are not accepted"),
            )
            .await;
            close_with(ws, CLOSE_INVALID_MESSAGE, "invalid message").await;
        }
        FrameOutcome::TooLarge => {
            state
                .sessions
                .update(session_id, |s| s.status = SessionStatus::Failed);
            send_frame(
                ws,
                &ServerFrame::error(codes::INVALID_MESSAGE, "frame exceeds maximum size"),
            )
            .await;
            close_with(ws, CLOSE_INVALID_MESSAGE, "invalid message").await;
        }
        FrameOutcome::Shutdown => {
            close_with(ws, CLOSE_GOING_AWAY, "server shutting down").await;
        }
        // Peer closed or the stream broke; nothing left to say.
        _ => {}
    }
}

async fn send_frame(ws: &mut WsStream, frame: &ServerFrame) {
    match serde_json::to_string(frame) {
        Ok(text) => {
            if let Err(e) = ws.send(Message::Text(text)).await {
                debug!("Failed to send handshake frame: {}", e);
            }
        }
        Err(e) => warn!("Failed to serialize handshake frame: {}", e),
    }
}

async fn close_with(ws: &mut WsStream, code: u16, reason: &str) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: Cow::Owned(reason.to_string()),
    };
    if let Err(e) = ws.close(Some(frame)).await {
        debug!("WebSocket close error: {}", e);
    }
}

fn audit_connection(
    state: &Arc<AppState>,
    action: &str,
    actor: Option<&str>,
    details: serde_json::Value,
) {
    if let Err(e) = state
        .audit
        .append(AuditCategory::Connection, action, actor, Some(details))
    {
        warn!("Failed to audit connection event '{}': {}", action, e);
    }
}
