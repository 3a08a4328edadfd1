//! Live protocol-server tests: real WebSocket connections against the shared
//! listener, covering the close-code contract and the admission ceiling.

use std::sync::Arc;
use std::time::Duration;

use base64::prelude::*;
use chrono::Utc;
use clap::Parser;
use ed25519_dalek::{Signer, SigningKey};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use neuron::audit::AuditLog;
use neuron::config::Args;
use neuron::consent::{ChallengeRegistry, HandshakeEngine};
use neuron::db::Database;
use neuron::directory::{RegistrationConfig, RegistrationService};
use neuron::health::HealthFile;
use neuron::relationship::termination::TerminationHandler;
use neuron::relationship::RelationshipStore;
use neuron::server::admission::AdmissionController;
use neuron::server::session::SessionRegistry;
use neuron::server::{self, AppState};

type Client =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct TestBroker {
    _dir: tempfile::TempDir,
    addr: std::net::SocketAddr,
    state: Arc<AppState>,
    shutdown: broadcast::Sender<()>,
}

async fn start_broker(extra: &[&str]) -> TestBroker {
    let dir = tempfile::tempdir().unwrap();
    let mut argv: Vec<String> = [
        "neuron",
        "--organization-npi",
        "1234567893",
        "--organization-name",
        "Test Clinic",
        "--directory-url",
        "http://127.0.0.1:1",
        "--data-dir",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    argv.push(dir.path().display().to_string());
    argv.extend(extra.iter().map(|s| s.to_string()));
    let args = Args::parse_from(argv);

    let db = Arc::new(Database::open_in_memory().unwrap());
    let audit = Arc::new(AuditLog::open(args.audit_path()).unwrap());
    let relationships = Arc::new(RelationshipStore::new(Arc::clone(&db)));
    let termination = Arc::new(TerminationHandler::new(Arc::clone(&db), Arc::clone(&audit)));
    let engine = Arc::new(HandshakeEngine::new(
        args.organization_npi.clone(),
        args.endpoint_url.clone(),
        Arc::new(ChallengeRegistry::new()),
        Arc::clone(&relationships),
        Arc::clone(&audit),
    ));
    let health = Arc::new(HealthFile::new(args.health_path()));
    let registration = Arc::new(RegistrationService::new(
        RegistrationConfig {
            organization_npi: args.organization_npi.clone(),
            organization_name: args.organization_name.clone(),
            organization_type: args.organization_type.clone(),
            directory_url: args.directory_url.clone(),
            endpoint_url: args.handshake_url(),
            heartbeat_interval: Duration::from_secs(60),
            backoff_ceiling: Duration::from_secs(300),
        },
        Arc::clone(&db),
        Arc::clone(&audit),
        Arc::clone(&health),
    ));

    let (shutdown_tx, _) = broadcast::channel(8);
    let state = Arc::new(AppState {
        admission: AdmissionController::new(args.max_concurrent_handshakes),
        sessions: Arc::new(SessionRegistry::new()),
        db,
        audit,
        relationships,
        termination,
        engine,
        registration,
        health,
        shutdown: shutdown_tx.clone(),
        started_at: Utc::now(),
        args,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server_state = Arc::clone(&state);
    tokio::spawn(async move {
        let _ = server::run_with_listener(server_state, listener).await;
    });

    TestBroker {
        _dir: dir,
        addr,
        state,
        shutdown: shutdown_tx,
    }
}

async fn connect(addr: std::net::SocketAddr) -> Client {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/handshake"))
        .await
        .expect("connect");
    ws
}

fn auth_json(signing: &SigningKey, exp_offset: i64) -> String {
    let now = Utc::now().timestamp();
    let payload = serde_json::to_vec(&json!({
        "patient_agent_id": "patient-001",
        "provider_npi": "9876543210",
        "consented_actions": ["office_visit"],
        "iat": now,
        "exp": now + exp_offset,
    }))
    .unwrap();
    let signature = signing.sign(&payload);
    json!({
        "type": "handshake.auth",
        "consent_token_payload": BASE64_URL_SAFE_NO_PAD.encode(&payload),
        "consent_token_signature": BASE64_URL_SAFE_NO_PAD.encode(signature.to_bytes()),
        "patient_agent_id": "patient-001",
        "patient_public_key": BASE64_URL_SAFE_NO_PAD.encode(signing.verifying_key().as_bytes()),
        "patient_endpoint": "ws://patient.example",
    })
    .to_string()
}

async fn recv_json(ws: &mut Client) -> Value {
    loop {
        match ws.next().await.expect("frame").expect("frame ok") {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn recv_close_code(ws: &mut Client) -> u16 {
    loop {
        match ws.next().await {
            Some(Ok(Message::Close(Some(frame)))) => return u16::from(frame.code),
            Some(Ok(_)) => continue,
            other => panic!("expected close frame, got {other:?}"),
        }
    }
}

/// Drive a full two-message handshake on an open connection.
async fn run_full_handshake(ws: &mut Client, signing: &SigningKey) -> Value {
    ws.send(Message::Text(auth_json(signing, 3600))).await.unwrap();
    let challenge = recv_json(ws).await;
    assert_eq!(challenge["type"], "handshake.challenge");
    let nonce = challenge["nonce"].as_str().unwrap();
    let signed = signing.sign(&hex::decode(nonce).unwrap());
    ws.send(Message::Text(
        json!({
            "type": "handshake.challenge_response",
            "signed_nonce": BASE64_URL_SAFE_NO_PAD.encode(signed.to_bytes()),
        })
        .to_string(),
    ))
    .await
    .unwrap();
    recv_json(ws).await
}

#[tokio::test]
async fn full_handshake_over_the_wire() {
    let broker = start_broker(&[]).await;
    let signing = SigningKey::from_bytes(&[5u8; 32]);
    let mut ws = connect(broker.addr).await;

    ws.send(Message::Text(auth_json(&signing, 3600))).await.unwrap();
    let challenge = recv_json(&mut ws).await;
    assert_eq!(challenge["type"], "handshake.challenge");
    assert_eq!(challenge["provider_npi"], "9876543210");
    assert_eq!(challenge["organization_npi"], "1234567893");

    let nonce = challenge["nonce"].as_str().unwrap();
    assert_eq!(nonce.len(), 64);
    let signed = signing.sign(&hex::decode(nonce).unwrap());
    ws.send(Message::Text(
        json!({
            "type": "handshake.challenge_response",
            "signed_nonce": BASE64_URL_SAFE_NO_PAD.encode(signed.to_bytes()),
        })
        .to_string(),
    ))
    .await
    .unwrap();

    let complete = recv_json(&mut ws).await;
    assert_eq!(complete["type"], "handshake.complete");
    assert_eq!(complete["status"], "new");
    assert!(complete["provider_endpoint"]
        .as_str()
        .unwrap()
        .ends_with("/agents/9876543210"));

    // Broker-and-step-out: normal close right after completion.
    assert_eq!(recv_close_code(&mut ws).await, 1000);

    let relationships = broker.state.relationships.find_by_patient("patient-001").unwrap();
    assert_eq!(relationships.len(), 1);
}

#[tokio::test]
async fn expired_token_closes_4003() {
    let broker = start_broker(&[]).await;
    let signing = SigningKey::from_bytes(&[6u8; 32]);
    let mut ws = connect(broker.addr).await;

    ws.send(Message::Text(auth_json(&signing, -1))).await.unwrap();
    let error = recv_json(&mut ws).await;
    assert_eq!(error["type"], "handshake.error");
    assert_eq!(error["code"], "CONSENT_FAILED");
    assert_eq!(recv_close_code(&mut ws).await, 4003);

    assert!(broker
        .state
        .relationships
        .find_by_patient("patient-001")
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn binary_frames_close_4002() {
    let broker = start_broker(&[]).await;
    let mut ws = connect(broker.addr).await;

    ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    let error = recv_json(&mut ws).await;
    assert_eq!(error["code"], "INVALID_MESSAGE");
    assert_eq!(recv_close_code(&mut ws).await, 4002);
}

#[tokio::test]
async fn unparseable_text_closes_4002() {
    let broker = start_broker(&[]).await;
    let mut ws = connect(broker.addr).await;

    ws.send(Message::Text("not json".into())).await.unwrap();
    let error = recv_json(&mut ws).await;
    assert_eq!(error["code"], "INVALID_MESSAGE");
    assert_eq!(recv_close_code(&mut ws).await, 4002);
}

#[tokio::test]
async fn auth_timer_closes_4001() {
    let broker = start_broker(&["--auth-timeout-ms", "200"]).await;
    let mut ws = connect(broker.addr).await;

    // Say nothing; the auth timer fires.
    let error = recv_json(&mut ws).await;
    assert_eq!(error["code"], "AUTH_TIMEOUT");
    assert_eq!(recv_close_code(&mut ws).await, 4001);
}

#[tokio::test]
async fn third_client_is_held_then_promoted_fifo() {
    let broker = start_broker(&["--max-concurrent-handshakes", "2"]).await;
    let signing = SigningKey::from_bytes(&[7u8; 32]);

    let ws1 = connect(broker.addr).await;
    let _ws2 = connect(broker.addr).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.state.admission.active_count(), 2);

    // The third upgrade is held, not refused.
    let addr = broker.addr;
    let third = tokio::spawn(async move {
        tokio_tungstenite::connect_async(format!("ws://{addr}/ws/handshake")).await
    });
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!third.is_finished(), "held upgrade must not resolve early");
    assert_eq!(broker.state.admission.active_count(), 2);
    assert_eq!(broker.state.admission.queued_count(), 1);

    // First session ends; the held upgrade promotes and completes a full
    // handshake. The ceiling is never exceeded.
    drop(ws1);
    let (mut ws3, _) = third.await.unwrap().expect("promoted upgrade");
    let complete = run_full_handshake(&mut ws3, &signing).await;
    assert_eq!(complete["type"], "handshake.complete");
    assert_eq!(recv_close_code(&mut ws3).await, 1000);
    assert!(broker.state.admission.active_count() <= 2);
}

#[tokio::test]
async fn queue_timeout_returns_503() {
    let broker = start_broker(&[
        "--max-concurrent-handshakes",
        "1",
        "--queue-timeout-ms",
        "300",
    ])
    .await;

    let _held = connect(broker.addr).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = tokio_tungstenite::connect_async(format!("ws://{}/ws/handshake", broker.addr))
        .await
        .expect_err("second upgrade must be rejected after the queue timer");
    match err {
        WsError::Http(response) => assert_eq!(response.status(), 503),
        other => panic!("expected HTTP 503, got {other:?}"),
    }
}

#[tokio::test]
async fn shutdown_closes_active_sessions_1001() {
    let broker = start_broker(&[]).await;
    let mut ws = connect(broker.addr).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let _ = broker.shutdown.send(());
    assert_eq!(recv_close_code(&mut ws).await, 1001);
}
