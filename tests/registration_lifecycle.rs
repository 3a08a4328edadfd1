//! Registration lifecycle against a stub directory service.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use neuron::audit::AuditLog;
use neuron::db::Database;
use neuron::directory::{
    ProviderStatus, RegistrationConfig, RegistrationService, RegistrationStatus,
};
use neuron::health::{HealthArtifact, HealthFile, HealthStatus};

#[derive(Default)]
struct StubCounters {
    registrations: AtomicUsize,
    provider_registrations: AtomicUsize,
    endpoint_updates: AtomicUsize,
}

/// Minimal directory stub speaking the registration API.
async fn spawn_stub_directory() -> (String, Arc<StubCounters>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let counters = Arc::new(StubCounters::default());

    let task_counters = Arc::clone(&counters);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let counters = Arc::clone(&task_counters);
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let counters = Arc::clone(&counters);
                    async move { Ok::<_, hyper::Error>(stub_route(&counters, req)) }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (format!("http://{addr}"), counters)
}

fn stub_route(counters: &StubCounters, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let authorized = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        == Some("Bearer tok-abc");

    let body = match (req.method(), req.uri().path()) {
        (&Method::POST, "/v1/neurons") => {
            counters.registrations.fetch_add(1, Ordering::SeqCst);
            r#"{"registration_id":"reg-123","bearer_token":"tok-abc"}"#
        }
        (&Method::PUT, "/v1/neurons/reg-123/endpoint") => {
            if !authorized {
                return unauthorized();
            }
            counters.endpoint_updates.fetch_add(1, Ordering::SeqCst);
            "{}"
        }
        (&Method::POST, "/v1/neurons/reg-123/providers") => {
            if !authorized {
                return unauthorized();
            }
            counters.provider_registrations.fetch_add(1, Ordering::SeqCst);
            r#"{"provider_id":"prov-9"}"#
        }
        (&Method::DELETE, path) if path.starts_with("/v1/neurons/reg-123/providers/") => {
            if !authorized {
                return unauthorized();
            }
            "{}"
        }
        _ => {
            return Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from("{}")))
                .unwrap();
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

fn unauthorized() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .body(Full::new(Bytes::from("{}")))
        .unwrap()
}

struct Fixture {
    _dir: tempfile::TempDir,
    db: Arc<Database>,
    audit_path: std::path::PathBuf,
    health_path: std::path::PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let audit_path = dir.path().join("audit.ndjson");
        let health_path = dir.path().join("health.json");
        Self {
            _dir: dir,
            db: Arc::new(Database::open_in_memory().unwrap()),
            audit_path,
            health_path,
        }
    }

    fn service_with_interval(
        &self,
        directory_url: &str,
        heartbeat_interval: Duration,
    ) -> Arc<RegistrationService> {
        let audit = Arc::new(AuditLog::open(&self.audit_path).unwrap());
        let health = Arc::new(HealthFile::new(&self.health_path));
        Arc::new(RegistrationService::new(
            RegistrationConfig {
                organization_npi: "1234567893".into(),
                organization_name: "Test Clinic".into(),
                organization_type: "clinic".into(),
                directory_url: directory_url.into(),
                endpoint_url: "ws://broker.example/ws/handshake".into(),
                heartbeat_interval,
                backoff_ceiling: Duration::from_secs(300),
            },
            Arc::clone(&self.db),
            audit,
            health,
        ))
    }

    fn service(&self, directory_url: &str) -> Arc<RegistrationService> {
        self.service_with_interval(directory_url, Duration::from_secs(60))
    }

    fn health_artifact(&self) -> HealthArtifact {
        serde_json::from_str(&std::fs::read_to_string(&self.health_path).unwrap()).unwrap()
    }

    fn audit_text(&self) -> String {
        std::fs::read_to_string(&self.audit_path).unwrap_or_default()
    }
}

#[tokio::test]
async fn unreachable_directory_leaves_broker_degraded_but_running() {
    let fixture = Fixture::new();
    // Port 1 refuses connections.
    let service = fixture.service("http://127.0.0.1:1");

    service.startup().await.unwrap();

    let summary = service.summary().await;
    assert_eq!(summary.status, RegistrationStatus::Unregistered);
    assert!(summary.registration_id.is_none());

    let artifact = fixture.health_artifact();
    assert_eq!(artifact.status, HealthStatus::Degraded);
}

#[tokio::test]
async fn successful_registration_persists_and_audits_without_the_token() {
    let fixture = Fixture::new();
    let (directory_url, counters) = spawn_stub_directory().await;
    let service = fixture.service(&directory_url);

    service.startup().await.unwrap();

    assert_eq!(counters.registrations.load(Ordering::SeqCst), 1);
    let summary = service.summary().await;
    assert_eq!(summary.status, RegistrationStatus::Registered);
    assert_eq!(summary.registration_id.as_deref(), Some("reg-123"));
    assert!(summary.first_registered_at.is_some());

    let artifact = fixture.health_artifact();
    assert_eq!(artifact.status, HealthStatus::Healthy);

    // The registration is audited; the bearer token never reaches the log.
    let audit = fixture.audit_text();
    assert!(audit.contains("neuron_registered"));
    assert!(audit.contains("reg-123"));
    assert!(!audit.contains("tok-abc"));
}

#[tokio::test]
async fn providers_register_remove_and_audit() {
    let fixture = Fixture::new();
    let (directory_url, counters) = spawn_stub_directory().await;
    let service = fixture.service(&directory_url);
    service.startup().await.unwrap();

    let provider = service.add_provider("1679576722").await.unwrap();
    assert_eq!(provider.registration_status, ProviderStatus::Registered);
    assert_eq!(provider.directory_provider_id.as_deref(), Some("prov-9"));
    assert_eq!(counters.provider_registrations.load(Ordering::SeqCst), 1);

    let listed = service.providers().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].provider_npi, "1679576722");

    service.remove_provider("1679576722").await.unwrap();
    assert!(service.providers().unwrap().is_empty());

    let audit = fixture.audit_text();
    assert!(audit.contains("provider_registered"));
    assert!(audit.contains("provider_removed"));
}

#[tokio::test]
async fn heartbeat_keeps_the_registration_warm() {
    let fixture = Fixture::new();
    let (directory_url, counters) = spawn_stub_directory().await;
    let service = fixture.service_with_interval(&directory_url, Duration::from_millis(100));
    service.startup().await.unwrap();

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let handle = service.spawn_heartbeat(shutdown_tx.subscribe());
    tokio::time::sleep(Duration::from_millis(450)).await;
    let _ = shutdown_tx.send(());
    handle.await.unwrap();

    assert!(counters.endpoint_updates.load(Ordering::SeqCst) >= 2);
    let summary = service.summary().await;
    assert_eq!(summary.status, RegistrationStatus::Registered);
    assert!(summary.last_heartbeat_at.is_some());
    assert_eq!(fixture.health_artifact().status, HealthStatus::Healthy);
}

#[tokio::test]
async fn restart_resumes_without_reregistering() {
    let fixture = Fixture::new();
    let (directory_url, counters) = spawn_stub_directory().await;

    let first = fixture.service(&directory_url);
    first.startup().await.unwrap();
    first.add_provider("1679576722").await.unwrap();
    assert_eq!(counters.registrations.load(Ordering::SeqCst), 1);
    assert_eq!(counters.provider_registrations.load(Ordering::SeqCst), 1);
    drop(first);

    // Same database, fresh process: initial registration is skipped, the
    // persisted provider is re-registered best-effort.
    let second = fixture.service(&directory_url);
    second.startup().await.unwrap();

    assert_eq!(counters.registrations.load(Ordering::SeqCst), 1);
    assert_eq!(counters.provider_registrations.load(Ordering::SeqCst), 2);
    let summary = second.summary().await;
    assert_eq!(summary.status, RegistrationStatus::Registered);
    assert_eq!(summary.registration_id.as_deref(), Some("reg-123"));
}
