//! HTTP server
//!
//! Single hyper http1 listener shared by the handshake WebSocket endpoint and
//! the operator REST surface. Connections are served on spawned tasks with
//! upgrade support; routing is a straight match on method and path.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::audit::AuditLog;
use crate::config::Args;
use crate::consent::HandshakeEngine;
use crate::db::Database;
use crate::directory::RegistrationService;
use crate::health::HealthFile;
use crate::relationship::termination::TerminationHandler;
use crate::relationship::RelationshipStore;
use crate::routes;
use crate::server::admission::AdmissionController;
use crate::server::protocol::HANDSHAKE_PATH;
use crate::server::session::SessionRegistry;
use crate::server::websocket;
use crate::types::Result;

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub db: Arc<Database>,
    pub audit: Arc<AuditLog>,
    pub relationships: Arc<RelationshipStore>,
    pub termination: Arc<TerminationHandler>,
    pub engine: Arc<HandshakeEngine>,
    pub admission: Arc<AdmissionController>,
    pub sessions: Arc<SessionRegistry>,
    pub registration: Arc<RegistrationService>,
    pub health: Arc<HealthFile>,
    /// Shutdown fan-out: the accept loop, every connection task, the
    /// heartbeat, and the IPC listener all subscribe.
    pub shutdown: broadcast::Sender<()>,
    pub started_at: DateTime<Utc>,
}

/// Bind the configured address and serve until the shutdown signal fires.
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let listener = TcpListener::bind(state.args.listen).await?;
    run_with_listener(state, listener).await
}

/// Run the shared listener until the shutdown signal fires.
///
/// The protocol server is the first subsystem torn down in an ordered
/// shutdown: active sessions receive close 1001 through their own shutdown
/// subscriptions, queued upgrades are answered 503, then the listener drops.
pub async fn run_with_listener(state: Arc<AppState>, listener: TcpListener) -> Result<()> {
    info!(
        "Neuron listening on {} (handshake at {})",
        listener.local_addr()?,
        HANDSHAKE_PATH
    );

    let mut shutdown = state.shutdown.subscribe();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let service = service_fn(move |req| {
                            let state = Arc::clone(&state);
                            async move { handle_request(state, addr, req).await }
                        });

                        if let Err(err) = http1::Builder::new()
                            .serve_connection(io, service)
                            .with_upgrades()
                            .await
                        {
                            debug!("Error serving connection from {}: {:?}", addr, err);
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {:?}", e);
                }
            },
            _ = shutdown.recv() => {
                info!("Protocol server stopping");
                break;
            }
        }
    }

    // Queued upgrades are rejected; live sessions are already sending 1001.
    state.admission.drain_queue();
    tokio::time::sleep(Duration::from_millis(250)).await;

    Ok(())
}

/// Route incoming HTTP requests.
async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!("[{}] {} {}", addr, method, path);

    let response = match (method, path.as_str()) {
        // Consent handshake endpoint (WebSocket only).
        (Method::GET, HANDSHAKE_PATH) => {
            if hyper_tungstenite::is_upgrade_request(&req) {
                websocket::handle_handshake_upgrade(state, req).await
            } else {
                routes::bad_request_response("WebSocket upgrade required for /ws/handshake")
            }
        }

        // Liveness probe.
        (Method::GET, "/health") | (Method::GET, "/healthz") => {
            routes::health_check(Arc::clone(&state))
        }

        // Readiness probe: directory linkage.
        (Method::GET, "/ready") | (Method::GET, "/readyz") => {
            routes::readiness_check(Arc::clone(&state)).await
        }

        (Method::GET, "/version") => routes::version_info(),

        (Method::GET, "/status") => routes::status_check(Arc::clone(&state)).await,

        // CORS preflight.
        (Method::OPTIONS, _) => routes::preflight_response(),

        // Operator REST surface.
        (_, p) if p.starts_with("/api/v1") => {
            routes::handle_api_request(Arc::clone(&state), req).await
        }

        (_, p) => routes::not_found_response(p),
    };

    Ok(response)
}
