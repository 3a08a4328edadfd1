//! Neuron - organizational trust broker
//!
//! Startup wiring and ordered shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use neuron::advertise::Advertiser;
use neuron::audit::AuditLog;
use neuron::config::Args;
use neuron::consent::{ChallengeRegistry, HandshakeEngine};
use neuron::db::Database;
use neuron::directory::{RegistrationConfig, RegistrationService};
use neuron::health::HealthFile;
use neuron::ipc::spawn_ipc_server;
use neuron::relationship::termination::TerminationHandler;
use neuron::relationship::RelationshipStore;
use neuron::server::admission::AdmissionController;
use neuron::server::session::SessionRegistry;
use neuron::server::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    // Initialize tracing/logging
    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("neuron={log_level},info").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Neuron - Organizational Trust Broker");
    info!("======================================");
    info!("Organization: {} ({})", args.organization_name, args.organization_npi);
    info!("Listen: {}", args.listen);
    info!("Endpoint: {}", args.handshake_url());
    info!("Directory: {}", args.directory_url);
    info!("Data dir: {}", args.data_dir.display());
    info!("Handshake ceiling: {}", args.max_concurrent_handshakes);
    info!("======================================");

    if let Err(e) = std::fs::create_dir_all(&args.data_dir) {
        error!("Cannot create data directory: {}", e);
        std::process::exit(1);
    }

    // Storage and audit open failures are unrecoverable at startup.
    let db = match Database::open(&args.db_path()) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            error!("Cannot open database: {}", e);
            std::process::exit(1);
        }
    };
    let audit = match AuditLog::open(args.audit_path()) {
        Ok(log) => Arc::new(log),
        Err(e) => {
            error!("Cannot open audit log: {}", e);
            std::process::exit(1);
        }
    };

    let relationships = Arc::new(RelationshipStore::new(Arc::clone(&db)));
    let termination = Arc::new(TerminationHandler::new(Arc::clone(&db), Arc::clone(&audit)));
    let challenges = Arc::new(ChallengeRegistry::new());
    let engine = Arc::new(HandshakeEngine::new(
        args.organization_npi.clone(),
        args.endpoint_url.clone(),
        challenges,
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
            heartbeat_interval: Duration::from_secs(args.heartbeat_interval_secs),
            backoff_ceiling: Duration::from_millis(args.heartbeat_backoff_ceiling_ms),
        },
        Arc::clone(&db),
        Arc::clone(&audit),
        Arc::clone(&health),
    ));

    let (shutdown_tx, _) = broadcast::channel(8);

    // Directory registration: unreachable directory is never fatal, the
    // broker continues degraded with established relationships routable.
    if let Err(e) = registration.startup().await {
        error!("Registration state is unusable: {}", e);
        std::process::exit(1);
    }
    let heartbeat = registration.spawn_heartbeat(shutdown_tx.subscribe());

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
        args: args.clone(),
    });

    let advertiser = if args.mdns_enabled {
        match Advertiser::start(
            &args.mdns_service_name,
            &args.organization_npi,
            &args.handshake_url(),
            args.listen.port(),
        ) {
            Ok(advertiser) => Some(advertiser),
            Err(e) => {
                warn!("mDNS advertisement unavailable (continuing): {}", e);
                None
            }
        }
    } else {
        None
    };

    let ipc_handle = match spawn_ipc_server(Arc::clone(&state), args.ipc_socket_path()) {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("IPC socket unavailable (continuing): {}", e);
            None
        }
    };

    let server_state = Arc::clone(&state);
    let server_task = tokio::spawn(async move { server::run(server_state).await });

    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
        _ = shutdown_rx.recv() => {
            info!("Shutdown requested");
        }
    }

    // Ordered teardown: mDNS goodbye goes out before the handshake listener
    // closes; the protocol server stops before the heartbeat; the directory
    // registration is never withdrawn (peers still hold relationships).
    if let Some(advertiser) = advertiser {
        advertiser.shutdown();
    }
    let _ = shutdown_tx.send(());

    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Server error: {:?}", e),
        Err(e) => error!("Server task panicked: {:?}", e),
    }
    let _ = heartbeat.await;
    if let Some(handle) = ipc_handle {
        let _ = handle.await;
    }

    info!("Neuron stopped");
    Ok(())
}
