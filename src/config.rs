//! Configuration for neuron
//!
//! CLI arguments and environment variable handling using clap.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::npi;
use crate::server::protocol::HANDSHAKE_PATH;

/// Neuron - organizational trust broker for a federated healthcare-agent
/// network. One instance per NPI-holding organization.
#[derive(Parser, Debug, Clone)]
#[command(name = "neuron")]
#[command(about = "Organizational trust broker between patient agents, provider agents, and the national directory")]
pub struct Args {
    /// Address to listen on (handshake WebSocket + REST surface)
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// This organization's 10-digit NPI
    #[arg(long, env = "ORGANIZATION_NPI")]
    pub organization_npi: String,

    /// Human-readable organization name, as registered with the directory
    #[arg(long, env = "ORGANIZATION_NAME")]
    pub organization_name: String,

    /// Organization type reported to the directory
    #[arg(long, env = "ORGANIZATION_TYPE", default_value = "provider_organization")]
    pub organization_type: String,

    /// Base URL of the national directory service
    #[arg(long, env = "DIRECTORY_URL", default_value = "http://localhost:8900")]
    pub directory_url: String,

    /// Public base URL of this broker, as reachable by patient agents
    /// (e.g. "wss://broker.example.org")
    #[arg(long, env = "ENDPOINT_URL", default_value = "ws://localhost:8080")]
    pub endpoint_url: String,

    /// Data directory (database, audit log, health artifact, IPC socket)
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Admission ceiling: simultaneous in-flight handshakes
    #[arg(long, env = "MAX_CONCURRENT_HANDSHAKES", default_value = "10")]
    pub max_concurrent_handshakes: usize,

    /// How long a held upgrade waits at the ceiling before a 503
    #[arg(long, env = "QUEUE_TIMEOUT_MS", default_value = "30000")]
    pub queue_timeout_ms: u64,

    /// How long a connection may sit without its auth message
    #[arg(long, env = "AUTH_TIMEOUT_MS", default_value = "10000")]
    pub auth_timeout_ms: u64,

    /// Maximum WebSocket text-frame payload in bytes
    #[arg(long, env = "MAX_FRAME_BYTES", default_value = "65536")]
    pub max_frame_bytes: usize,

    /// Directory heartbeat interval in seconds
    #[arg(long, env = "HEARTBEAT_INTERVAL_SECS", default_value = "60")]
    pub heartbeat_interval_secs: u64,

    /// Ceiling for heartbeat retry backoff in milliseconds
    #[arg(long, env = "HEARTBEAT_BACKOFF_CEILING_MS", default_value = "300000")]
    pub heartbeat_backoff_ceiling_ms: u64,

    /// API key required on the operator REST surface (unset: open access,
    /// single-operator deployments only)
    #[arg(long, env = "API_KEY")]
    pub api_key: Option<String>,

    /// Advertise the handshake endpoint over mDNS/DNS-SD
    #[arg(long, env = "MDNS_ENABLED", default_value = "true")]
    pub mdns_enabled: bool,

    /// DNS-SD service name (advertised as _<name>._tcp)
    #[arg(long, env = "MDNS_SERVICE_NAME", default_value = "careagent")]
    pub mdns_service_name: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Full public URL of the handshake endpoint.
    pub fn handshake_url(&self) -> String {
        format!(
            "{}{}",
            self.endpoint_url.trim_end_matches('/'),
            HANDSHAKE_PATH
        )
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("neuron.db")
    }

    pub fn audit_path(&self) -> PathBuf {
        self.data_dir.join("audit.ndjson")
    }

    pub fn health_path(&self) -> PathBuf {
        self.data_dir.join("health.json")
    }

    pub fn ipc_socket_path(&self) -> PathBuf {
        self.data_dir.join("neuron.sock")
    }

    /// Validate configuration. Errors here are fatal at startup.
    pub fn validate(&self) -> Result<(), String> {
        if !npi::is_valid_npi(&self.organization_npi) {
            return Err(format!(
                "ORGANIZATION_NPI '{}' is not a valid NPI",
                self.organization_npi
            ));
        }
        if self.organization_name.trim().is_empty() {
            return Err("ORGANIZATION_NAME must not be empty".to_string());
        }
        if self.max_concurrent_handshakes == 0 {
            return Err("MAX_CONCURRENT_HANDSHAKES must be at least 1".to_string());
        }
        if self.max_frame_bytes < 1024 {
            return Err("MAX_FRAME_BYTES must be at least 1024".to_string());
        }
        if !self.endpoint_url.starts_with("ws://") && !self.endpoint_url.starts_with("wss://") {
            return Err("ENDPOINT_URL must be a ws:// or wss:// URL".to_string());
        }
        Ok(())
    }
}
