//! Administrative IPC socket
//!
//! A Unix domain socket colocated with the data files, used by external CLI
//! tooling while the broker runs as a long-lived service. Protocol: one JSON
//! command per line in, one JSON response per line out. Every command is
//! audited under `admin`.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audit::AuditCategory;
use crate::server::http::AppState;
use crate::types::{NeuronError, Result};

#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum IpcCommand {
    TerminateRelationship {
        relationship_id: String,
        provider_npi: String,
        reason: String,
    },
    ListProviders,
    Status,
    Shutdown,
}

#[derive(Debug, Serialize)]
struct IpcResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl IpcResponse {
    fn success(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Bind the IPC socket and serve commands until shutdown.
pub fn spawn_ipc_server(
    state: Arc<AppState>,
    socket_path: PathBuf,
) -> Result<JoinHandle<()>> {
    // A stale socket file from an unclean exit blocks the bind.
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }
    let listener = UnixListener::bind(&socket_path)
        .map_err(|e| NeuronError::Config(format!("cannot bind IPC socket: {e}")))?;
    info!("IPC socket listening at {}", socket_path.display());

    let mut shutdown = state.shutdown.subscribe();
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            handle_ipc_connection(state, stream).await;
                        });
                    }
                    Err(e) => {
                        warn!("IPC accept error: {}", e);
                    }
                },
                _ = shutdown.recv() => {
                    debug!("IPC listener stopping");
                    break;
                }
            }
        }
        let _ = std::fs::remove_file(&socket_path);
    });

    Ok(handle)
}

async fn handle_ipc_connection(state: Arc<AppState>, stream: UnixStream) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<IpcCommand>(&line) {
            Ok(command) => dispatch(&state, command).await,
            Err(e) => IpcResponse::failure(format!("unparseable command: {e}")),
        };

        let mut payload = match serde_json::to_string(&response) {
            Ok(p) => p,
            Err(e) => {
                warn!("IPC response serialization failed: {}", e);
                continue;
            }
        };
        payload.push('\n');
        if write_half.write_all(payload.as_bytes()).await.is_err() {
            break;
        }
    }
}

async fn dispatch(state: &Arc<AppState>, command: IpcCommand) -> IpcResponse {
    let command_name = match &command {
        IpcCommand::TerminateRelationship { .. } => "terminate_relationship",
        IpcCommand::ListProviders => "list_providers",
        IpcCommand::Status => "status",
        IpcCommand::Shutdown => "shutdown",
    };
    if let Err(e) = state.audit.append(
        AuditCategory::Admin,
        "ipc_command",
        None,
        Some(json!({ "command": command_name })),
    ) {
        warn!("Failed to audit IPC command: {}", e);
    }

    match command {
        IpcCommand::TerminateRelationship {
            relationship_id,
            provider_npi,
            reason,
        } => match state
            .termination
            .terminate(&relationship_id, &provider_npi, &reason)
        {
            Ok(record) => IpcResponse::success(json!({ "termination": record })),
            Err(e) => IpcResponse::failure(e.to_string()),
        },
        IpcCommand::ListProviders => match state.registration.providers() {
            Ok(providers) => IpcResponse::success(json!({ "providers": providers })),
            Err(e) => IpcResponse::failure(e.to_string()),
        },
        IpcCommand::Status => {
            let registration = state.registration.summary().await;
            IpcResponse::success(json!({
                "registration": registration,
                "active_sessions": state.admission.active_count(),
                "audit_head": state.audit.head_sequence(),
            }))
        }
        IpcCommand::Shutdown => {
            info!("Shutdown requested over IPC");
            let _ = state.shutdown.send(());
            IpcResponse::success(json!({ "stopping": true }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse_from_json_lines() {
        let line = r#"{"command":"terminate_relationship","relationship_id":"r-1","provider_npi":"9876543210","reason":"care ended"}"#;
        match serde_json::from_str::<IpcCommand>(line).unwrap() {
            IpcCommand::TerminateRelationship {
                relationship_id,
                provider_npi,
                reason,
            } => {
                assert_eq!(relationship_id, "r-1");
                assert_eq!(provider_npi, "9876543210");
                assert_eq!(reason, "care ended");
            }
            _ => panic!("wrong command"),
        }

        assert!(matches!(
            serde_json::from_str::<IpcCommand>(r#"{"command":"shutdown"}"#).unwrap(),
            IpcCommand::Shutdown
        ));
        assert!(matches!(
            serde_json::from_str::<IpcCommand>(r#"{"command":"list_providers"}"#).unwrap(),
            IpcCommand::ListProviders
        ));
    }

    #[test]
    fn unknown_command_is_an_error() {
        assert!(serde_json::from_str::<IpcCommand>(r#"{"command":"reboot"}"#).is_err());
    }

    #[test]
    fn responses_serialize_one_line() {
        let response = IpcResponse::success(json!({ "providers": [] }));
        let rendered = serde_json::to_string(&response).unwrap();
        assert!(!rendered.contains('\n'));
        assert!(rendered.contains(r#""ok":true"#));

        let response = IpcResponse::failure("nope");
        let rendered = serde_json::to_string(&response).unwrap();
        assert!(rendered.contains(r#""ok":false"#));
        assert!(rendered.contains("nope"));
    }
}
