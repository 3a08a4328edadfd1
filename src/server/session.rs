//! Handshake session registry
//!
//! Volatile bookkeeping for in-flight handshakes: one entry per accepted
//! connection from upgrade to terminal state. The registry backs `/status`
//! and the graceful-stop sweep; the admission controller holds the actual
//! concurrency accounting.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Authenticating,
    Challenged,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct HandshakeSession {
    pub session_id: Uuid,
    pub patient_agent_id: Option<String>,
    pub provider_npi: Option<String>,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
}

/// Session view exposed over `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub patient_agent_id: Option<String>,
    pub provider_npi: Option<String>,
    pub status: SessionStatus,
    pub started_at: String,
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<Uuid, HandshakeSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Register a fresh session in the authenticating state.
    pub fn open(&self) -> Uuid {
        let session_id = Uuid::new_v4();
        let session = HandshakeSession {
            session_id,
            patient_agent_id: None,
            provider_npi: None,
            status: SessionStatus::Authenticating,
            started_at: Utc::now(),
        };
        self.sessions
            .lock()
            .expect("session registry lock poisoned")
            .insert(session_id, session);
        session_id
    }

    pub fn update<F>(&self, session_id: Uuid, f: F)
    where
        F: FnOnce(&mut HandshakeSession),
    {
        if let Some(session) = self
            .sessions
            .lock()
            .expect("session registry lock poisoned")
            .get_mut(&session_id)
        {
            f(session);
        }
    }

    /// Unregister a session once it reaches a terminal state.
    pub fn close(&self, session_id: Uuid) {
        self.sessions
            .lock()
            .expect("session registry lock poisoned")
            .remove(&session_id);
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .lock()
            .expect("session registry lock poisoned")
            .len()
    }

    pub fn snapshot(&self) -> Vec<SessionSummary> {
        self.sessions
            .lock()
            .expect("session registry lock poisoned")
            .values()
            .map(|s| SessionSummary {
                session_id: s.session_id,
                patient_agent_id: s.patient_agent_id.clone(),
                provider_npi: s.provider_npi.clone(),
                status: s.status,
                started_at: s.started_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            })
            .collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
