//! Persisted registration state
//!
//! A single-row table holds this neuron's standing with the directory; a
//! second table tracks the providers registered under it. The bearer token
//! lives here and nowhere else: it is never logged and never leaves through
//! a status response.

use std::sync::Arc;

use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use crate::db::Database;
use crate::types::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    Unregistered,
    Registered,
    Degraded,
}

impl RegistrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationStatus::Unregistered => "unregistered",
            RegistrationStatus::Registered => "registered",
            RegistrationStatus::Degraded => "degraded",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "registered" => RegistrationStatus::Registered,
            "degraded" => RegistrationStatus::Degraded,
            _ => RegistrationStatus::Unregistered,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistrationState {
    pub organization_npi: String,
    pub organization_name: String,
    pub organization_type: String,
    pub directory_url: String,
    pub neuron_endpoint_url: String,
    pub registration_id: Option<String>,
    pub bearer_token: Option<String>,
    pub status: RegistrationStatus,
    pub first_registered_at: Option<String>,
    pub last_heartbeat_at: Option<String>,
    pub last_directory_response_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Pending,
    Registered,
    Failed,
}

impl ProviderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderStatus::Pending => "pending",
            ProviderStatus::Registered => "registered",
            ProviderStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "registered" => ProviderStatus::Registered,
            "failed" => ProviderStatus::Failed,
            _ => ProviderStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderRegistration {
    pub provider_npi: String,
    pub directory_provider_id: Option<String>,
    pub registration_status: ProviderStatus,
    pub first_registered_at: Option<String>,
}

pub struct RegistrationStore {
    db: Arc<Database>,
}

impl RegistrationStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn load(&self) -> Result<Option<RegistrationState>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM neuron_registration WHERE slot = 1",
                    [],
                    map_state,
                )
                .optional()?)
        })
    }

    pub fn save(&self, state: &RegistrationState) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO neuron_registration
                 (slot, organization_npi, organization_name, organization_type,
                  directory_url, neuron_endpoint_url, registration_id, bearer_token,
                  status, first_registered_at, last_heartbeat_at, last_directory_response_at)
                 VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(slot) DO UPDATE SET
                    organization_npi = excluded.organization_npi,
                    organization_name = excluded.organization_name,
                    organization_type = excluded.organization_type,
                    directory_url = excluded.directory_url,
                    neuron_endpoint_url = excluded.neuron_endpoint_url,
                    registration_id = excluded.registration_id,
                    bearer_token = excluded.bearer_token,
                    status = excluded.status,
                    first_registered_at = excluded.first_registered_at,
                    last_heartbeat_at = excluded.last_heartbeat_at,
                    last_directory_response_at = excluded.last_directory_response_at",
                params![
                    state.organization_npi,
                    state.organization_name,
                    state.organization_type,
                    state.directory_url,
                    state.neuron_endpoint_url,
                    state.registration_id,
                    state.bearer_token,
                    state.status.as_str(),
                    state.first_registered_at,
                    state.last_heartbeat_at,
                    state.last_directory_response_at,
                ],
            )?;
            Ok(())
        })
    }

    pub fn providers(&self) -> Result<Vec<ProviderRegistration>> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM provider_registrations ORDER BY provider_npi")?;
            let rows = stmt.query_map([], map_provider)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    pub fn upsert_provider(&self, provider: &ProviderRegistration) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO provider_registrations
                 (provider_npi, directory_provider_id, registration_status, first_registered_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(provider_npi) DO UPDATE SET
                    directory_provider_id = excluded.directory_provider_id,
                    registration_status = excluded.registration_status,
                    first_registered_at = COALESCE(provider_registrations.first_registered_at,
                                                   excluded.first_registered_at)",
                params![
                    provider.provider_npi,
                    provider.directory_provider_id,
                    provider.registration_status.as_str(),
                    provider.first_registered_at,
                ],
            )?;
            Ok(())
        })
    }

    pub fn remove_provider(&self, provider_npi: &str) -> Result<bool> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "DELETE FROM provider_registrations WHERE provider_npi = ?1",
                [provider_npi],
            )?;
            Ok(changed > 0)
        })
    }
}

fn map_state(row: &Row<'_>) -> rusqlite::Result<RegistrationState> {
    let status: String = row.get("status")?;
    Ok(RegistrationState {
        organization_npi: row.get("organization_npi")?,
        organization_name: row.get("organization_name")?,
        organization_type: row.get("organization_type")?,
        directory_url: row.get("directory_url")?,
        neuron_endpoint_url: row.get("neuron_endpoint_url")?,
        registration_id: row.get("registration_id")?,
        bearer_token: row.get("bearer_token")?,
        status: RegistrationStatus::parse(&status),
        first_registered_at: row.get("first_registered_at")?,
        last_heartbeat_at: row.get("last_heartbeat_at")?,
        last_directory_response_at: row.get("last_directory_response_at")?,
    })
}

fn map_provider(row: &Row<'_>) -> rusqlite::Result<ProviderRegistration> {
    let status: String = row.get("registration_status")?;
    Ok(ProviderRegistration {
        provider_npi: row.get("provider_npi")?,
        directory_provider_id: row.get("directory_provider_id")?,
        registration_status: ProviderStatus::parse(&status),
        first_registered_at: row.get("first_registered_at")?,
    })
}
