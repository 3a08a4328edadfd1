//! Relationship store
//!
//! Durable records of patient-provider care relationships established through
//! the consent handshake. Rows are never deleted; the only legal status
//! transition is `active -> terminated`, and that rule is enforced here at
//! the store layer rather than trusted to callers.

pub mod termination;

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use uuid::Uuid;

use crate::db::Database;
use crate::types::{NeuronError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipStatus {
    Active,
    Terminated,
}

impl RelationshipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipStatus::Active => "active",
            RelationshipStatus::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(RelationshipStatus::Active),
            "terminated" => Ok(RelationshipStatus::Terminated),
            other => Err(NeuronError::Internal(format!(
                "unknown relationship status: {}",
                other
            ))),
        }
    }
}

/// A signed care relationship between a patient agent and a provider.
#[derive(Debug, Clone, Serialize)]
pub struct Relationship {
    pub relationship_id: String,
    pub patient_agent_id: String,
    pub provider_npi: String,
    pub status: RelationshipStatus,
    /// Consent scope strings, carried verbatim from the token. The broker
    /// never inspects them.
    pub consented_actions: Vec<String>,
    /// Raw 32-byte Ed25519 public key of the patient agent.
    #[serde(skip_serializing)]
    pub patient_public_key: Vec<u8>,
    pub created_at: String,
    pub updated_at: String,
}

pub struct RelationshipStore {
    db: Arc<Database>,
}

impl RelationshipStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new active relationship.
    pub fn create(
        &self,
        relationship_id: &str,
        patient_agent_id: &str,
        provider_npi: &str,
        consented_actions: &[String],
        patient_public_key: &[u8],
    ) -> Result<Relationship> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let actions_json = serde_json::to_string(consented_actions)?;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO relationships
                 (relationship_id, patient_agent_id, provider_npi, status,
                  consented_actions, patient_public_key, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?6, ?6)",
                params![
                    relationship_id,
                    patient_agent_id,
                    provider_npi,
                    actions_json,
                    patient_public_key,
                    now,
                ],
            )?;
            Ok(())
        })?;

        Ok(Relationship {
            relationship_id: relationship_id.to_string(),
            patient_agent_id: patient_agent_id.to_string(),
            provider_npi: provider_npi.to_string(),
            status: RelationshipStatus::Active,
            consented_actions: consented_actions.to_vec(),
            patient_public_key: patient_public_key.to_vec(),
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub fn find_by_id(&self, relationship_id: &str) -> Result<Option<Relationship>> {
        self.db.with_conn(|conn| row_by_id(conn, relationship_id))
    }

    pub fn find_by_patient(&self, patient_agent_id: &str) -> Result<Vec<Relationship>> {
        self.query(
            "SELECT * FROM relationships WHERE patient_agent_id = ?1 ORDER BY created_at",
            patient_agent_id,
        )
    }

    pub fn find_by_provider(&self, provider_npi: &str) -> Result<Vec<Relationship>> {
        self.query(
            "SELECT * FROM relationships WHERE provider_npi = ?1 ORDER BY created_at",
            provider_npi,
        )
    }

    pub fn find_by_status(&self, status: RelationshipStatus) -> Result<Vec<Relationship>> {
        self.query(
            "SELECT * FROM relationships WHERE status = ?1 ORDER BY created_at",
            status.as_str(),
        )
    }

    pub fn find_all(&self) -> Result<Vec<Relationship>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM relationships ORDER BY created_at")?;
            let rows = stmt.query_map([], map_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// The active relationship for a (patient, provider) pair, if any.
    /// Terminated records for the same pair do not count.
    pub fn find_active(
        &self,
        patient_agent_id: &str,
        provider_npi: &str,
    ) -> Result<Option<Relationship>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM relationships
                     WHERE patient_agent_id = ?1 AND provider_npi = ?2 AND status = 'active'
                     ORDER BY created_at LIMIT 1",
                    params![patient_agent_id, provider_npi],
                    map_row,
                )
                .optional()?)
        })
    }

    /// Transition a relationship's status. Fails with `AlreadyTerminated`
    /// when the current status is terminated, whatever the target.
    pub fn update_status(&self, relationship_id: &str, status: RelationshipStatus) -> Result<()> {
        self.db.with_conn(|conn| {
            let current = row_by_id(conn, relationship_id)?
                .ok_or_else(|| NeuronError::NotFound(relationship_id.to_string()))?;
            if current.status == RelationshipStatus::Terminated {
                return Err(NeuronError::AlreadyTerminated(relationship_id.to_string()));
            }
            let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
            conn.execute(
                "UPDATE relationships SET status = ?1, updated_at = ?2 WHERE relationship_id = ?3",
                params![status.as_str(), now, relationship_id],
            )?;
            Ok(())
        })
    }

    /// Compensating removal of a row whose establishing audit write failed.
    /// Not part of the relationship lifecycle; committed relationships are
    /// never deleted.
    pub(crate) fn discard(&self, relationship_id: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM relationships WHERE relationship_id = ?1",
                [relationship_id],
            )?;
            Ok(())
        })
    }

    fn query(&self, sql: &str, param: &str) -> Result<Vec<Relationship>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map([param], map_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }
}

/// Row lookup usable both standalone and inside a transaction.
pub(crate) fn row_by_id(conn: &Connection, relationship_id: &str) -> Result<Option<Relationship>> {
    Ok(conn
        .query_row(
            "SELECT * FROM relationships WHERE relationship_id = ?1",
            [relationship_id],
            map_row,
        )
        .optional()?)
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<Relationship> {
    let status_str: String = row.get("status")?;
    let actions_json: String = row.get("consented_actions")?;
    Ok(Relationship {
        relationship_id: row.get("relationship_id")?,
        patient_agent_id: row.get("patient_agent_id")?,
        provider_npi: row.get("provider_npi")?,
        status: RelationshipStatus::parse(&status_str).map_err(|_| {
            rusqlite::Error::InvalidColumnType(
                0,
                "status".into(),
                rusqlite::types::Type::Text,
            )
        })?,
        consented_actions: serde_json::from_str(&actions_json).unwrap_or_default(),
        patient_public_key: row.get("patient_public_key")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

/// Generate a fresh opaque relationship id.
pub fn new_relationship_id() -> String {
    Uuid::new_v4().to_string()
}
