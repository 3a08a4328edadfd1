//! Database schema and migrations
//!
//! Migrations are an ordered list of `(version, description, sql)` entries.
//! Each unapplied migration runs inside a transaction and records itself in
//! `schema_version`, so re-running against a current database is a no-op.

use rusqlite::Connection;
use tracing::info;

use crate::types::Result;

/// Ordered migration list. Append only; never edit an applied entry.
const MIGRATIONS: &[(i64, &str, &str)] = &[
    (1, "relationships and termination records", RELATIONSHIPS_SCHEMA),
    (2, "directory registration state", REGISTRATION_SCHEMA),
];

/// Bring a connection up to the current schema version.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY NOT NULL,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
        [],
    )?;

    for &(version, description, sql) in MIGRATIONS {
        let applied: bool = conn
            .query_row(
                "SELECT 1 FROM schema_version WHERE version = ?1",
                [version],
                |_| Ok(true),
            )
            .unwrap_or(false);
        if applied {
            continue;
        }

        info!("Applying schema migration v{}: {}", version, description);
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_version (version, description, applied_at)
             VALUES (?1, ?2, datetime('now'))",
            rusqlite::params![version, description],
        )?;
        tx.commit()?;
    }

    Ok(())
}

const RELATIONSHIPS_SCHEMA: &str = r#"
-- Durable care relationships established through the consent handshake.
-- Rows are never deleted; the only status transition is active -> terminated.
CREATE TABLE IF NOT EXISTS relationships (
    relationship_id TEXT PRIMARY KEY NOT NULL,
    patient_agent_id TEXT NOT NULL,
    provider_npi TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    -- Consent scope list, stored opaquely as the JSON array from the token
    consented_actions TEXT NOT NULL,
    -- Raw 32-byte Ed25519 public key of the patient agent
    patient_public_key BLOB NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_relationships_patient ON relationships(patient_agent_id);
CREATE INDEX IF NOT EXISTS idx_relationships_provider ON relationships(provider_npi);
CREATE INDEX IF NOT EXISTS idx_relationships_status ON relationships(status);

-- One record per terminated relationship, linking the audit entry written
-- for the status flip. The audit file sits outside the SQL transaction, so
-- the sequence stays 0 until the post-commit append links it.
CREATE TABLE IF NOT EXISTS termination_records (
    termination_id TEXT PRIMARY KEY NOT NULL,
    relationship_id TEXT NOT NULL,
    provider_npi TEXT NOT NULL,
    reason TEXT NOT NULL,
    terminated_at TEXT NOT NULL,
    audit_entry_sequence INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (relationship_id) REFERENCES relationships(relationship_id)
);

CREATE INDEX IF NOT EXISTS idx_termination_relationship ON termination_records(relationship_id);
"#;

const REGISTRATION_SCHEMA: &str = r#"
-- Singleton row describing this neuron's standing with the national
-- directory. The CHECK constraint enforces single-row at the storage layer.
CREATE TABLE IF NOT EXISTS neuron_registration (
    slot INTEGER PRIMARY KEY NOT NULL CHECK (slot = 1),
    organization_npi TEXT NOT NULL,
    organization_name TEXT NOT NULL,
    organization_type TEXT NOT NULL,
    directory_url TEXT NOT NULL,
    neuron_endpoint_url TEXT NOT NULL,
    registration_id TEXT,
    bearer_token TEXT,
    status TEXT NOT NULL DEFAULT 'unregistered',
    first_registered_at TEXT,
    last_heartbeat_at TEXT,
    last_directory_response_at TEXT
);

CREATE TABLE IF NOT EXISTS provider_registrations (
    provider_npi TEXT PRIMARY KEY NOT NULL,
    directory_provider_id TEXT,
    registration_status TEXT NOT NULL DEFAULT 'pending',
    first_registered_at TEXT
);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_apply_and_are_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as i64);
    }

    #[test]
    fn registration_table_is_single_row() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        conn.execute(
            "INSERT INTO neuron_registration
             (slot, organization_npi, organization_name, organization_type,
              directory_url, neuron_endpoint_url)
             VALUES (1, '1234567893', 'Test Clinic', 'clinic', 'http://d', 'ws://n')",
            [],
        )
        .unwrap();

        let err = conn.execute(
            "INSERT INTO neuron_registration
             (slot, organization_npi, organization_name, organization_type,
              directory_url, neuron_endpoint_url)
             VALUES (2, '1234567893', 'Test Clinic', 'clinic', 'http://d', 'ws://n')",
            [],
        );
        assert!(err.is_err());
    }
}
