//! Relationship termination
//!
//! Termination is a single storage transaction: validate the relationship,
//! flip the status, insert the termination record. Any failure rolls the
//! database changes back, and the audit entry is appended only after the
//! transaction commits (then linked into the record), so a rolled-back
//! termination never leaves an audit trace. Re-termination raises
//! `AlreadyTerminated`.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::audit::{AuditCategory, AuditLog};
use crate::db::Database;
use crate::relationship::{row_by_id, RelationshipStatus};
use crate::types::{NeuronError, Result};

#[derive(Debug, Clone, Serialize)]
pub struct TerminationRecord {
    pub termination_id: String,
    pub relationship_id: String,
    pub provider_npi: String,
    pub reason: String,
    pub terminated_at: String,
    pub audit_entry_sequence: u64,
}

pub struct TerminationHandler {
    db: Arc<Database>,
    audit: Arc<AuditLog>,
}

impl TerminationHandler {
    pub fn new(db: Arc<Database>, audit: Arc<AuditLog>) -> Self {
        Self { db, audit }
    }

    /// Terminate a relationship on behalf of the provider that owns it.
    pub fn terminate(
        &self,
        relationship_id: &str,
        provider_npi: &str,
        reason: &str,
    ) -> Result<TerminationRecord> {
        // The audit file does not participate in the SQLite transaction, so
        // every database write happens (and can roll back) before the entry
        // is appended. The record carries audit_entry_sequence = 0 until the
        // post-commit link below.
        let (mut record, patient_agent_id) = self.db.transaction(|tx| {
            let relationship = row_by_id(tx, relationship_id)?
                .ok_or_else(|| NeuronError::NotFound(relationship_id.to_string()))?;

            if relationship.status == RelationshipStatus::Terminated {
                return Err(NeuronError::AlreadyTerminated(relationship_id.to_string()));
            }
            if relationship.provider_npi != provider_npi {
                return Err(NeuronError::ProviderMismatch(format!(
                    "relationship {} does not belong to provider {}",
                    relationship_id, provider_npi
                )));
            }

            let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
            tx.execute(
                "UPDATE relationships SET status = 'terminated', updated_at = ?1
                 WHERE relationship_id = ?2",
                params![now, relationship_id],
            )?;

            let record = TerminationRecord {
                termination_id: Uuid::new_v4().to_string(),
                relationship_id: relationship_id.to_string(),
                provider_npi: provider_npi.to_string(),
                reason: reason.to_string(),
                terminated_at: now,
                audit_entry_sequence: 0,
            };
            tx.execute(
                "INSERT INTO termination_records
                 (termination_id, relationship_id, provider_npi, reason, terminated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.termination_id,
                    record.relationship_id,
                    record.provider_npi,
                    record.reason,
                    record.terminated_at,
                ],
            )?;

            Ok((record, relationship.patient_agent_id))
        })?;

        // The termination is durable; write its audit entry and link the
        // sequence into the record. A failure here surfaces to the caller
        // while the committed status flip stands.
        let entry = self.audit.append(
            AuditCategory::Termination,
            "relationship_terminated",
            Some(provider_npi),
            Some(json!({
                "relationship_id": relationship_id,
                "patient_agent_id": patient_agent_id,
                "reason": reason,
            })),
        )?;
        record.audit_entry_sequence = entry.sequence;
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE termination_records SET audit_entry_sequence = ?1
                 WHERE termination_id = ?2",
                params![entry.sequence as i64, record.termination_id],
            )?;
            Ok(())
        })?;

        info!(
            relationship_id = %record.relationship_id,
            provider_npi = %record.provider_npi,
            "Relationship terminated"
        );
        Ok(record)
    }

    /// Termination record for a relationship, if one exists.
    pub fn record_for(&self, relationship_id: &str) -> Result<Option<TerminationRecord>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM termination_records WHERE relationship_id = ?1",
                    [relationship_id],
                    map_record,
                )
                .optional()?)
        })
    }
}

fn map_record(row: &Row<'_>) -> rusqlite::Result<TerminationRecord> {
    let sequence: i64 = row.get("audit_entry_sequence")?;
    Ok(TerminationRecord {
        termination_id: row.get("termination_id")?,
        relationship_id: row.get("relationship_id")?,
        provider_npi: row.get("provider_npi")?,
        reason: row.get("reason")?,
        terminated_at: row.get("terminated_at")?,
        audit_entry_sequence: sequence as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relationship::{new_relationship_id, RelationshipStore};

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<Database>,
        store: RelationshipStore,
        handler: TerminationHandler,
        audit_path: std::path::PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let audit_path = dir.path().join("audit.ndjson");
        let db = Arc::new(Database::open_in_memory().unwrap());
        let audit = Arc::new(AuditLog::open(&audit_path).unwrap());
        Fixture {
            _dir: dir,
            db: Arc::clone(&db),
            store: RelationshipStore::new(Arc::clone(&db)),
            handler: TerminationHandler::new(db, audit),
            audit_path,
        }
    }

    fn audit_entry_count(f: &Fixture) -> u64 {
        crate::audit::verify(&f.audit_path).unwrap().entries
    }

    fn established(f: &Fixture) -> String {
        f.store
            .create(
                &new_relationship_id(),
                "patient-001",
                "9876543210",
                &["office_visit".to_string()],
                &[7u8; 32],
            )
            .unwrap()
            .relationship_id
    }

    #[test]
    fn terminate_flips_status_and_links_audit() {
        let f = fixture();
        let id = established(&f);

        let record = f.handler.terminate(&id, "9876543210", "care ended").unwrap();
        assert_eq!(record.relationship_id, id);
        assert!(record.audit_entry_sequence > 0);

        let rel = f.store.find_by_id(&id).unwrap().unwrap();
        assert_eq!(rel.status, RelationshipStatus::Terminated);

        let stored = f.handler.record_for(&id).unwrap().unwrap();
        assert_eq!(stored.audit_entry_sequence, record.audit_entry_sequence);
        assert_eq!(stored.reason, "care ended");

        let report = crate::audit::verify(&f.audit_path).unwrap();
        assert!(report.valid);
        assert_eq!(report.entries, 1);
    }

    #[test]
    fn re_termination_is_rejected() {
        let f = fixture();
        let id = established(&f);

        f.handler.terminate(&id, "9876543210", "first").unwrap();
        let err = f.handler.terminate(&id, "9876543210", "second").unwrap_err();
        assert!(matches!(err, NeuronError::AlreadyTerminated(_)));

        // No second termination record appears.
        let count = f.handler.record_for(&id).unwrap();
        assert!(count.is_some());
    }

    #[test]
    fn wrong_provider_cannot_terminate() {
        let f = fixture();
        let id = established(&f);

        let err = f.handler.terminate(&id, "1234567893", "nope").unwrap_err();
        assert!(matches!(err, NeuronError::ProviderMismatch(_)));

        let rel = f.store.find_by_id(&id).unwrap().unwrap();
        assert_eq!(rel.status, RelationshipStatus::Active);
        assert!(f.handler.record_for(&id).unwrap().is_none());
    }

    #[test]
    fn unknown_relationship_is_not_found() {
        let f = fixture();
        let err = f.handler.terminate("missing", "9876543210", "x").unwrap_err();
        assert!(matches!(err, NeuronError::NotFound(_)));
    }

    #[test]
    fn rejected_attempts_leave_no_audit_entry() {
        let f = fixture();
        let id = established(&f);

        f.handler.terminate("missing", "9876543210", "x").unwrap_err();
        f.handler.terminate(&id, "1234567893", "wrong provider").unwrap_err();
        assert_eq!(audit_entry_count(&f), 0);

        f.handler.terminate(&id, "9876543210", "care ended").unwrap();
        assert_eq!(audit_entry_count(&f), 1);

        f.handler.terminate(&id, "9876543210", "again").unwrap_err();
        assert_eq!(audit_entry_count(&f), 1);
    }

    #[test]
    fn sql_failure_rolls_back_without_an_audit_entry() {
        let f = fixture();
        let id = established(&f);

        // Force the record insert to fail after validation and the status
        // update have already run inside the transaction.
        f.db.with_conn(|conn| {
            conn.execute_batch("DROP TABLE termination_records")?;
            Ok(())
        })
        .unwrap();

        let err = f.handler.terminate(&id, "9876543210", "doomed").unwrap_err();
        assert!(matches!(err, NeuronError::Database(_)));

        // The status flip rolled back with the rest of the transaction, and
        // no audit entry records a termination that never happened.
        let rel = f.store.find_by_id(&id).unwrap().unwrap();
        assert_eq!(rel.status, RelationshipStatus::Active);
        assert_eq!(audit_entry_count(&f), 0);
    }
}
