//! Tamper-evident audit log
//!
//! Append-only newline-delimited JSON file in which every entry carries a
//! SHA-256 hash over its own canonical serialization and the hash of the
//! previous entry. Appends are serialized through a single writer lock so
//! sequences are strictly monotonic and records land on disk in order.
//!
//! The log is the system of record for every consequential action the broker
//! takes: registrations, connections, consent decisions, API access,
//! administrative commands, and terminations.

pub mod canonical;

pub use canonical::to_canonical_json;

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::types::{NeuronError, Result};

/// `prev_hash` of the first entry in a chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Category of an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    Registration,
    Connection,
    Consent,
    ApiAccess,
    Admin,
    Termination,
    Sync,
}

impl AuditCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditCategory::Registration => "registration",
            AuditCategory::Connection => "connection",
            AuditCategory::Consent => "consent",
            AuditCategory::ApiAccess => "api_access",
            AuditCategory::Admin => "admin",
            AuditCategory::Termination => "termination",
            AuditCategory::Sync => "sync",
        }
    }
}

/// One hash-chained audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence: u64,
    pub timestamp: String,
    pub category: AuditCategory,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub prev_hash: String,
    pub hash: String,
}

struct LogState {
    file: File,
    last_sequence: u64,
    last_hash: String,
}

/// Append-only audit log with an in-memory chain head.
pub struct AuditLog {
    path: PathBuf,
    state: Mutex<LogState>,
}

impl AuditLog {
    /// Open (or create) the log at `path`, recovering the chain head from the
    /// last complete entry. A partial trailing line is truncated with a
    /// warning; the chain up to the last complete entry remains verifiable.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let content = if path.exists() {
            fs::read_to_string(&path)?
        } else {
            String::new()
        };

        let mut last_sequence = 0u64;
        let mut last_hash = GENESIS_HASH.to_string();
        let mut valid_bytes = 0usize;
        let mut offset = 0usize;
        let mut truncated = false;

        for piece in content.split_inclusive('\n') {
            let complete = piece.ends_with('\n');
            if !complete {
                // Writer died mid-line; drop the fragment.
                truncated = true;
                break;
            }
            let line = piece.trim_end_matches('\n');
            offset += piece.len();
            if line.is_empty() {
                valid_bytes = offset;
                continue;
            }
            match serde_json::from_str::<Value>(line) {
                Ok(value) => {
                    let seq = value.get("sequence").and_then(Value::as_u64);
                    let hash = value.get("hash").and_then(Value::as_str);
                    if let (Some(seq), Some(hash)) = (seq, hash) {
                        last_sequence = seq;
                        last_hash = hash.to_string();
                    } else {
                        warn!("Audit entry at byte {} is missing sequence/hash", offset);
                    }
                    valid_bytes = offset;
                }
                Err(e) => {
                    warn!("Unparseable audit line at byte {}: {}", offset, e);
                    valid_bytes = offset;
                }
            }
        }

        if truncated {
            warn!(
                path = %path.display(),
                "Truncating partial trailing audit line ({} of {} bytes kept)",
                valid_bytes,
                content.len()
            );
            let f = OpenOptions::new().write(true).open(&path)?;
            f.set_len(valid_bytes as u64)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        debug!(
            path = %path.display(),
            last_sequence,
            "Audit log opened"
        );

        Ok(Self {
            path,
            state: Mutex::new(LogState {
                file,
                last_sequence,
                last_hash,
            }),
        })
    }

    /// Append an entry, assigning the next sequence and extending the chain.
    /// Synchronous: the record is on the file before this returns.
    pub fn append(
        &self,
        category: AuditCategory,
        action: &str,
        actor: Option<&str>,
        details: Option<Value>,
    ) -> Result<AuditEntry> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| NeuronError::Audit(format!("writer lock poisoned: {}", e)))?;

        let mut entry = AuditEntry {
            sequence: state.last_sequence + 1,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            category,
            action: action.to_string(),
            actor: actor.map(|a| a.to_string()),
            details,
            prev_hash: state.last_hash.clone(),
            hash: String::new(),
        };
        entry.hash = compute_entry_hash(&entry)?;

        let line = to_canonical_json(&serde_json::to_value(&entry)?);
        state.file.write_all(line.as_bytes())?;
        state.file.write_all(b"\n")?;
        state.file.flush()?;

        state.last_sequence = entry.sequence;
        state.last_hash = entry.hash.clone();

        Ok(entry)
    }

    /// Sequence of the most recent entry (0 before the first append).
    pub fn head_sequence(&self) -> u64 {
        self.state.lock().map(|s| s.last_sequence).unwrap_or(0)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Hash an entry: SHA-256 over the canonical serialization with the `hash`
/// field omitted.
fn compute_entry_hash(entry: &AuditEntry) -> Result<String> {
    let mut value = serde_json::to_value(entry)?;
    if let Some(obj) = value.as_object_mut() {
        obj.remove("hash");
    }
    let canonical = to_canonical_json(&value);
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(hex::encode(digest))
}

/// Result of an offline chain verification.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub valid: bool,
    pub entries: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_error: Option<String>,
}

impl VerifyReport {
    fn broken(entries: u64, error: String) -> Self {
        Self {
            valid: false,
            entries,
            first_error: Some(error),
        }
    }
}

/// Walk the chain at `path` and recompute every link.
///
/// A missing or empty file is a valid empty chain. A partial trailing line is
/// ignored, matching the writer's recovery behavior.
pub fn verify(path: &Path) -> Result<VerifyReport> {
    if !path.exists() {
        return Ok(VerifyReport {
            valid: true,
            entries: 0,
            first_error: None,
        });
    }

    let content = fs::read_to_string(path)?;
    let mut entries = 0u64;
    let mut prev_hash = GENESIS_HASH.to_string();
    let mut prev_sequence = 0u64;

    for piece in content.split_inclusive('\n') {
        let complete = piece.ends_with('\n');
        let line = piece.trim_end_matches('\n');
        if line.is_empty() {
            continue;
        }
        if !complete {
            // Partial trailing line: the chain up to here is what counts.
            break;
        }

        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                return Ok(VerifyReport::broken(
                    entries,
                    format!("entry {} is not valid JSON: {}", entries + 1, e),
                ));
            }
        };

        let sequence = match value.get("sequence").and_then(Value::as_u64) {
            Some(s) => s,
            None => {
                return Ok(VerifyReport::broken(
                    entries,
                    format!("entry {} has no sequence", entries + 1),
                ));
            }
        };
        let stored_hash = value
            .get("hash")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let stored_prev = value
            .get("prev_hash")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if sequence != prev_sequence + 1 {
            return Ok(VerifyReport::broken(
                entries,
                format!(
                    "entry {} breaks sequence order (expected {}, found {})",
                    sequence,
                    prev_sequence + 1,
                    sequence
                ),
            ));
        }

        if stored_prev != prev_hash {
            return Ok(VerifyReport::broken(
                entries,
                format!("entry {} prev_hash does not match prior entry", sequence),
            ));
        }

        let mut without_hash = value.clone();
        if let Some(obj) = without_hash.as_object_mut() {
            obj.remove("hash");
        }
        let recomputed = hex::encode(Sha256::digest(to_canonical_json(&without_hash).as_bytes()));
        if recomputed != stored_hash {
            return Ok(VerifyReport::broken(
                entries,
                format!("entry {} hash does not match its content", sequence),
            ));
        }

        prev_hash = stored_hash;
        prev_sequence = sequence;
        entries += 1;
    }

    Ok(VerifyReport {
        valid: true,
        entries,
        first_error: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_log() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.ndjson");
        (dir, path)
    }

    #[test]
    fn appends_form_a_valid_chain() {
        let (_dir, path) = temp_log();
        let log = AuditLog::open(&path).unwrap();

        for i in 0..5 {
            log.append(
                AuditCategory::Connection,
                "handshake_started",
                Some("patient-001"),
                Some(json!({ "round": i })),
            )
            .unwrap();
        }

        let report = verify(&path).unwrap();
        assert!(report.valid);
        assert_eq!(report.entries, 5);
        assert_eq!(log.head_sequence(), 5);
    }

    #[test]
    fn first_entry_links_to_genesis() {
        let (_dir, path) = temp_log();
        let log = AuditLog::open(&path).unwrap();
        let entry = log
            .append(AuditCategory::Registration, "neuron_registered", None, None)
            .unwrap();
        assert_eq!(entry.sequence, 1);
        assert_eq!(entry.prev_hash, GENESIS_HASH);
    }

    #[test]
    fn missing_file_is_a_valid_empty_chain() {
        let (_dir, path) = temp_log();
        let report = verify(&path).unwrap();
        assert!(report.valid);
        assert_eq!(report.entries, 0);
    }

    #[test]
    fn mutated_action_is_detected() {
        let (_dir, path) = temp_log();
        let log = AuditLog::open(&path).unwrap();
        log.append(AuditCategory::Consent, "relationship_established", None, None)
            .unwrap();
        log.append(AuditCategory::Connection, "handshake_completed", None, None)
            .unwrap();
        drop(log);

        let content = fs::read_to_string(&path).unwrap();
        let tampered = content.replace("relationship_established", "relationship_revoked");
        assert_ne!(content, tampered);
        fs::write(&path, tampered).unwrap();

        let report = verify(&path).unwrap();
        assert!(!report.valid);
        assert!(report.first_error.unwrap().contains("entry 1"));
    }

    #[test]
    fn mutated_prev_hash_is_detected() {
        let (_dir, path) = temp_log();
        let log = AuditLog::open(&path).unwrap();
        log.append(AuditCategory::Admin, "one", None, None).unwrap();
        log.append(AuditCategory::Admin, "two", None, None).unwrap();
        drop(log);

        // Point entry 2's prev_hash somewhere else; its own hash then fails
        // to match because prev_hash is covered by the entry hash.
        let content = fs::read_to_string(&path).unwrap();
        let mut lines: Vec<String> = content.lines().map(String::from).collect();
        let mut second: Value = serde_json::from_str(&lines[1]).unwrap();
        second["prev_hash"] = Value::String(GENESIS_HASH.to_string());
        lines[1] = to_canonical_json(&second);
        fs::write(&path, lines.join("\n") + "\n").unwrap();

        let report = verify(&path).unwrap();
        assert!(!report.valid);
    }

    #[test]
    fn identical_details_in_any_key_order_hash_identically() {
        let (_dir, path_a) = temp_log();
        let log_a = AuditLog::open(&path_a).unwrap();
        let a = log_a
            .append(
                AuditCategory::Admin,
                "x",
                None,
                Some(serde_json::from_str(r#"{"b":1,"a":2}"#).unwrap()),
            )
            .unwrap();

        let (_dir2, path_b) = temp_log();
        let log_b = AuditLog::open(&path_b).unwrap();
        let b = log_b
            .append(
                AuditCategory::Admin,
                "x",
                None,
                Some(serde_json::from_str(r#"{"a":2,"b":1}"#).unwrap()),
            )
            .unwrap();

        // Timestamps differ, so compare the canonical detail portion by
        // recomputing with pinned fields.
        let mut entry_a = a.clone();
        let mut entry_b = b.clone();
        entry_a.timestamp = "2026-01-01T00:00:00.000Z".into();
        entry_b.timestamp = "2026-01-01T00:00:00.000Z".into();
        let ha = compute_entry_hash(&entry_a).unwrap();
        let hb = compute_entry_hash(&entry_b).unwrap();
        assert_eq!(ha, hb);
    }

    #[test]
    fn partial_trailing_line_is_truncated_on_open() {
        let (_dir, path) = temp_log();
        {
            let log = AuditLog::open(&path).unwrap();
            log.append(AuditCategory::Sync, "heartbeat", None, None).unwrap();
            log.append(AuditCategory::Sync, "heartbeat", None, None).unwrap();
        }

        // Simulate a crash mid-write.
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"{\"sequence\":3,\"timest").unwrap();
        drop(f);

        let log = AuditLog::open(&path).unwrap();
        assert_eq!(log.head_sequence(), 2);

        // Appending after recovery extends a verifiable chain.
        log.append(AuditCategory::Sync, "heartbeat", None, None).unwrap();
        let report = verify(&path).unwrap();
        assert!(report.valid);
        assert_eq!(report.entries, 3);
    }

    #[test]
    fn chain_survives_reopen() {
        let (_dir, path) = temp_log();
        {
            let log = AuditLog::open(&path).unwrap();
            log.append(AuditCategory::Connection, "a", None, None).unwrap();
        }
        {
            let log = AuditLog::open(&path).unwrap();
            let e = log.append(AuditCategory::Connection, "b", None, None).unwrap();
            assert_eq!(e.sequence, 2);
            assert_ne!(e.prev_hash, GENESIS_HASH);
        }
        let report = verify(&path).unwrap();
        assert!(report.valid);
        assert_eq!(report.entries, 2);
    }
}
