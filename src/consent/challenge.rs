//! Pending-challenge registry
//!
//! Short-lived map from a server-issued nonce to the handshake context that
//! produced it. Entries live for 30 seconds, are consumed exactly once, and
//! expired entries are purged on every new issue. The map is hard-capped;
//! when full, new handshakes are refused rather than evicting live ones.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use ed25519_dalek::VerifyingKey;
use rand::RngCore;
use thiserror::Error;
use tracing::debug;

/// How long an issued nonce stays answerable.
pub const CHALLENGE_TTL: Duration = Duration::from_secs(30);

/// Hard cap on simultaneously pending challenges.
pub const MAX_PENDING_CHALLENGES: usize = 1000;

/// Context captured when a challenge is issued, returned on consume.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChallenge {
    pub nonce: String,
    pub patient_agent_id: String,
    pub provider_npi: String,
    pub patient_public_key: VerifyingKey,
    pub expires_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChallengeError {
    #[error("challenge registry is at capacity")]
    Full,

    #[error("nonce not recognized")]
    NotFound,

    #[error("nonce has expired")]
    Expired,
}

pub struct ChallengeRegistry {
    ttl: Duration,
    capacity: usize,
    entries: Mutex<HashMap<String, PendingChallenge>>,
}

impl ChallengeRegistry {
    pub fn new() -> Self {
        Self::with_limits(CHALLENGE_TTL, MAX_PENDING_CHALLENGES)
    }

    pub fn with_limits(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a fresh nonce for a handshake in progress.
    ///
    /// Purges expired entries first; refuses with `Full` if the registry is
    /// still at capacity afterwards.
    pub fn issue(
        &self,
        patient_agent_id: &str,
        provider_npi: &str,
        patient_public_key: VerifyingKey,
    ) -> Result<String, ChallengeError> {
        let mut entries = self.entries.lock().expect("challenge registry lock poisoned");

        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, pending| pending.expires_at > now);
        if before > entries.len() {
            debug!("Purged {} expired challenge(s)", before - entries.len());
        }

        if entries.len() >= self.capacity {
            return Err(ChallengeError::Full);
        }

        let mut nonce_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = hex::encode(nonce_bytes);

        entries.insert(
            nonce.clone(),
            PendingChallenge {
                nonce: nonce.clone(),
                patient_agent_id: patient_agent_id.to_string(),
                provider_npi: provider_npi.to_string(),
                patient_public_key,
                expires_at: now + self.ttl,
            },
        );

        Ok(nonce)
    }

    /// Consume a nonce, single-use. The entry is removed even when the
    /// result is `Expired`.
    pub fn consume(&self, nonce: &str) -> Result<PendingChallenge, ChallengeError> {
        let mut entries = self.entries.lock().expect("challenge registry lock poisoned");
        let pending = entries.remove(nonce).ok_or(ChallengeError::NotFound)?;
        if pending.expires_at <= Instant::now() {
            return Err(ChallengeError::Expired);
        }
        Ok(pending)
    }

    /// Number of live pending challenges.
    pub fn pending_count(&self) -> usize {
        self.entries
            .lock()
            .expect("challenge registry lock poisoned")
            .len()
    }
}

impl Default for ChallengeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
