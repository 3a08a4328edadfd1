//! Handshake engine
//!
//! Orchestrates the two-message consent handshake: verify the consent token,
//! short-circuit to the existing active relationship on reconnect, otherwise
//! issue a challenge and, on a valid challenge response, establish the
//! relationship with a linked audit entry.

use std::sync::Arc;

use ed25519_dalek::{Signature, VerifyingKey};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::audit::{AuditCategory, AuditLog};
use crate::consent::challenge::{ChallengeError, ChallengeRegistry};
use crate::consent::verifier::{self, ConsentClaims, ConsentError};
use crate::relationship::{new_relationship_id, RelationshipStore};
use crate::types::NeuronError;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Consent(#[from] ConsentError),

    #[error("challenge nonce not recognized")]
    NonceUnknown,

    #[error("challenge nonce expired")]
    NonceExpired,

    #[error("consent token provider does not match the pending challenge")]
    ProviderMismatch,

    #[error("patient agent id does not match the consent claims")]
    AgentMismatch,

    #[error("challenge registry at capacity")]
    RegistryFull,

    #[error("storage failure: {0}")]
    Storage(#[from] NeuronError),
}

impl From<ChallengeError> for HandshakeError {
    fn from(e: ChallengeError) -> Self {
        match e {
            ChallengeError::Full => HandshakeError::RegistryFull,
            ChallengeError::NotFound => HandshakeError::NonceUnknown,
            ChallengeError::Expired => HandshakeError::NonceExpired,
        }
    }
}

/// Server-issued challenge, sent back to the patient agent.
#[derive(Debug, Clone)]
pub struct Challenge {
    pub nonce: String,
    pub provider_npi: String,
    pub organization_npi: String,
}

/// Outcome of the first handshake message.
#[derive(Debug)]
pub enum AuthOutcome {
    /// An active relationship already exists for this (patient, provider):
    /// idempotent reconnect, no challenge round.
    Existing {
        relationship_id: String,
        claims: ConsentClaims,
    },
    /// Fresh pair; a challenge was issued.
    Challenged {
        challenge: Challenge,
        claims: ConsentClaims,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteStatus {
    New,
    Existing,
}

impl CompleteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompleteStatus::New => "new",
            CompleteStatus::Existing => "existing",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompleteOutcome {
    pub relationship_id: String,
    pub provider_npi: String,
    pub status: CompleteStatus,
}

pub struct HandshakeEngine {
    organization_npi: String,
    endpoint_url: String,
    challenges: Arc<ChallengeRegistry>,
    relationships: Arc<RelationshipStore>,
    audit: Arc<AuditLog>,
}

impl HandshakeEngine {
    pub fn new(
        organization_npi: String,
        endpoint_url: String,
        challenges: Arc<ChallengeRegistry>,
        relationships: Arc<RelationshipStore>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            organization_npi,
            endpoint_url,
            challenges,
            relationships,
            audit,
        }
    }

    /// Process `handshake.auth`: verify the consent token against the claimed
    /// patient key, then either return the existing active relationship or
    /// issue a challenge.
    pub fn authenticate(
        &self,
        payload: &[u8],
        signature: &Signature,
        patient_agent_id: &str,
        patient_public_key: &VerifyingKey,
    ) -> Result<AuthOutcome, HandshakeError> {
        let claims = verifier::verify(payload, signature, patient_public_key)?;

        if claims.patient_agent_id != patient_agent_id {
            return Err(HandshakeError::AgentMismatch);
        }

        if let Some(existing) = self
            .relationships
            .find_active(&claims.patient_agent_id, &claims.provider_npi)?
        {
            debug!(
                relationship_id = %existing.relationship_id,
                "Reconnect for existing active relationship"
            );
            return Ok(AuthOutcome::Existing {
                relationship_id: existing.relationship_id,
                claims,
            });
        }

        let challenge = self.start(
            &claims.patient_agent_id,
            &claims.provider_npi,
            *patient_public_key,
        )?;
        Ok(AuthOutcome::Challenged { challenge, claims })
    }

    /// Register a pending challenge and return its nonce.
    pub fn start(
        &self,
        patient_agent_id: &str,
        provider_npi: &str,
        patient_public_key: VerifyingKey,
    ) -> Result<Challenge, HandshakeError> {
        let nonce = self
            .challenges
            .issue(patient_agent_id, provider_npi, patient_public_key)?;
        Ok(Challenge {
            nonce,
            provider_npi: provider_npi.to_string(),
            organization_npi: self.organization_npi.clone(),
        })
    }

    /// Process `handshake.challenge_response`: consume the nonce, verify the
    /// signature over its raw bytes, re-verify the consent token, and
    /// establish (or return) the relationship.
    pub fn complete(
        &self,
        nonce: &str,
        signed_nonce: &Signature,
        token_payload: &[u8],
        token_signature: &Signature,
    ) -> Result<CompleteOutcome, HandshakeError> {
        let pending = self.challenges.consume(nonce)?;

        let nonce_bytes = hex::decode(&pending.nonce)
            .map_err(|e| ConsentError::Malformed(format!("nonce is not hex: {}", e)))?;
        pending
            .patient_public_key
            .verify_strict(&nonce_bytes, signed_nonce)
            .map_err(|_| ConsentError::InvalidSignature)?;

        let claims = verifier::verify(token_payload, token_signature, &pending.patient_public_key)?;
        if claims.provider_npi != pending.provider_npi {
            return Err(HandshakeError::ProviderMismatch);
        }

        // A relationship may have appeared between the two frames; the
        // reconnect path stays idempotent either way.
        if let Some(existing) = self
            .relationships
            .find_active(&claims.patient_agent_id, &claims.provider_npi)?
        {
            return Ok(CompleteOutcome {
                relationship_id: existing.relationship_id,
                provider_npi: claims.provider_npi,
                status: CompleteStatus::Existing,
            });
        }

        let relationship_id = new_relationship_id();
        self.relationships.create(
            &relationship_id,
            &claims.patient_agent_id,
            &claims.provider_npi,
            &claims.consented_actions,
            pending.patient_public_key.as_bytes(),
        )?;

        // Row first, entry second: a failed row write leaves no audit trace,
        // and a failed audit write discards the row so neither survives.
        if let Err(e) = self.audit.append(
            AuditCategory::Consent,
            "relationship_established",
            Some(&claims.patient_agent_id),
            Some(json!({
                "relationship_id": relationship_id,
                "patient_agent_id": claims.patient_agent_id,
                "provider_npi": claims.provider_npi,
            })),
        ) {
            if let Err(cleanup) = self.relationships.discard(&relationship_id) {
                warn!(
                    relationship_id = %relationship_id,
                    "Failed to discard unaudited relationship: {}", cleanup
                );
            }
            return Err(e.into());
        }

        info!(
            relationship_id = %relationship_id,
            provider_npi = %claims.provider_npi,
            "Relationship established"
        );

        Ok(CompleteOutcome {
            relationship_id,
            provider_npi: claims.provider_npi,
            status: CompleteStatus::New,
        })
    }

    /// Direct endpoint handed to the patient agent after a successful
    /// handshake. Opaque past this point; the broker steps out after
    /// returning it.
    pub fn provider_endpoint(&self, provider_npi: &str) -> String {
        format!(
            "{}/agents/{}",
            self.endpoint_url.trim_end_matches('/'),
            provider_npi
        )
    }

    pub fn organization_npi(&self) -> &str {
        &self.organization_npi
    }
}
