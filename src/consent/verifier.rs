//! Consent token verification
//!
//! A consent token is a raw JSON claims payload plus a 64-byte Ed25519
//! signature over those exact bytes. Verification is stateless and ordered:
//! signature over the transmitted bytes first, then JSON parse, then expiry.
//! A tampered token never reaches the JSON parser, and the payload is never
//! re-serialized before checking the signature.

use base64::prelude::*;
use chrono::Utc;
use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Claims carried by a consent token. `consented_actions` is opaque to the
/// broker: stored and returned verbatim, never evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsentClaims {
    pub patient_agent_id: String,
    pub provider_npi: String,
    pub consented_actions: Vec<String>,
    pub iat: i64,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsentError {
    #[error("consent token signature is invalid")]
    InvalidSignature,

    #[error("consent token has expired")]
    Expired,

    #[error("consent token is malformed: {0}")]
    Malformed(String),
}

impl ConsentError {
    /// Stable error code, as exposed on the wire and in audit details.
    pub fn code(&self) -> &'static str {
        match self {
            ConsentError::InvalidSignature => "INVALID_SIGNATURE",
            ConsentError::Expired => "CONSENT_EXPIRED",
            ConsentError::Malformed(_) => "MALFORMED_TOKEN",
        }
    }
}

/// Import a patient public key from its base64url raw-32-byte form.
pub fn import_public_key(encoded: &str) -> Result<VerifyingKey, ConsentError> {
    let bytes = BASE64_URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| ConsentError::Malformed(format!("public key is not base64url: {}", e)))?;
    let raw: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ConsentError::Malformed("public key must be 32 bytes".into()))?;
    VerifyingKey::from_bytes(&raw)
        .map_err(|e| ConsentError::Malformed(format!("invalid Ed25519 public key: {}", e)))
}

/// Decode a base64url-encoded 64-byte Ed25519 signature.
pub fn decode_signature(encoded: &str) -> Result<Signature, ConsentError> {
    let bytes = BASE64_URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| ConsentError::Malformed(format!("signature is not base64url: {}", e)))?;
    let raw: [u8; 64] = bytes
        .try_into()
        .map_err(|_| ConsentError::Malformed("signature must be 64 bytes".into()))?;
    Ok(Signature::from_bytes(&raw))
}

/// Decode a base64url consent payload back to the exact signed bytes.
pub fn decode_payload(encoded: &str) -> Result<Vec<u8>, ConsentError> {
    BASE64_URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| ConsentError::Malformed(format!("payload is not base64url: {}", e)))
}

/// Verify a consent token and extract its claims.
///
/// Every call performs the full check; no result caching.
pub fn verify(
    payload: &[u8],
    signature: &Signature,
    public_key: &VerifyingKey,
) -> Result<ConsentClaims, ConsentError> {
    public_key
        .verify_strict(payload, signature)
        .map_err(|_| ConsentError::InvalidSignature)?;

    let claims: ConsentClaims = serde_json::from_slice(payload)
        .map_err(|e| ConsentError::Malformed(format!("claims are not valid JSON: {}", e)))?;

    if claims.exp <= Utc::now().timestamp() {
        return Err(ConsentError::Expired);
    }

    Ok(claims)
}
