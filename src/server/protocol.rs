//! Handshake wire protocol
//!
//! JSON envelopes over text frames with a `type` discriminator, plus the
//! operational close-code contract:
//!
//! - 1000 normal completion
//! - 1001 server shutting down
//! - 4001 auth timeout
//! - 4002 invalid message
//! - 4003 consent/challenge verification failure

use serde::{Deserialize, Serialize};

use crate::consent::{ConsentError, HandshakeError};

/// Protocol version string, advertised over mDNS and `/version`.
pub const PROTOCOL_VERSION: &str = "v1.0";

/// Handshake path on the shared HTTP listener.
pub const HANDSHAKE_PATH: &str = "/ws/handshake";

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;
pub const CLOSE_AUTH_TIMEOUT: u16 = 4001;
pub const CLOSE_INVALID_MESSAGE: u16 = 4002;
pub const CLOSE_CONSENT_FAILED: u16 = 4003;

/// Wire error codes.
pub mod codes {
    pub const AUTH_TIMEOUT: &str = "AUTH_TIMEOUT";
    pub const INVALID_MESSAGE: &str = "INVALID_MESSAGE";
    pub const CONSENT_FAILED: &str = "CONSENT_FAILED";
    pub const SERVER_ERROR: &str = "SERVER_ERROR";
    pub const SERVER_BUSY: &str = "SERVER_BUSY";
    pub const CEILING_TIMEOUT: &str = "CEILING_TIMEOUT";
}

/// Client -> server frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "handshake.auth")]
    Auth(AuthFrame),

    #[serde(rename = "handshake.challenge_response")]
    ChallengeResponse { signed_nonce: String },
}

#[derive(Debug, Deserialize)]
pub struct AuthFrame {
    /// Exact signed claim bytes, base64url.
    pub consent_token_payload: String,
    /// 64-byte Ed25519 signature over the payload, base64url.
    pub consent_token_signature: String,
    pub patient_agent_id: String,
    /// Raw 32-byte Ed25519 key, base64url.
    pub patient_public_key: String,
    #[serde(default)]
    pub patient_endpoint: Option<String>,
}

/// Server -> client frames.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "handshake.challenge")]
    Challenge {
        nonce: String,
        provider_npi: String,
        organization_npi: String,
    },

    #[serde(rename = "handshake.complete")]
    Complete {
        relationship_id: String,
        provider_endpoint: String,
        status: &'static str,
    },

    #[serde(rename = "handshake.error")]
    Error { code: String, message: String },
}

impl ServerFrame {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Map an engine failure to its wire error code and close code.
///
/// All verification failures close 4003; a malformed token is reported as
/// `INVALID_MESSAGE` on the wire but still closes 4003 because it surfaced
/// during consent processing.
pub fn error_mapping(error: &HandshakeError) -> (&'static str, u16) {
    match error {
        HandshakeError::Consent(ConsentError::Malformed(_)) => {
            (codes::INVALID_MESSAGE, CLOSE_CONSENT_FAILED)
        }
        HandshakeError::Consent(_) => (codes::CONSENT_FAILED, CLOSE_CONSENT_FAILED),
        HandshakeError::NonceUnknown
        | HandshakeError::NonceExpired
        | HandshakeError::ProviderMismatch => (codes::CONSENT_FAILED, CLOSE_CONSENT_FAILED),
        HandshakeError::AgentMismatch => (codes::INVALID_MESSAGE, CLOSE_CONSENT_FAILED),
        HandshakeError::RegistryFull => (codes::SERVER_BUSY, CLOSE_TRY_AGAIN_LATER),
        HandshakeError::Storage(_) => (codes::SERVER_ERROR, CLOSE_INTERNAL_ERROR),
    }
}
