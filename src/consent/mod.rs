//! Consent and relationship engine
//!
//! Three cooperating pieces:
//!
//! - **Verifier**: stateless Ed25519 consent-token verification
//! - **Challenge registry**: short-lived nonce store for the
//!   challenge-response round
//! - **Handshake engine**: the two-message protocol that turns a verified
//!   token plus a signed nonce into a durable relationship

pub mod challenge;
pub mod handshake;
pub mod verifier;

pub use challenge::{ChallengeError, ChallengeRegistry, PendingChallenge};
pub use handshake::{
    AuthOutcome, Challenge, CompleteOutcome, CompleteStatus, HandshakeEngine, HandshakeError,
};
pub use verifier::{ConsentClaims, ConsentError};
