//! Neuron - organizational trust broker
//!
//! One instance per NPI-holding organization. Sits between the national
//! directory above and the organization's provider agents below, and
//! terminates inbound connections from patient agents.
//!
//! ## Subsystems
//!
//! - **Consent**: Ed25519 token verification, challenge-response handshake,
//!   relationship establishment
//! - **Server**: handshake WebSocket + operator REST on one listener, with a
//!   bounded-concurrency admission queue that holds rather than refuses
//! - **Audit**: append-only hash-chained record of every consequential action
//! - **Directory**: registration lifecycle, heartbeat with backoff, degraded
//!   mode when the directory is unreachable
//!
//! The broker never stores clinical data and never relays clinical traffic:
//! after a successful handshake it returns the provider endpoint and closes.

pub mod advertise;
pub mod audit;
pub mod config;
pub mod consent;
pub mod db;
pub mod directory;
pub mod health;
pub mod ipc;
pub mod npi;
pub mod relationship;
pub mod routes;
pub mod server;
pub mod types;

pub use config::Args;
pub use server::{run, AppState};
pub use types::{NeuronError, Result};
