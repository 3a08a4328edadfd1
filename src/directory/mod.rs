//! Directory integration
//!
//! The national directory sits above every neuron: `client` speaks its HTTP
//! API, `state` persists what the directory issued us, and `registration`
//! runs the lifecycle (startup registration, heartbeat, provider management).

pub mod client;
pub mod registration;
pub mod state;

pub use client::{DirectoryClient, DirectoryError, DirectoryListing};
pub use registration::{
    ProviderError, RegistrationConfig, RegistrationService, RegistrationSummary,
};
pub use state::{ProviderRegistration, ProviderStatus, RegistrationState, RegistrationStatus};
