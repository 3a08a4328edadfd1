//! Registration lifecycle
//!
//! Registers this neuron with the national directory at startup, persists the
//! issued registration id and bearer token, and keeps the registration warm
//! with a periodic endpoint heartbeat. Directory unreachability is never
//! fatal: the broker runs degraded and established relationships stay
//! routable. The heartbeat never re-runs initial registration; that takes a
//! fresh start or an explicit operator action.

use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audit::{AuditCategory, AuditLog};
use crate::db::Database;
use crate::directory::client::{
    DirectoryClient, DirectoryError, EndpointUpdate, RegisterNeuronRequest,
};
use crate::directory::state::{
    ProviderRegistration, ProviderStatus, RegistrationState, RegistrationStatus, RegistrationStore,
};
use crate::health::{HealthFile, HealthStatus};
use crate::npi;
use crate::types::{NeuronError, Result};

/// Base delay for heartbeat backoff; doubles per consecutive failure.
const BACKOFF_BASE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("invalid provider NPI: {0}")]
    InvalidNpi(String),

    #[error("neuron is not registered with the directory")]
    NotRegistered,

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Storage(#[from] NeuronError),
}

#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    pub organization_npi: String,
    pub organization_name: String,
    pub organization_type: String,
    pub directory_url: String,
    /// Public handshake endpoint advertised to the directory.
    pub endpoint_url: String,
    pub heartbeat_interval: Duration,
    pub backoff_ceiling: Duration,
}

/// Registration state as exposed over the REST surface. The bearer token is
/// deliberately not part of this shape.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationSummary {
    pub status: RegistrationStatus,
    pub organization_npi: String,
    pub registration_id: Option<String>,
    pub first_registered_at: Option<String>,
    pub last_heartbeat_at: Option<String>,
    pub last_directory_response_at: Option<String>,
}

impl RegistrationSummary {
    pub(crate) fn from_state(state: &RegistrationState) -> Self {
        Self {
            status: state.status,
            organization_npi: state.organization_npi.clone(),
            registration_id: state.registration_id.clone(),
            first_registered_at: state.first_registered_at.clone(),
            last_heartbeat_at: state.last_heartbeat_at.clone(),
            last_directory_response_at: state.last_directory_response_at.clone(),
        }
    }
}

enum BeatOutcome {
    Skipped,
    Ok,
    Failed,
}

pub struct RegistrationService {
    config: RegistrationConfig,
    client: DirectoryClient,
    store: RegistrationStore,
    audit: Arc<AuditLog>,
    health: Arc<HealthFile>,
    state: RwLock<RegistrationState>,
}

impl RegistrationService {
    pub fn new(
        config: RegistrationConfig,
        db: Arc<Database>,
        audit: Arc<AuditLog>,
        health: Arc<HealthFile>,
    ) -> Self {
        let client = DirectoryClient::new(&config.directory_url);
        let state = RegistrationState {
            organization_npi: config.organization_npi.clone(),
            organization_name: config.organization_name.clone(),
            organization_type: config.organization_type.clone(),
            directory_url: config.directory_url.clone(),
            neuron_endpoint_url: config.endpoint_url.clone(),
            registration_id: None,
            bearer_token: None,
            status: RegistrationStatus::Unregistered,
            first_registered_at: None,
            last_heartbeat_at: None,
            last_directory_response_at: None,
        };
        Self {
            config,
            client,
            store: RegistrationStore::new(db),
            audit,
            health,
            state: RwLock::new(state),
        }
    }

    /// Startup registration. Resumes a persisted registration when one
    /// exists, otherwise attempts initial registration; on directory failure
    /// the broker continues unregistered with a degraded health artifact.
    pub async fn startup(&self) -> Result<()> {
        if let Some(persisted) = self.store.load()? {
            if persisted.registration_id.is_some()
                && persisted.status != RegistrationStatus::Unregistered
            {
                info!(
                    registration_id = ?persisted.registration_id,
                    "Resuming persisted directory registration"
                );
                if let Some(token) = persisted.bearer_token.as_deref() {
                    self.client.set_bearer_token(token);
                }
                {
                    let mut state = self.state.write().await;
                    *state = persisted;
                    // Config wins for mutable fields; identity fields persist.
                    state.organization_name = self.config.organization_name.clone();
                    state.organization_type = self.config.organization_type.clone();
                    state.directory_url = self.config.directory_url.clone();
                    state.neuron_endpoint_url = self.config.endpoint_url.clone();
                }
                self.reregister_providers().await;
                let state = self.state.read().await;
                let health_status = match state.status {
                    RegistrationStatus::Registered => HealthStatus::Healthy,
                    _ => HealthStatus::Degraded,
                };
                self.health
                    .write(health_status, state.last_heartbeat_at.as_deref())?;
                return Ok(());
            }
        }

        let request = RegisterNeuronRequest {
            organization_npi: self.config.organization_npi.clone(),
            organization_name: self.config.organization_name.clone(),
            organization_type: self.config.organization_type.clone(),
            endpoint_url: self.config.endpoint_url.clone(),
        };

        match self.client.register_neuron(&request).await {
            Ok(response) => {
                self.client.set_bearer_token(&response.bearer_token);
                let now = now_rfc3339();
                {
                    let mut state = self.state.write().await;
                    state.registration_id = Some(response.registration_id.clone());
                    state.bearer_token = Some(response.bearer_token);
                    state.status = RegistrationStatus::Registered;
                    state.first_registered_at = Some(now.clone());
                    state.last_directory_response_at = Some(now);
                    self.store.save(&state)?;
                }
                // Registration id is audited; the bearer token never is.
                if let Err(e) = self.audit.append(
                    AuditCategory::Registration,
                    "neuron_registered",
                    Some(&self.config.organization_npi),
                    Some(json!({
                        "registration_id": response.registration_id,
                        "organization_npi": self.config.organization_npi,
                    })),
                ) {
                    warn!("Failed to audit neuron registration: {}", e);
                }
                self.health.write(HealthStatus::Healthy, None)?;
                info!(
                    registration_id = %response.registration_id,
                    "Registered with directory"
                );
            }
            Err(e) => {
                warn!(
                    "Initial directory registration failed, continuing degraded: {}",
                    e
                );
                let state = self.state.write().await;
                self.store.save(&state)?;
                self.health.write(HealthStatus::Degraded, None)?;
            }
        }

        Ok(())
    }

    /// Best-effort re-registration of persisted providers after a restart.
    async fn reregister_providers(&self) {
        let registration_id = match self.state.read().await.registration_id.clone() {
            Some(id) => id,
            None => return,
        };
        let providers = match self.store.providers() {
            Ok(p) => p,
            Err(e) => {
                warn!("Failed to load persisted providers: {}", e);
                return;
            }
        };

        for provider in providers {
            match self
                .client
                .register_provider(&registration_id, &provider.provider_npi)
                .await
            {
                Ok(response) => {
                    debug!(provider_npi = %provider.provider_npi, "Provider re-registered");
                    let _ = self.store.upsert_provider(&ProviderRegistration {
                        provider_npi: provider.provider_npi,
                        directory_provider_id: Some(response.provider_id),
                        registration_status: ProviderStatus::Registered,
                        first_registered_at: provider.first_registered_at,
                    });
                }
                Err(e) => {
                    // Non-fatal on restart; the provider stays persisted.
                    warn!(
                        provider_npi = %provider.provider_npi,
                        "Provider re-registration failed: {}", e
                    );
                }
            }
        }
    }

    /// Spawn the heartbeat loop. Runs until the shutdown signal fires.
    pub fn spawn_heartbeat(
        self: &Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                interval_secs = service.config.heartbeat_interval.as_secs(),
                "Heartbeat task started"
            );
            let mut attempt: u32 = 0;
            loop {
                let delay = if attempt == 0 {
                    service.config.heartbeat_interval
                } else {
                    full_jitter(attempt, service.config.backoff_ceiling)
                };
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.recv() => {
                        info!("Heartbeat task stopping");
                        return;
                    }
                }
                match service.beat().await {
                    BeatOutcome::Ok | BeatOutcome::Skipped => attempt = 0,
                    BeatOutcome::Failed => attempt = attempt.saturating_add(1),
                }
            }
        })
    }

    async fn beat(&self) -> BeatOutcome {
        let (status, registration_id, last_heartbeat) = {
            let state = self.state.read().await;
            (
                state.status,
                state.registration_id.clone(),
                state.last_heartbeat_at.clone(),
            )
        };

        // Never registered: nothing to keep warm, and the heartbeat does not
        // retry initial registration.
        let registration_id = match (status, registration_id) {
            (RegistrationStatus::Unregistered, _) | (_, None) => return BeatOutcome::Skipped,
            (_, Some(id)) => id,
        };

        let update = EndpointUpdate {
            endpoint_url: self.config.endpoint_url.clone(),
        };
        match self.client.update_endpoint(&registration_id, &update).await {
            Ok(()) => {
                let now = now_rfc3339();
                let recovered = status == RegistrationStatus::Degraded;
                {
                    let mut state = self.state.write().await;
                    state.status = RegistrationStatus::Registered;
                    state.last_heartbeat_at = Some(now.clone());
                    state.last_directory_response_at = Some(now.clone());
                    if let Err(e) = self.store.save(&state) {
                        warn!("Failed to persist heartbeat state: {}", e);
                    }
                }
                if let Err(e) = self.health.write(HealthStatus::Healthy, Some(&now)) {
                    warn!("Failed to write health artifact: {}", e);
                }
                if recovered {
                    info!("Directory heartbeat recovered");
                    let _ = self.audit.append(
                        AuditCategory::Sync,
                        "heartbeat_recovered",
                        None,
                        None,
                    );
                }
                BeatOutcome::Ok
            }
            Err(e) => {
                warn!("Directory heartbeat failed: {}", e);
                let newly_degraded = status == RegistrationStatus::Registered;
                {
                    let mut state = self.state.write().await;
                    state.status = RegistrationStatus::Degraded;
                    if let Err(e) = self.store.save(&state) {
                        warn!("Failed to persist degraded state: {}", e);
                    }
                }
                if let Err(we) = self
                    .health
                    .write(HealthStatus::Degraded, last_heartbeat.as_deref())
                {
                    warn!("Failed to write health artifact: {}", we);
                }
                if newly_degraded {
                    let _ = self.audit.append(
                        AuditCategory::Sync,
                        "heartbeat_degraded",
                        None,
                        Some(json!({ "error": e.to_string() })),
                    );
                }
                BeatOutcome::Failed
            }
        }
    }

    /// Register a provider with the directory and persist the result.
    pub async fn add_provider(
        &self,
        provider_npi: &str,
    ) -> std::result::Result<ProviderRegistration, ProviderError> {
        if !npi::is_valid_npi(provider_npi) {
            return Err(ProviderError::InvalidNpi(provider_npi.to_string()));
        }
        let registration_id = self
            .state
            .read()
            .await
            .registration_id
            .clone()
            .ok_or(ProviderError::NotRegistered)?;

        match self
            .client
            .register_provider(&registration_id, provider_npi)
            .await
        {
            Ok(response) => {
                let provider = ProviderRegistration {
                    provider_npi: provider_npi.to_string(),
                    directory_provider_id: Some(response.provider_id),
                    registration_status: ProviderStatus::Registered,
                    first_registered_at: Some(now_rfc3339()),
                };
                self.store.upsert_provider(&provider)?;
                if let Err(e) = self.audit.append(
                    AuditCategory::Registration,
                    "provider_registered",
                    Some(&self.config.organization_npi),
                    Some(json!({
                        "provider_npi": provider_npi,
                        "directory_provider_id": provider.directory_provider_id,
                    })),
                ) {
                    warn!("Failed to audit provider registration: {}", e);
                }
                info!(provider_npi = %provider_npi, "Provider registered");
                Ok(provider)
            }
            Err(e) => {
                let _ = self.store.upsert_provider(&ProviderRegistration {
                    provider_npi: provider_npi.to_string(),
                    directory_provider_id: None,
                    registration_status: ProviderStatus::Failed,
                    first_registered_at: None,
                });
                Err(ProviderError::Directory(e))
            }
        }
    }

    /// Remove a provider from the directory and the local store.
    pub async fn remove_provider(
        &self,
        provider_npi: &str,
    ) -> std::result::Result<(), ProviderError> {
        let registration_id = self.state.read().await.registration_id.clone();

        if let Some(registration_id) = registration_id {
            match self
                .client
                .remove_provider(&registration_id, provider_npi)
                .await
            {
                Ok(()) => {}
                // The directory not knowing the provider is fine; local
                // cleanup still proceeds.
                Err(e) if e.status_code() == Some(404) => {}
                Err(e) => return Err(ProviderError::Directory(e)),
            }
        }

        let removed = self.store.remove_provider(provider_npi)?;
        if !removed {
            return Err(ProviderError::Storage(NeuronError::NotFound(
                provider_npi.to_string(),
            )));
        }
        if let Err(e) = self.audit.append(
            AuditCategory::Registration,
            "provider_removed",
            Some(&self.config.organization_npi),
            Some(json!({ "provider_npi": provider_npi })),
        ) {
            warn!("Failed to audit provider removal: {}", e);
        }
        info!(provider_npi = %provider_npi, "Provider removed");
        Ok(())
    }

    /// Look up another neuron in the national registry.
    pub async fn lookup_by_npi(
        &self,
        npi: &str,
    ) -> std::result::Result<Option<crate::directory::DirectoryListing>, DirectoryError> {
        self.client.lookup_by_npi(npi).await
    }

    /// Search the national registry.
    pub async fn search(
        &self,
        query: &str,
    ) -> std::result::Result<Vec<crate::directory::DirectoryListing>, DirectoryError> {
        self.client.search(query).await
    }

    pub fn providers(&self) -> Result<Vec<ProviderRegistration>> {
        self.store.providers()
    }

    pub async fn status(&self) -> RegistrationStatus {
        self.state.read().await.status
    }

    pub async fn summary(&self) -> RegistrationSummary {
        RegistrationSummary::from_state(&*self.state.read().await)
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Pre-jitter backoff cap for the Nth consecutive failure:
/// `min(base * 2^attempt, ceiling)`. Non-decreasing in `attempt`.
fn backoff_cap(attempt: u32, ceiling: Duration) -> Duration {
    let exp_ms = (BACKOFF_BASE.as_millis() as u64).saturating_mul(2u64.saturating_pow(attempt));
    Duration::from_millis(exp_ms.min(ceiling.as_millis() as u64))
}

/// Full-jitter delay: uniform in `[0, backoff_cap]`.
fn full_jitter(attempt: u32, ceiling: Duration) -> Duration {
    let cap_ms = backoff_cap(attempt, ceiling).as_millis() as u64;
    if cap_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=cap_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_cap_is_monotonic_and_capped() {
        let ceiling = Duration::from_secs(300);
        let mut last = Duration::ZERO;
        for attempt in 0..40 {
            let cap = backoff_cap(attempt, ceiling);
            assert!(cap >= last, "cap decreased at attempt {}", attempt);
            assert!(cap <= ceiling);
            last = cap;
        }
        assert_eq!(last, ceiling);
    }

    #[test]
    fn full_jitter_stays_within_the_cap() {
        let ceiling = Duration::from_secs(300);
        for attempt in 0..20 {
            let delay = full_jitter(attempt, ceiling);
            assert!(delay <= backoff_cap(attempt, ceiling));
        }
    }

    #[test]
    fn summary_never_carries_the_bearer_token() {
        let state = RegistrationState {
            organization_npi: "1234567893".into(),
            organization_name: "Test Clinic".into(),
            organization_type: "clinic".into(),
            directory_url: "http://d".into(),
            neuron_endpoint_url: "ws://n".into(),
            registration_id: Some("reg-1".into()),
            bearer_token: Some("super-secret-token".into()),
            status: RegistrationStatus::Registered,
            first_registered_at: None,
            last_heartbeat_at: None,
            last_directory_response_at: None,
        };
        let summary = RegistrationSummary::from_state(&state);
        let rendered = serde_json::to_string(&summary).unwrap();
        assert!(!rendered.contains("super-secret-token"));
        assert!(!rendered.contains("bearer"));
        assert!(rendered.contains("reg-1"));
    }

    fn service() -> (tempfile::TempDir, Arc<RegistrationService>) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let audit = Arc::new(AuditLog::open(dir.path().join("audit.ndjson")).unwrap());
        let health = Arc::new(HealthFile::new(dir.path().join("health.json")));
        let service = Arc::new(RegistrationService::new(
            RegistrationConfig {
                organization_npi: "1234567893".into(),
                organization_name: "Test Clinic".into(),
                organization_type: "clinic".into(),
                // Unroutable; nothing in these tests may reach the network.
                directory_url: "http://127.0.0.1:1".into(),
                endpoint_url: "ws://localhost:8080/ws/handshake".into(),
                heartbeat_interval: Duration::from_secs(60),
                backoff_ceiling: Duration::from_secs(300),
            },
            db,
            audit,
            health,
        ));
        (dir, service)
    }

    #[tokio::test]
    async fn unregistered_beat_is_skipped() {
        let (_dir, service) = service();
        assert!(matches!(service.beat().await, BeatOutcome::Skipped));
    }

    #[tokio::test]
    async fn add_provider_requires_registration() {
        let (_dir, service) = service();
        let err = service.add_provider("1679576722").await.unwrap_err();
        assert!(matches!(err, ProviderError::NotRegistered));
    }

    #[tokio::test]
    async fn add_provider_validates_npi() {
        let (_dir, service) = service();
        let err = service.add_provider("not-an-npi").await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidNpi(_)));
    }
}
