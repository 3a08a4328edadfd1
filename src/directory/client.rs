//! Directory HTTP client
//!
//! Typed calls against the national directory service. Non-2xx responses
//! surface as `DirectoryError::Status` with the HTTP code; whether to retry
//! is the caller's concern (the heartbeat retries network errors and 5xx,
//! never 4xx).

use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory unreachable: {0}")]
    Network(String),

    #[error("directory returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("directory response unreadable: {0}")]
    InvalidResponse(String),
}

impl DirectoryError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            DirectoryError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// 4xx responses are permanent for a given request and never retried.
    pub fn is_client_error(&self) -> bool {
        matches!(self.status_code(), Some(code) if (400..500).contains(&code))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterNeuronRequest {
    pub organization_npi: String,
    pub organization_name: String,
    pub organization_type: String,
    pub endpoint_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterNeuronResponse {
    pub registration_id: String,
    pub bearer_token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointUpdate {
    pub endpoint_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderRegistered {
    pub provider_id: String,
}

/// Directory listing entry, as returned by lookup and search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryListing {
    pub organization_npi: String,
    pub organization_name: String,
    pub endpoint_url: String,
    #[serde(default)]
    pub providers: Vec<String>,
}

pub struct DirectoryClient {
    base_url: String,
    http: reqwest::Client,
    bearer: RwLock<Option<String>>,
}

impl DirectoryClient {
    pub fn new(base_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            bearer: RwLock::new(None),
        }
    }

    /// Install the bearer token issued at registration. Used by every later
    /// call; never logged.
    pub fn set_bearer_token(&self, token: &str) {
        *self.bearer.write().expect("bearer lock poisoned") = Some(token.to_string());
    }

    pub async fn register_neuron(
        &self,
        request: &RegisterNeuronRequest,
    ) -> Result<RegisterNeuronResponse, DirectoryError> {
        let url = format!("{}/v1/neurons", self.base_url);
        debug!(url = %url, "Registering neuron with directory");
        let response = self.send(self.http.post(&url).json(request)).await?;
        Self::read_json(response).await
    }

    pub async fn update_endpoint(
        &self,
        registration_id: &str,
        update: &EndpointUpdate,
    ) -> Result<(), DirectoryError> {
        let url = format!("{}/v1/neurons/{}/endpoint", self.base_url, registration_id);
        self.send(self.http.put(&url).json(update)).await?;
        Ok(())
    }

    pub async fn register_provider(
        &self,
        registration_id: &str,
        provider_npi: &str,
    ) -> Result<ProviderRegistered, DirectoryError> {
        let url = format!("{}/v1/neurons/{}/providers", self.base_url, registration_id);
        let body = serde_json::json!({ "provider_npi": provider_npi });
        let response = self.send(self.http.post(&url).json(&body)).await?;
        Self::read_json(response).await
    }

    pub async fn remove_provider(
        &self,
        registration_id: &str,
        provider_npi: &str,
    ) -> Result<(), DirectoryError> {
        let url = format!(
            "{}/v1/neurons/{}/providers/{}",
            self.base_url, registration_id, provider_npi
        );
        self.send(self.http.delete(&url)).await?;
        Ok(())
    }

    pub async fn lookup_by_npi(
        &self,
        npi: &str,
    ) -> Result<Option<DirectoryListing>, DirectoryError> {
        let url = format!("{}/v1/registry/{}", self.base_url, npi);
        match self.send(self.http.get(&url)).await {
            Ok(response) => Ok(Some(Self::read_json(response).await?)),
            Err(e) if e.status_code() == Some(404) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn search(&self, query: &str) -> Result<Vec<DirectoryListing>, DirectoryError> {
        let url = format!("{}/v1/registry/search", self.base_url);
        let response = self
            .send(self.http.get(&url).query(&[("q", query)]))
            .await?;
        Self::read_json(response).await
    }

    async fn send(
        &self,
        mut request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, DirectoryError> {
        if let Some(token) = self.bearer.read().expect("bearer lock poisoned").as_ref() {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DirectoryError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(DirectoryError::Status {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DirectoryError> {
        response
            .json::<T>()
            .await
            .map_err(|e| DirectoryError::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_not_retryable() {
        let e = DirectoryError::Status {
            status: 409,
            message: "conflict".into(),
        };
        assert!(e.is_client_error());
        assert_eq!(e.status_code(), Some(409));

        let e = DirectoryError::Status {
            status: 503,
            message: "unavailable".into(),
        };
        assert!(!e.is_client_error());

        let e = DirectoryError::Network("connection refused".into());
        assert!(!e.is_client_error());
        assert_eq!(e.status_code(), None);
    }

    #[test]
    fn base_url_trailing_slash_is_normalized() {
        let client = DirectoryClient::new("http://directory.example/");
        assert_eq!(client.base_url, "http://directory.example");
    }

    #[test]
    fn register_request_serializes_expected_fields() {
        let req = RegisterNeuronRequest {
            organization_npi: "1234567893".into(),
            organization_name: "Test Clinic".into(),
            organization_type: "clinic".into(),
            endpoint_url: "ws://broker.example/ws/handshake".into(),
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["organization_npi"], "1234567893");
        assert_eq!(value["endpoint_url"], "ws://broker.example/ws/handshake");
    }
}
