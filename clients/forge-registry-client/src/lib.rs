// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP client for the forge agent registry service.
//!
//! One typed method per remote operation of the registry API. Transport
//! failures (connection refused, timeout, connection dropped mid-call) are
//! a distinct error variant from API-level failures so callers can treat
//! "registry unreachable" differently from "registry said no".

use std::time::Duration;

use forge_types::{AgentRegistration, EventBatch, RegistrationReply, ServiceId};
use reqwest::StatusCode;
use thiserror::Error;

/// Default timeout for plain (non-long-poll) registry calls.
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Extra slack granted to the HTTP layer on top of a long-poll's own wait.
const LONG_POLL_SLACK: Duration = Duration::from_secs(5);

/// Registry client errors.
#[derive(Debug, Error)]
pub enum RegistryClientError {
    /// The registry could not be reached or the call failed in flight.
    #[error("registry transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The registration is unknown (lease expired or never registered).
    #[error("registration not found")]
    NotFound,

    /// Any other non-success response from the registry.
    #[error("registry returned {status}: {message}")]
    Api { status: StatusCode, message: String },
}

/// Client stub for one registry.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    client: reqwest::Client,
    base_url: String,
}

impl RegistryClient {
    /// Create a client for the registry at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Result<Self, RegistryClientError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// The base URL this client talks to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Register an agent; returns the granted lease duration.
    pub async fn register(
        &self,
        registration: &AgentRegistration,
    ) -> Result<RegistrationReply, RegistryClientError> {
        let response = self
            .client
            .post(format!("{}/services", self.base_url))
            .json(registration)
            .send()
            .await?;
        let response = check(response).await?;
        Ok(response.json().await?)
    }

    /// Renew a lease, updating the advertisement if it changed.
    pub async fn renew(
        &self,
        registration: &AgentRegistration,
    ) -> Result<RegistrationReply, RegistryClientError> {
        let response = self
            .client
            .put(format!(
                "{}/services/{}",
                self.base_url, registration.service_id
            ))
            .json(registration)
            .send()
            .await?;
        let response = check(response).await?;
        Ok(response.json().await?)
    }

    /// Remove a registration.
    pub async fn deregister(&self, service_id: ServiceId) -> Result<(), RegistryClientError> {
        let response = self
            .client
            .delete(format!("{}/services/{}", self.base_url, service_id))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    /// Snapshot of the registry's current table.
    pub async fn list_services(&self) -> Result<Vec<AgentRegistration>, RegistryClientError> {
        let response = self
            .client
            .get(format!("{}/services", self.base_url))
            .send()
            .await?;
        let response = check(response).await?;
        Ok(response.json().await?)
    }

    /// Long-poll for change events past `after_seq`, waiting up to `wait`.
    pub async fn poll_events(
        &self,
        after_seq: u64,
        wait: Duration,
    ) -> Result<EventBatch, RegistryClientError> {
        let response = self
            .client
            .get(format!("{}/events", self.base_url))
            .query(&[
                ("after_seq", after_seq.to_string()),
                ("wait_millis", wait.as_millis().to_string()),
            ])
            .timeout(wait + LONG_POLL_SLACK)
            .send()
            .await?;
        let response = check(response).await?;
        Ok(response.json().await?)
    }

    /// Administrative shutdown of the registry.
    pub async fn destroy(&self) -> Result<(), RegistryClientError> {
        let response = self
            .client
            .post(format!("{}/destroy", self.base_url))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, RegistryClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(RegistryClientError::NotFound);
    }
    let message = response.text().await.unwrap_or_default();
    Err(RegistryClientError::Api { status, message })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use forge_types::ServiceKind;
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn registration() -> AgentRegistration {
        AgentRegistration {
            service_id: Uuid::new_v4(),
            kind: ServiceKind::BuildAgent,
            machine_name: "worker-1".to_string(),
            base_url: "http://worker-1:7980".to_string(),
            attributes: vec![],
        }
    }

    #[tokio::test]
    async fn register_parses_lease() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/services"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"lease_secs": 30})),
            )
            .mount(&server)
            .await;

        let client = RegistryClient::new(server.uri()).unwrap();
        let reply = client.register(&registration()).await.unwrap();
        assert_eq!(reply.lease_secs, 30);
    }

    #[tokio::test]
    async fn renew_of_expired_lease_is_not_found() {
        let server = MockServer::start().await;
        let reg = registration();
        Mock::given(method("PUT"))
            .and(path(format!("/services/{}", reg.service_id)))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = RegistryClient::new(server.uri()).unwrap();
        let err = client.renew(&reg).await.unwrap_err();
        assert!(matches!(err, RegistryClientError::NotFound));
    }

    #[tokio::test]
    async fn unreachable_registry_is_a_transport_error() {
        // Nothing listens on this port.
        let client = RegistryClient::new("http://127.0.0.1:1").unwrap();
        let err = client.list_services().await.unwrap_err();
        assert!(matches!(err, RegistryClientError::Transport(_)));
    }
}
