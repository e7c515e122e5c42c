// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP client for the forge build agent service.
//!
//! This is the coordinator's stub for the agent contract. Every method is a
//! synchronous remote call; a transport failure means "agent currently
//! unreachable" and is typed separately from API-level refusals so that
//! discovery filtering can swallow it while claim/dispatch propagate it.

use std::time::Duration;

use forge_types::{
    AgentStatus, ArchiveDecodeError, BuildParams, BuildReport, ResultArchive, ResultType,
    ShutdownParams,
};
use reqwest::StatusCode;
use thiserror::Error;

/// Default timeout for short agent calls (status, claim, output polls).
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Agent client errors.
#[derive(Debug, Error)]
pub enum AgentClientError {
    /// The agent could not be reached or the call failed in flight.
    #[error("agent transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The agent refused because it is (already) claimed or building. On a
    /// claim this is a lost race; on a dispatch it means another
    /// coordinator got there between our claim and our dispatch.
    #[error("agent is busy")]
    Busy,

    /// Any other non-success response from the agent.
    #[error("agent returned {status}: {message}")]
    Api { status: StatusCode, message: String },

    /// The result archive payload could not be decoded.
    #[error(transparent)]
    Decode(#[from] ArchiveDecodeError),
}

impl AgentClientError {
    /// True when the failure is at the transport layer (agent unreachable),
    /// as opposed to the agent actively refusing.
    pub fn is_transport(&self) -> bool {
        matches!(self, AgentClientError::Transport(_))
    }
}

/// Client stub for one build agent.
#[derive(Debug, Clone)]
pub struct AgentClient {
    /// Client for short calls, bounded by `DEFAULT_TIMEOUT_SECS`.
    client: reqwest::Client,
    /// Client for the build dispatch call, which runs as long as the build.
    build_client: reqwest::Client,
    base_url: String,
}

impl AgentClient {
    /// Create a client for the agent at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Result<Self, AgentClientError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;
        // No overall timeout: the dispatch call completes when the build
        // does. Connection establishment is still bounded.
        let build_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            build_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// The base URL this client talks to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch the agent's identity and busy flag, freshly.
    pub async fn status(&self) -> Result<AgentStatus, AgentClientError> {
        let response = self
            .client
            .get(format!("{}/status", self.base_url))
            .send()
            .await?;
        let response = check(response).await?;
        Ok(response.json().await?)
    }

    /// Claim the agent. [`AgentClientError::Busy`] on a lost race.
    pub async fn claim(&self) -> Result<(), AgentClientError> {
        let response = self
            .client
            .post(format!("{}/claim", self.base_url))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    /// Dispatch a build and wait for it to finish. [`AgentClientError::Busy`]
    /// when the agent is not ours after all (claim race); callers treat that
    /// as retryable, not fatal.
    pub async fn run_build(&self, params: &BuildParams) -> Result<BuildReport, AgentClientError> {
        let response = self
            .build_client
            .post(format!("{}/builds", self.base_url))
            .json(params)
            .send()
            .await?;
        let response = check(response).await?;
        Ok(response.json().await?)
    }

    /// Current live-output session id.
    pub async fn output_id(&self) -> Result<String, AgentClientError> {
        let response = self
            .client
            .get(format!("{}/output/id", self.base_url))
            .send()
            .await?;
        let response = check(response).await?;
        Ok(response.json().await?)
    }

    /// Buffered output lines starting at `first_line` (capped; empty past
    /// the end of the buffer).
    pub async fn retrieve_lines(&self, first_line: usize) -> Result<Vec<String>, AgentClientError> {
        let response = self
            .client
            .get(format!("{}/output/lines", self.base_url))
            .query(&[("first_line", first_line.to_string())])
            .send()
            .await?;
        let response = check(response).await?;
        Ok(response.json().await?)
    }

    /// Fetch a result set as raw zip bytes; `None` when the build left
    /// nothing to transfer for this result type.
    pub async fn retrieve_results(
        &self,
        result_type: ResultType,
    ) -> Result<Option<Vec<u8>>, AgentClientError> {
        let response = self
            .client
            .get(format!("{}/results/{}", self.base_url, result_type))
            .send()
            .await?;
        let response = check(response).await?;
        let archive: ResultArchive = response.json().await?;
        Ok(archive.decode()?)
    }

    /// Delete agent-side result files and release the claim.
    pub async fn clear_output_files(&self) -> Result<(), AgentClientError> {
        let response = self
            .client
            .post(format!("{}/output/clear", self.base_url))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    /// Shut the agent down.
    pub async fn kill(&self, wait_for_build_to_finish: bool) -> Result<(), AgentClientError> {
        self.shutdown("kill", wait_for_build_to_finish).await
    }

    /// Restart the agent.
    pub async fn restart(&self, wait_for_build_to_finish: bool) -> Result<(), AgentClientError> {
        self.shutdown("restart", wait_for_build_to_finish).await
    }

    async fn shutdown(
        &self,
        operation: &str,
        wait_for_build_to_finish: bool,
    ) -> Result<(), AgentClientError> {
        let response = self
            .client
            .post(format!("{}/{}", self.base_url, operation))
            .json(&ShutdownParams {
                wait_for_build_to_finish,
            })
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, AgentClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::CONFLICT {
        return Err(AgentClientError::Busy);
    }
    let message = response.text().await.unwrap_or_default();
    Err(AgentClientError::Api { status, message })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn claim_conflict_maps_to_busy() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/claim"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;

        let client = AgentClient::new(server.uri()).unwrap();
        let err = client.claim().await.unwrap_err();
        assert!(matches!(err, AgentClientError::Busy));
        assert!(!err.is_transport());
    }

    #[tokio::test]
    async fn unreachable_agent_is_a_transport_error() {
        let client = AgentClient::new("http://127.0.0.1:1").unwrap();
        let err = client.status().await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn retrieve_results_decodes_absent_archive() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/results/logs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "result_type": "logs",
                "exists": false,
                "zip_base64": null,
            })))
            .mount(&server)
            .await;

        let client = AgentClient::new(server.uri()).unwrap();
        let bytes = client.retrieve_results(ResultType::Logs).await.unwrap();
        assert_eq!(bytes, None);
    }
}
