// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Agent availability checks.
//!
//! Availability is always evaluated freshly against the agent itself; the
//! discovery cache only says an agent exists, never whether it is free. An
//! unreachable agent is simply unavailable - the failure is logged and
//! swallowed, never propagated out of a filtering pass.

use forge_agent_client::AgentClient;
use tracing::debug;

/// True when the agent answers its status call and is not busy.
pub async fn agent_available(client: &AgentClient) -> bool {
    match client.status().await {
        Ok(status) => !status.busy,
        Err(error) => {
            debug!(
                agent = client.base_url(),
                %error,
                "agent did not answer status; treating as unavailable"
            );
            false
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_agent_is_unavailable_not_an_error() {
        let client = AgentClient::new("http://127.0.0.1:1").unwrap();
        assert!(!agent_available(&client).await);
    }
}
