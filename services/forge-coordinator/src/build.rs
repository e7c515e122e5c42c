// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Distributed build orchestration.
//!
//! One build runs as: claim an agent, dispatch, tail live output while the
//! dispatch call is in flight, retrieve both result sets, unpack them on
//! the coordinator side, and finally clear the agent (which releases the
//! claim). A build that ran and failed still goes through result retrieval;
//! its logs are the whole point. Failure to clear never fails the build -
//! it is logged and the agent's claim may remain held until an operator
//! intervenes.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use forge_agent_client::{AgentClient, AgentClientError};
use forge_types::{BuildParams, BuildReport, ResultType};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CoordinatorConfig;
use crate::discovery::{ClaimedAgent, DiscoveryClient, DiscoveryError};
use crate::remote_result::{RemoteResult, SetOnceError};
use crate::tail::OutputTailer;

/// What to build.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub module: String,
    pub override_target: Option<String>,
    pub project_properties: BTreeMap<String, String>,
}

/// Failure fetching or unpacking one result set.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error(transparent)]
    Agent(#[from] AgentClientError),

    #[error(transparent)]
    Archive(#[from] forge_archive::ArchiveError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Transfer(#[from] SetOnceError),
}

/// Why a distributed build did not produce a report.
#[derive(Debug, Error)]
pub enum DistributedBuildError {
    #[error("no build agent available within {0:?}")]
    NoAgentAvailable(Duration),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("build dispatch to agent {agent} failed: {source}")]
    DispatchFailed {
        agent: String,
        source: AgentClientError,
    },

    #[error("failed to retrieve {result_type} results from agent {agent}: {source}")]
    ResultRetrieval {
        result_type: ResultType,
        agent: String,
        source: RetrievalError,
    },
}

/// Orchestrates builds on remote agents found through discovery.
pub struct DistributedBuild {
    config: CoordinatorConfig,
    discovery: DiscoveryClient,
}

impl DistributedBuild {
    pub fn new(config: CoordinatorConfig, discovery: DiscoveryClient) -> Self {
        Self { config, discovery }
    }

    /// Run one build end to end. The returned report carries the remote
    /// build's own success flag; `Ok` means the distributed machinery
    /// worked, not that the build passed.
    pub async fn run(&self, request: BuildRequest) -> Result<BuildReport, DistributedBuildError> {
        let claimed = self
            .discovery
            .wait_and_claim(self.config.agent_wait)
            .await?
            .ok_or(DistributedBuildError::NoAgentAvailable(
                self.config.agent_wait,
            ))?;
        let agent_name = claimed.agent.machine_name.clone();
        info!(
            module = %request.module,
            agent = %agent_name,
            "dispatching build"
        );

        let params = BuildParams {
            module: request.module.clone(),
            override_target: request.override_target.clone(),
            project_properties: request.project_properties.clone(),
            agent_log_dir: self.config.agent_log_dir.clone(),
            agent_output_dir: self.config.agent_output_dir.clone(),
        };

        let tailer = spawn_tailer(
            claimed.client.clone(),
            request.module.clone(),
            self.config.tail_interval,
        );
        let dispatch = claimed.client.run_build(&params).await;
        tailer.abort();

        let report = match dispatch {
            Ok(report) => report,
            Err(source) => {
                warn!(agent = %agent_name, %source, "build dispatch failed");
                release_best_effort(&claimed.client, &agent_name).await;
                return Err(DistributedBuildError::DispatchFailed {
                    agent: agent_name,
                    source,
                });
            }
        };
        info!(
            module = %report.module,
            succeeded = report.succeeded,
            duration_ms = report.duration_ms,
            "remote build finished; retrieving results"
        );

        for result_type in [ResultType::Logs, ResultType::Output] {
            if let Err(source) = self.retrieve_result(&claimed, result_type).await {
                release_best_effort(&claimed.client, &agent_name).await;
                return Err(DistributedBuildError::ResultRetrieval {
                    result_type,
                    agent: agent_name,
                    source,
                });
            }
        }

        if let Err(error) = claimed.client.clear_output_files().await {
            warn!(
                agent = %agent_name,
                %error,
                "could not clear agent output files; its claim may remain held"
            );
        }
        Ok(report)
    }

    /// Fetch one result set and unpack it into the matching master
    /// directory. "Nothing to transfer" is a normal outcome.
    async fn retrieve_result(
        &self,
        claimed: &ClaimedAgent,
        result_type: ResultType,
    ) -> Result<(), RetrievalError> {
        let mut remote = RemoteResult::new(result_type);
        let agent_override = match result_type {
            ResultType::Logs => self.config.agent_log_dir.as_ref(),
            ResultType::Output => self.config.agent_output_dir.as_ref(),
        };
        if let Some(dir) = agent_override {
            remote.set_agent_dir(PathBuf::from(dir))?;
        }
        remote.set_master_dir(self.config.master_dir(result_type).clone())?;

        let Some(bytes) = claimed.client.retrieve_results(result_type).await? else {
            info!(result_type = %result_type, "nothing to transfer");
            return Ok(());
        };

        let master_dir = self.config.master_dir(result_type).clone();
        tokio::fs::create_dir_all(&master_dir).await?;
        let temp_path = master_dir.join(format!(".{result_type}-{}.zip", Uuid::new_v4()));
        tokio::fs::write(&temp_path, &bytes).await?;
        remote.set_temp_archive_file(temp_path.clone())?;

        let unpack_dir = master_dir.clone();
        let archive_path = temp_path.clone();
        let entries = tokio::task::spawn_blocking(move || -> Result<usize, RetrievalError> {
            let bytes = std::fs::read(&archive_path)?;
            Ok(forge_archive::unzip_to_location(&bytes, &unpack_dir)?)
        })
        .await
        .map_err(|join_error| RetrievalError::Io(std::io::Error::other(join_error)))??;
        info!(
            result_type = %result_type,
            entries,
            dir = %master_dir.display(),
            "unpacked result set"
        );

        tokio::fs::remove_file(&temp_path).await?;
        Ok(())
    }
}

/// Release an agent we cannot use after all. Best effort only.
async fn release_best_effort(client: &AgentClient, agent_name: &str) {
    if let Err(error) = client.clear_output_files().await {
        warn!(
            agent = %agent_name,
            %error,
            "could not release agent after failure; its claim may remain held"
        );
    }
}

/// Tail the agent's live output while the dispatch call is in flight,
/// logging each new console line. Polling failures are quiet; the build
/// call itself is the authority on build health.
fn spawn_tailer(client: AgentClient, module: String, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tailer = OutputTailer::new();
        loop {
            match tail_once(&client, &mut tailer).await {
                Ok(lines) => {
                    for line in lines {
                        info!(target: "build_output", module = %module, "{}", line);
                    }
                }
                Err(error) => {
                    debug!(%error, "live output poll failed");
                }
            }
            tokio::time::sleep(interval).await;
        }
    })
}

async fn tail_once(
    client: &AgentClient,
    tailer: &mut OutputTailer,
) -> Result<Vec<String>, AgentClientError> {
    let session_id = client.output_id().await?;
    let first_line = tailer.cursor(&session_id);
    let lines = client.retrieve_lines(first_line).await?;
    Ok(tailer.advance(&session_id, lines))
}
