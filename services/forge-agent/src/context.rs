// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Agent state: the claim flag, the build lifecycle and result archives.
//!
//! The busy flag here is the sole source of truth for "claimed". A
//! coordinator that wins the claim dispatches a build, retrieves the zipped
//! results, and finally calls clear-output-files, which deletes them and
//! releases the claim. Any kill/restart requested while claimed is deferred
//! until that release.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use forge_archive::ArchiveError;
use forge_types::{AgentStatus, BuildParams, BuildReport, PendingAction, ResultArchive, ResultType};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::executor::{BuildExecutor, ExecutorError};
use crate::output::LiveOutputBuffer;

/// The agent was already claimed by another coordinator.
#[derive(Debug, Error)]
#[error("agent is already claimed")]
pub struct AlreadyClaimedError;

/// Why a build dispatch was refused or failed.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Dispatch without a prior claim; the caller lost a claim race.
    #[error("agent is not claimed")]
    NotClaimed,

    /// A second dispatch while a build is in flight.
    #[error("a build is already in flight")]
    BuildInFlight,

    /// The build could not be run at all. The claim is released.
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// The build ran but its results could not be archived. The claim is
    /// released; there is nothing retrievable.
    #[error("failed to archive {result_type} results: {source}")]
    Archive {
        result_type: ResultType,
        source: ArchiveError,
    },
}

#[derive(Debug)]
struct AgentState {
    busy: bool,
    date_claimed: Option<SystemTime>,
    building: bool,
    module: Option<String>,
    pending: PendingAction,
    /// Directories the most recent build actually used, for clearing.
    last_log_dir: Option<PathBuf>,
    last_output_dir: Option<PathBuf>,
}

struct Inner {
    config: AgentConfig,
    machine_name: String,
    executor: Arc<dyn BuildExecutor>,
    state: Mutex<AgentState>,
    output: Mutex<LiveOutputBuffer>,
    /// Flips from `None` when the process should exit (kill or restart).
    shutdown_tx: watch::Sender<PendingAction>,
}

/// API context for agent request handlers
#[derive(Clone)]
pub struct ApiContext {
    inner: Arc<Inner>,
}

impl ApiContext {
    pub fn new(config: AgentConfig, executor: Arc<dyn BuildExecutor>) -> Self {
        let machine_name = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        let (shutdown_tx, _) = watch::channel(PendingAction::None);
        Self {
            inner: Arc::new(Inner {
                config,
                machine_name,
                executor,
                state: Mutex::new(AgentState {
                    busy: false,
                    date_claimed: None,
                    building: false,
                    module: None,
                    pending: PendingAction::None,
                    last_log_dir: None,
                    last_output_dir: None,
                }),
                output: Mutex::new(LiveOutputBuffer::new()),
                shutdown_tx,
            }),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub fn machine_name(&self) -> &str {
        &self.inner.machine_name
    }

    /// Fresh snapshot of the agent's state.
    pub async fn status(&self) -> AgentStatus {
        let state = self.inner.state.lock().await;
        AgentStatus {
            machine_name: self.inner.machine_name.clone(),
            busy: state.busy,
            module: state.module.clone(),
            pending_action: state.pending,
        }
    }

    /// Set the busy flag. Fails when another coordinator holds the claim.
    pub async fn claim(&self) -> Result<(), AlreadyClaimedError> {
        let mut state = self.inner.state.lock().await;
        if state.busy {
            return Err(AlreadyClaimedError);
        }
        state.busy = true;
        state.date_claimed = Some(SystemTime::now());
        info!("agent claimed");
        Ok(())
    }

    /// Run one build to completion. Requires a prior claim; a failure to
    /// run (as opposed to a build that ran and failed) releases the claim.
    pub async fn run_build(&self, params: BuildParams) -> Result<BuildReport, BuildError> {
        {
            let mut state = self.inner.state.lock().await;
            if !state.busy {
                return Err(BuildError::NotClaimed);
            }
            if state.building {
                return Err(BuildError::BuildInFlight);
            }
            state.building = true;
            state.module = Some(params.module.clone());
        }

        info!(module = %params.module, "build starting");
        let result = self.run_build_inner(&params).await;

        match result {
            Ok(report) => {
                let mut state = self.inner.state.lock().await;
                state.building = false;
                state.module = None;
                info!(
                    module = %report.module,
                    succeeded = report.succeeded,
                    duration_ms = report.duration_ms,
                    "build finished"
                );
                Ok(report)
            }
            Err(error) => {
                warn!(module = %params.module, %error, "build failed to run; releasing claim");
                self.release_claim().await;
                Err(error)
            }
        }
    }

    async fn run_build_inner(&self, params: &BuildParams) -> Result<BuildReport, BuildError> {
        let log_dir = params
            .agent_log_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.inner.config.log_dir());
        let output_dir = params
            .agent_output_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.inner.config.output_dir());
        tokio::fs::create_dir_all(&log_dir)
            .await
            .map_err(ExecutorError::Io)?;
        tokio::fs::create_dir_all(&output_dir)
            .await
            .map_err(ExecutorError::Io)?;

        {
            let mut state = self.inner.state.lock().await;
            state.last_log_dir = Some(log_dir.clone());
            state.last_output_dir = Some(output_dir.clone());
        }

        // Stale archives from the previous build must never be served as
        // this build's results.
        for result_type in [ResultType::Logs, ResultType::Output] {
            let path = self.inner.config.archive_path(result_type);
            if let Err(error) = tokio::fs::remove_file(&path).await
                && error.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %path.display(), %error, "could not remove stale archive");
            }
        }

        self.inner.output.lock().await.start_new_session();

        let (line_tx, mut line_rx) = mpsc::unbounded_channel();
        let output_ctx = self.clone();
        let consumer = tokio::spawn(async move {
            while let Some(line) = line_rx.recv().await {
                output_ctx.inner.output.lock().await.push_line(line);
            }
        });

        let started = Instant::now();
        let outcome = self
            .inner
            .executor
            .run_build(params.clone(), log_dir.clone(), output_dir.clone(), line_tx)
            .await?;
        let duration_ms = started.elapsed().as_millis() as u64;
        let _ = consumer.await;

        // Package the result sets for retrieval. An empty directory yields
        // no archive, which retrieval reports as "nothing to transfer".
        for (result_type, source_dir) in
            [(ResultType::Logs, &log_dir), (ResultType::Output, &output_dir)]
        {
            let archive_path = self.inner.config.archive_path(result_type);
            let source_dir = source_dir.clone();
            tokio::task::spawn_blocking(move || {
                forge_archive::zip_folder_contents(&archive_path, &source_dir)
            })
            .await
            .map_err(|join_error| ExecutorError::Io(std::io::Error::other(join_error)))?
            .map_err(|source| BuildError::Archive {
                result_type,
                source,
            })?;
        }

        Ok(BuildReport {
            module: params.module.clone(),
            target: params.override_target.clone(),
            succeeded: outcome.succeeded,
            summary: outcome.summary,
            duration_ms,
        })
    }

    /// Current live-output session id.
    pub async fn output_id(&self) -> String {
        self.inner.output.lock().await.id().to_string()
    }

    /// Buffered output lines starting at `first_line`.
    pub async fn retrieve_lines(&self, first_line: usize) -> Vec<String> {
        self.inner.output.lock().await.retrieve(first_line)
    }

    /// Load a result archive from disk. `exists` is false in the reply when
    /// the last build produced nothing for this result type.
    pub async fn retrieve_results(
        &self,
        result_type: ResultType,
    ) -> Result<ResultArchive, std::io::Error> {
        let path = self.inner.config.archive_path(result_type);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(ResultArchive::from_bytes(result_type, &bytes)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Ok(ResultArchive::absent(result_type))
            }
            Err(error) => Err(error),
        }
    }

    /// Delete result archives and build directories, then release the
    /// claim. Deletion failures are logged, never propagated: the release
    /// must happen regardless.
    pub async fn clear_output_files(&self) {
        for result_type in [ResultType::Logs, ResultType::Output] {
            let path = self.inner.config.archive_path(result_type);
            if let Err(error) = tokio::fs::remove_file(&path).await
                && error.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %path.display(), %error, "could not remove result archive");
            }
        }

        let (log_dir, output_dir) = {
            let state = self.inner.state.lock().await;
            (state.last_log_dir.clone(), state.last_output_dir.clone())
        };
        for dir in [log_dir, output_dir].into_iter().flatten() {
            if let Err(error) = tokio::fs::remove_dir_all(&dir).await
                && error.kind() != std::io::ErrorKind::NotFound
            {
                warn!(dir = %dir.display(), %error, "could not remove build directory");
            }
        }

        self.release_claim().await;
    }

    /// Clear the busy flag and execute any deferred kill/restart.
    pub async fn release_claim(&self) {
        let (pending, claimed_at) = {
            let mut state = self.inner.state.lock().await;
            state.busy = false;
            state.building = false;
            state.module = None;
            (
                std::mem::take(&mut state.pending),
                state.date_claimed.take(),
            )
        };
        let held_secs = claimed_at
            .and_then(|since| since.elapsed().ok())
            .map(|held| held.as_secs());
        info!(held_secs, "claim released");
        if pending != PendingAction::None {
            info!(action = %pending, "executing deferred shutdown");
            let _ = self.inner.shutdown_tx.send(pending);
        }
    }

    /// Shut down, now or when the claim is released.
    pub async fn kill(&self, wait_for_build_to_finish: bool) {
        self.shutdown(PendingAction::Kill, wait_for_build_to_finish)
            .await;
    }

    /// Restart, now or when the claim is released.
    pub async fn restart(&self, wait_for_build_to_finish: bool) {
        self.shutdown(PendingAction::Restart, wait_for_build_to_finish)
            .await;
    }

    async fn shutdown(&self, action: PendingAction, wait_for_build_to_finish: bool) {
        let mut state = self.inner.state.lock().await;
        if wait_for_build_to_finish && state.busy {
            info!(action = %action, "agent busy; deferring shutdown until release");
            state.pending = action;
        } else {
            info!(action = %action, "shutting down");
            let _ = self.inner.shutdown_tx.send(action);
        }
    }

    /// Observed by `main`: a value other than `None` means exit, with the
    /// restart variant mapped to the restart exit code.
    pub fn shutdown_watch(&self) -> watch::Receiver<PendingAction> {
        self.inner.shutdown_tx.subscribe()
    }
}
