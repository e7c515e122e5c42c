// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Build execution.
//!
//! The [`BuildExecutor`] trait is the seam between the agent's claim/output
//! bookkeeping and whatever actually runs a build. The production
//! implementation shells out to a configured command; tests substitute a
//! scripted executor.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;

use forge_types::BuildParams;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::Command;
use tokio::sync::mpsc;

/// Name of the console log the executor leaves in the build's log directory.
pub const BUILD_LOG_NAME: &str = "build.log";

/// Infrastructure failures while running a build. A build that runs and
/// exits nonzero is not an error; that is a failed [`BuildOutcome`].
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to start build command '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("I/O error during build: {0}")]
    Io(#[from] std::io::Error),
}

/// What a completed build run amounted to.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub succeeded: bool,
    pub summary: String,
}

pub type BuildFuture = Pin<Box<dyn Future<Output = Result<BuildOutcome, ExecutorError>> + Send>>;

/// Runs one build at a time, streaming console lines into `output`.
pub trait BuildExecutor: Send + Sync {
    fn run_build(
        &self,
        params: BuildParams,
        log_dir: PathBuf,
        output_dir: PathBuf,
        output: mpsc::UnboundedSender<String>,
    ) -> BuildFuture;
}

/// Production executor: spawns the configured build command with the
/// module, target and properties conveyed via arguments and environment.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    command: String,
    work_dir: PathBuf,
}

impl CommandExecutor {
    pub fn new(command: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            work_dir: work_dir.into(),
        }
    }
}

impl BuildExecutor for CommandExecutor {
    fn run_build(
        &self,
        params: BuildParams,
        log_dir: PathBuf,
        output_dir: PathBuf,
        output: mpsc::UnboundedSender<String>,
    ) -> BuildFuture {
        let command = self.command.clone();
        let work_dir = self.work_dir.clone();
        Box::pin(async move {
            let mut cmd = Command::new(&command);
            if let Some(target) = &params.override_target {
                cmd.arg(target);
            }
            for (name, value) in &params.project_properties {
                cmd.arg(format!("-D{name}={value}"));
            }
            cmd.current_dir(&work_dir)
                .env("FORGE_MODULE", &params.module)
                .env("FORGE_LOG_DIR", &log_dir)
                .env("FORGE_OUTPUT_DIR", &output_dir)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let mut child = cmd.spawn().map_err(|source| ExecutorError::Spawn {
                command: command.clone(),
                source,
            })?;

            // Console lines go both to the live-output sink and to the log
            // file that ends up in the logs result set.
            let log_file = tokio::fs::File::create(log_dir.join(BUILD_LOG_NAME)).await?;
            let mut log_writer = BufWriter::new(log_file);

            let (line_tx, mut line_rx) = mpsc::unbounded_channel();
            let mut readers = Vec::new();
            if let Some(stdout) = child.stdout.take() {
                readers.push(tokio::spawn(forward_lines(stdout, line_tx.clone())));
            }
            if let Some(stderr) = child.stderr.take() {
                readers.push(tokio::spawn(forward_lines(stderr, line_tx.clone())));
            }
            drop(line_tx);

            while let Some(line) = line_rx.recv().await {
                log_writer.write_all(line.as_bytes()).await?;
                log_writer.write_all(b"\n").await?;
                // A dropped sink just means nobody is tailing.
                let _ = output.send(line);
            }
            log_writer.flush().await?;
            for reader in readers {
                let _ = reader.await;
            }

            let status = child.wait().await?;
            let summary = match status.code() {
                Some(code) => format!("{command} exited with status {code}"),
                None => format!("{command} terminated by signal"),
            };
            Ok(BuildOutcome {
                succeeded: status.success(),
                summary,
            })
        })
    }
}

async fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).is_err() {
            return;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn params(module: &str) -> BuildParams {
        BuildParams {
            module: module.to_string(),
            override_target: None,
            project_properties: BTreeMap::new(),
            agent_log_dir: None,
            agent_output_dir: None,
        }
    }

    async fn run(command: &str, module: &str) -> (Result<BuildOutcome, ExecutorError>, Vec<String>, TempDir) {
        let dir = TempDir::new().unwrap();
        let log_dir = dir.path().join("logs");
        let output_dir = dir.path().join("output");
        std::fs::create_dir_all(&log_dir).unwrap();
        std::fs::create_dir_all(&output_dir).unwrap();

        let executor = CommandExecutor::new(command, dir.path());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = executor
            .run_build(params(module), log_dir, output_dir, tx)
            .await;
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        (outcome, lines, dir)
    }

    #[tokio::test]
    async fn successful_command_reports_success() {
        let (outcome, _, _dir) = run("true", "mod-a").await;
        let outcome = outcome.unwrap();
        assert!(outcome.succeeded);
        assert_eq!(outcome.summary, "true exited with status 0");
    }

    #[tokio::test]
    async fn failing_command_is_a_failed_outcome_not_an_error() {
        let (outcome, _, _dir) = run("false", "mod-a").await;
        let outcome = outcome.unwrap();
        assert!(!outcome.succeeded);
    }

    #[tokio::test]
    async fn missing_command_is_a_spawn_error() {
        let (outcome, _, _dir) = run("/nonexistent/build-tool", "mod-a").await;
        assert!(matches!(
            outcome.unwrap_err(),
            ExecutorError::Spawn { .. }
        ));
    }

    #[tokio::test]
    async fn console_lines_reach_the_sink_and_the_log_file() {
        // `env` prints the environment we set up for the build.
        let (outcome, lines, dir) = run("env", "mod-a").await;
        assert!(outcome.unwrap().succeeded);
        assert!(lines.iter().any(|l| l == "FORGE_MODULE=mod-a"));

        let log = std::fs::read_to_string(dir.path().join("logs").join(BUILD_LOG_NAME)).unwrap();
        assert!(log.contains("FORGE_MODULE=mod-a"));
    }
}
