// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Allow expect/unwrap in tests - they provide clear panic messages on failure
#![allow(clippy::expect_used, clippy::unwrap_used)]

//! Integration tests for the forge agent HTTP API.
//!
//! Each test runs a real agent server and drives it through the typed
//! `forge-agent-client`, the same stub the coordinator uses. Builds run the
//! `env` program so they complete quickly and leave deterministic console
//! output.

use std::collections::BTreeMap;
use std::sync::Arc;

use dropshot::{ConfigDropshot, ConfigLogging, ConfigLoggingLevel, HttpServerStarter};
use forge_agent_client::{AgentClient, AgentClientError};
use forge_types::{BuildParams, PendingAction, ResultType};
use tempfile::TempDir;

// ============================================================================
// Test Infrastructure
// ============================================================================

/// Test context that holds a running agent and a typed client for it
struct TestContext {
    client: AgentClient,
    /// Temp directory for agent data (kept alive for test duration)
    _temp_dir: TempDir,
}

impl TestContext {
    /// Create a new test context with a running agent
    async fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");

        let config = forge_agent::config::AgentConfig {
            data_dir: temp_dir.path().to_path_buf(),
            build_command: "env".to_string(),
            multicast_enabled: false,
            ..forge_agent::config::AgentConfig::default()
        };

        let executor = Arc::new(forge_agent::executor::CommandExecutor::new(
            config.build_command.clone(),
            config.effective_work_dir(),
        ));
        let api_context = forge_agent::context::ApiContext::new(config, executor);

        let api = forge_agent_api::forge_agent_api_mod::api_description::<
            forge_agent::ForgeAgentImpl,
        >()
        .expect("failed to create API description");

        let config_dropshot = ConfigDropshot {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            default_request_body_max_bytes: 1024 * 1024,
            default_handler_task_mode: dropshot::HandlerTaskMode::Detached,
            ..Default::default()
        };

        let config_logging = ConfigLogging::StderrTerminal {
            level: ConfigLoggingLevel::Error,
        };
        let log = config_logging
            .to_logger("test-agent")
            .expect("failed to create logger");

        let server = HttpServerStarter::new(&config_dropshot, api, api_context, &log)
            .expect("failed to create server")
            .start();

        let agent_url = format!("http://{}", server.local_addr());

        // Leak the server handle to keep it running for the duration of the
        // test (cleaned up when the test process exits)
        std::mem::forget(server);

        let client = AgentClient::new(agent_url).expect("failed to create client");

        Self {
            client,
            _temp_dir: temp_dir,
        }
    }
}

fn build_params(module: &str) -> BuildParams {
    BuildParams {
        module: module.to_string(),
        override_target: None,
        project_properties: BTreeMap::new(),
        agent_log_dir: None,
        agent_output_dir: None,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn second_claim_conflicts() {
    let ctx = TestContext::new().await;

    assert!(!ctx.client.status().await.unwrap().busy);
    ctx.client.claim().await.unwrap();
    assert!(ctx.client.status().await.unwrap().busy);

    let err = ctx.client.claim().await.unwrap_err();
    assert!(matches!(err, AgentClientError::Busy));
}

#[tokio::test]
async fn dispatch_without_claim_is_refused() {
    let ctx = TestContext::new().await;
    let err = ctx
        .client
        .run_build(&build_params("mod-a"))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentClientError::Busy));
}

#[tokio::test]
async fn full_build_cycle() {
    let ctx = TestContext::new().await;
    ctx.client.claim().await.unwrap();

    let report = ctx.client.run_build(&build_params("mod-a")).await.unwrap();
    assert!(report.succeeded);
    assert_eq!(report.module, "mod-a");

    // The build ran `env`, so its console output includes the environment
    // the agent set up for it.
    let lines = ctx.client.retrieve_lines(0).await.unwrap();
    assert!(lines.iter().any(|l| l == "FORGE_MODULE=mod-a"));
    // Tailing past the end is empty, not an error.
    assert!(ctx.client.retrieve_lines(100_000).await.unwrap().is_empty());

    // Logs were written (build.log), output artifacts were not.
    let logs_zip = ctx
        .client
        .retrieve_results(ResultType::Logs)
        .await
        .unwrap()
        .expect("logs archive should exist");
    let unpack_dir = TempDir::new().unwrap();
    forge_archive::unzip_to_location(&logs_zip, unpack_dir.path()).unwrap();
    let log_text =
        std::fs::read_to_string(unpack_dir.path().join("build.log")).expect("build.log in archive");
    assert!(log_text.contains("FORGE_MODULE=mod-a"));

    assert!(
        ctx.client
            .retrieve_results(ResultType::Output)
            .await
            .unwrap()
            .is_none()
    );

    // Still ours until we clear; then the agent is claimable again.
    assert!(ctx.client.status().await.unwrap().busy);
    ctx.client.clear_output_files().await.unwrap();
    assert!(!ctx.client.status().await.unwrap().busy);
    assert!(
        ctx.client
            .retrieve_results(ResultType::Logs)
            .await
            .unwrap()
            .is_none()
    );
    ctx.client.claim().await.unwrap();
}

#[tokio::test]
async fn output_session_id_rotates_between_builds() {
    let ctx = TestContext::new().await;
    ctx.client.claim().await.unwrap();

    ctx.client.run_build(&build_params("mod-a")).await.unwrap();
    let first_id = ctx.client.output_id().await.unwrap();

    ctx.client.run_build(&build_params("mod-b")).await.unwrap();
    let second_id = ctx.client.output_id().await.unwrap();
    assert_ne!(first_id, second_id);
}

#[tokio::test]
async fn shutdown_while_claimed_is_deferred() {
    let ctx = TestContext::new().await;
    ctx.client.claim().await.unwrap();

    ctx.client.restart(true).await.unwrap();
    let status = ctx.client.status().await.unwrap();
    assert!(status.busy);
    assert_eq!(status.pending_action, PendingAction::Restart);
}
