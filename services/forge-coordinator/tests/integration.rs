// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Allow expect/unwrap in tests - they provide clear panic messages on failure
#![allow(clippy::expect_used, clippy::unwrap_used)]

//! Integration tests for coordinator discovery and build orchestration.
//!
//! Each test wires up real in-process services: a registry, one or more
//! agents, and a discovery client configured with the registry's URL
//! directly (no multicast in tests). Agents run `env` as their build
//! command so builds finish fast with deterministic output.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dropshot::{ConfigDropshot, ConfigLogging, ConfigLoggingLevel, HttpServerStarter};
use forge_agent_client::AgentClient;
use forge_coordinator::build::{BuildRequest, DistributedBuild, DistributedBuildError};
use forge_coordinator::config::CoordinatorConfig;
use forge_coordinator::discovery::DiscoveryClient;
use forge_locator::LocatorConfig;
use forge_registry_client::RegistryClient;
use forge_types::{AgentRegistration, ServiceKind};
use tempfile::TempDir;
use uuid::Uuid;

// ============================================================================
// Test Infrastructure
// ============================================================================

fn dropshot_config() -> ConfigDropshot {
    ConfigDropshot {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        default_request_body_max_bytes: 10 * 1024 * 1024,
        default_handler_task_mode: dropshot::HandlerTaskMode::Detached,
        ..Default::default()
    }
}

/// Start an in-process registry; returns its base URL.
fn start_registry() -> String {
    let config = forge_registry::config::RegistryConfig {
        multicast_enabled: false,
        ..forge_registry::config::RegistryConfig::default()
    };
    let api_context = forge_registry::context::ApiContext::new(config);
    let _sweeper = api_context.start_lease_sweeper();

    let api = forge_registry_api::forge_registry_api_mod::api_description::<
        forge_registry::ForgeRegistryImpl,
    >()
    .expect("failed to create API description");

    let log = ConfigLogging::StderrTerminal {
        level: ConfigLoggingLevel::Error,
    }
    .to_logger("test-registry")
    .expect("failed to create logger");
    let server = HttpServerStarter::new(&dropshot_config(), api, api_context, &log)
        .expect("failed to create registry server")
        .start();
    let url = format!("http://{}", server.local_addr());
    std::mem::forget(server);
    url
}

/// Start an in-process agent running `env` as its build command; returns
/// its base URL. The agent does not self-register; tests register it with
/// a registry explicitly.
fn start_agent(temp_dir: &TempDir) -> String {
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

    let api = forge_agent_api::forge_agent_api_mod::api_description::<forge_agent::ForgeAgentImpl>()
        .expect("failed to create API description");

    let log = ConfigLogging::StderrTerminal {
        level: ConfigLoggingLevel::Error,
    }
    .to_logger("test-agent")
    .expect("failed to create logger");
    let server = HttpServerStarter::new(&dropshot_config(), api, api_context, &log)
        .expect("failed to create agent server")
        .start();
    let url = format!("http://{}", server.local_addr());
    std::mem::forget(server);
    url
}

/// Register an agent's advertisement with a registry.
async fn register_agent(registry_url: &str, agent_url: &str, name: &str) -> AgentRegistration {
    let registration = AgentRegistration {
        service_id: Uuid::new_v4(),
        kind: ServiceKind::BuildAgent,
        machine_name: name.to_string(),
        base_url: agent_url.to_string(),
        attributes: Vec::new(),
    };
    RegistryClient::new(registry_url)
        .unwrap()
        .register(&registration)
        .await
        .expect("registration failed");
    registration
}

/// Discovery client watching exactly one registry.
fn discovery_for(registry_url: &str) -> DiscoveryClient {
    let locator = LocatorConfig {
        multicast_enabled: false,
        unicast_registries: vec![registry_url.to_string()],
        ..LocatorConfig::default()
    };
    DiscoveryClient::new(locator, Vec::new(), Duration::from_secs(2))
}

/// Poll `check` until it passes or the deadline expires.
async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn cache_follows_registry_lifecycle() {
    let registry_url = start_registry();
    let agent_dir = TempDir::new().unwrap();
    let agent_url = start_agent(&agent_dir);

    let discovery = discovery_for(&registry_url);
    assert!(discovery.find_all(Duration::ZERO).await.is_empty());

    let registration = register_agent(&registry_url, &agent_url, "worker-1").await;
    wait_until("agent to appear in cache", || async {
        discovery.find_all(Duration::ZERO).await.len() == 1
    })
    .await;
    let agents = discovery.find_all(Duration::ZERO).await;
    assert_eq!(agents[0].machine_name, "worker-1");
    assert_eq!(agents[0].base_url, agent_url);

    assert_eq!(discovery.known_registries().await, vec![registry_url.clone()]);

    RegistryClient::new(&registry_url)
        .unwrap()
        .deregister(registration.service_id)
        .await
        .unwrap();
    wait_until("agent to leave the cache", || async {
        discovery.find_all(Duration::ZERO).await.is_empty()
    })
    .await;

    discovery.shutdown();
}

#[tokio::test]
async fn find_and_claim_skips_busy_agents() {
    let registry_url = start_registry();
    let busy_dir = TempDir::new().unwrap();
    let idle_dir = TempDir::new().unwrap();
    let busy_url = start_agent(&busy_dir);
    let idle_url = start_agent(&idle_dir);

    register_agent(&registry_url, &busy_url, "busy-worker").await;
    register_agent(&registry_url, &idle_url, "idle-worker").await;

    // Another coordinator already holds the first agent.
    AgentClient::new(&busy_url).unwrap().claim().await.unwrap();

    let discovery = discovery_for(&registry_url);
    wait_until("both agents in cache", || async {
        discovery.find_all(Duration::ZERO).await.len() == 2
    })
    .await;

    assert_eq!(discovery.find_available().await.len(), 1);
    let idle = discovery
        .find_one_available(Duration::from_secs(5))
        .await
        .expect("the idle agent should be found");
    assert_eq!(idle.machine_name, "idle-worker");

    let claimed = discovery
        .find_and_claim()
        .await
        .unwrap()
        .expect("the idle agent should be claimable");
    assert_eq!(claimed.agent.machine_name, "idle-worker");

    // Now everything is claimed; a further attempt finds nothing.
    assert!(discovery.find_and_claim().await.unwrap().is_none());
    assert!(discovery.find_available().await.is_empty());
    assert!(discovery.find_one_available(Duration::ZERO).await.is_none());

    // Releasing makes it claimable again.
    claimed.client.clear_output_files().await.unwrap();
    assert!(discovery.find_and_claim().await.unwrap().is_some());

    discovery.shutdown();
}

#[tokio::test]
async fn concurrent_claims_never_share_an_agent() {
    let registry_url = start_registry();
    let dirs: Vec<TempDir> = (0..2).map(|_| TempDir::new().unwrap()).collect();
    for (i, dir) in dirs.iter().enumerate() {
        let url = start_agent(dir);
        register_agent(&registry_url, &url, &format!("worker-{i}")).await;
    }

    let discovery = discovery_for(&registry_url);
    wait_until("both agents in cache", || async {
        discovery.find_all(Duration::ZERO).await.len() == 2
    })
    .await;

    let mut attempts = Vec::new();
    for _ in 0..4 {
        let discovery = discovery.clone();
        attempts.push(tokio::spawn(async move {
            discovery.wait_and_claim(Duration::from_secs(1)).await
        }));
    }

    let mut claimed_urls = Vec::new();
    for attempt in attempts {
        if let Some(claimed) = attempt.await.unwrap().unwrap() {
            claimed_urls.push(claimed.agent.base_url.clone());
        }
    }
    // Two agents, four contenders: exactly two wins, no agent won twice.
    claimed_urls.sort();
    claimed_urls.dedup();
    assert_eq!(claimed_urls.len(), 2);

    discovery.shutdown();
}

#[tokio::test]
async fn no_agent_available_within_wait() {
    let registry_url = start_registry();
    let discovery = discovery_for(&registry_url);
    let config = CoordinatorConfig {
        agent_wait: Duration::from_millis(300),
        multicast_enabled: false,
        ..CoordinatorConfig::default()
    };
    let builder = DistributedBuild::new(config, discovery.clone());

    let err = builder
        .run(BuildRequest {
            module: "mod-a".to_string(),
            override_target: None,
            project_properties: BTreeMap::new(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, DistributedBuildError::NoAgentAvailable(_)));

    discovery.shutdown();
}

#[tokio::test]
async fn end_to_end_distributed_build() {
    let registry_url = start_registry();
    let agent_dir = TempDir::new().unwrap();
    let agent_url = start_agent(&agent_dir);
    register_agent(&registry_url, &agent_url, "worker-1").await;

    let discovery = discovery_for(&registry_url);
    wait_until("agent in cache", || async {
        discovery.find_all(Duration::ZERO).await.len() == 1
    })
    .await;

    let master_dir = TempDir::new().unwrap();
    let config = CoordinatorConfig {
        master_log_dir: master_dir.path().join("logs"),
        master_output_dir: master_dir.path().join("output"),
        agent_wait: Duration::from_secs(5),
        tail_interval: Duration::from_millis(100),
        multicast_enabled: false,
        ..CoordinatorConfig::default()
    };
    let builder = DistributedBuild::new(config, discovery.clone());

    let report = builder
        .run(BuildRequest {
            module: "mod-a".to_string(),
            override_target: None,
            project_properties: BTreeMap::new(),
        })
        .await
        .expect("distributed build should succeed");
    assert!(report.succeeded);
    assert_eq!(report.module, "mod-a");

    // The remote build.log landed in the master log directory, and the
    // build saw the module name the coordinator sent.
    let log_text = std::fs::read_to_string(master_dir.path().join("logs").join("build.log"))
        .expect("retrieved build.log");
    assert!(log_text.contains("FORGE_MODULE=mod-a"));

    // The agent was cleared and released.
    let agent_client = AgentClient::new(&agent_url).unwrap();
    assert!(!agent_client.status().await.unwrap().busy);
    assert!(
        agent_client
            .retrieve_results(forge_types::ResultType::Logs)
            .await
            .unwrap()
            .is_none()
    );

    discovery.shutdown();
}
