// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Forge Agent Service
//!
//! The build agent runs on worker machines and executes builds dispatched
//! by a forge coordinator. It:
//!
//! - Locates registries via multicast and keeps itself registered
//! - Accepts a claim so only one coordinator dispatches to it at a time
//! - Runs one build at a time, buffering console output for live tailing
//! - Packages build logs/output into zip archives for retrieval
//!
//! A restart request makes the process exit with a distinct code; the
//! supervisor (smf, systemd, a wrapper script) is expected to start it
//! again.

use std::sync::Arc;

use anyhow::{Context, Result};
use dropshot::{ConfigDropshot, ConfigLogging, ConfigLoggingLevel, HttpServerStarter};
use forge_types::PendingAction;
use tracing::info;

use forge_agent::ForgeAgentImpl;
use forge_agent::config::AgentConfig;
use forge_agent::context::ApiContext;
use forge_agent::executor::CommandExecutor;
use forge_agent::registration;

/// Default bind address for the HTTP server.
const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:7980";

/// Default maximum request body size (bytes).
const DEFAULT_BODY_MAX_BYTES: usize = 1024 * 1024;

/// Exit code the supervisor interprets as "start me again".
const EXIT_CODE_RESTART: i32 = 2;

fn print_version() {
    let version = env!("CARGO_PKG_VERSION");
    let name = env!("CARGO_PKG_NAME");
    let buildstamp = option_env!("STAMP").unwrap_or("no-STAMP");
    println!("{} {} ({})", name, version, buildstamp);
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --version and --help
    let args: Vec<String> = std::env::args().collect();
    #[allow(clippy::never_loop)] // Intentional: early return on first recognized arg
    for arg in &args[1..] {
        match arg.as_str() {
            "-V" | "--version" => {
                print_version();
                return Ok(());
            }
            "-h" | "--help" => {
                print_version();
                println!("Usage: {} [OPTIONS]", args[0]);
                println!();
                println!("Options:");
                println!("  -h, --help       Display this information");
                println!("  -V, --version    Display the program's version number");
                println!();
                println!("Environment variables:");
                println!(
                    "  BIND_ADDRESS       Server bind address (default: {})",
                    DEFAULT_BIND_ADDRESS
                );
                println!("  DATA_DIR           Data directory (default: /var/tmp/forge-agent)");
                println!("  BUILD_COMMAND      Program run for each build (default: make)");
                println!("  WORK_DIR           Working directory for builds (default: DATA_DIR)");
                println!("  AGENT_ENTRIES      Advertised entries, e.g. 'build.type=nightly'");
                println!("  PUBLIC_URL         Base URL to advertise (default: derived from hostname)");
                println!("  REGISTRY_URLS      Comma-separated registry URLs (besides multicast)");
                println!("  MULTICAST_GROUP    Locator multicast group (default: 239.77.97.1)");
                println!("  MULTICAST_PORT     Locator UDP port (default: 7970)");
                println!("  MULTICAST_ENABLED  Locate registries via multicast (default: true)");
                println!(
                    "  RUST_LOG           Log filter (default: forge_agent=info,dropshot=info)"
                );
                return Ok(());
            }
            _ => {
                eprintln!("Unknown option: {}", arg);
                std::process::exit(1);
            }
        }
    }

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "forge_agent=info,dropshot=info".to_string()),
        ))
        .init();

    print_version();

    // Load configuration
    let config = AgentConfig::from_env();
    info!("Data directory: {}", config.data_dir.display());

    // Ensure data directory exists
    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to create data directory: {}",
                config.data_dir.display()
            )
        })?;

    let bind_address: std::net::SocketAddr = std::env::var("BIND_ADDRESS")
        .unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string())
        .parse()
        .context("Invalid BIND_ADDRESS")?;

    // Create API context
    let executor = Arc::new(CommandExecutor::new(
        config.build_command.clone(),
        config.effective_work_dir(),
    ));
    let api_context = ApiContext::new(config.clone(), executor);

    // Get API description from the trait implementation
    let api = forge_agent_api::forge_agent_api_mod::api_description::<ForgeAgentImpl>()
        .map_err(|e| anyhow::anyhow!("Failed to create API description: {}", e))?;

    let config_dropshot = ConfigDropshot {
        bind_address,
        default_request_body_max_bytes: DEFAULT_BODY_MAX_BYTES,
        default_handler_task_mode: dropshot::HandlerTaskMode::Detached,
        ..Default::default()
    };

    let config_logging = ConfigLogging::StderrTerminal {
        level: ConfigLoggingLevel::Info,
    };

    let log = config_logging
        .to_logger("forge-agent")
        .map_err(|error| anyhow::anyhow!("failed to create logger: {}", error))?;

    // Start the server
    let server = HttpServerStarter::new(&config_dropshot, api, api_context.clone(), &log)
        .map_err(|error| anyhow::anyhow!("failed to create server: {}", error))?
        .start();

    info!("Forge agent running on http://{}", bind_address);

    // Advertise ourselves with every registry the locator finds.
    let public_url = match &config.public_url {
        Some(url) => url.clone(),
        None => format!("http://{}:{}", api_context.machine_name(), bind_address.port()),
    };
    let agent_registration = registration::build_registration(
        api_context.machine_name(),
        &public_url,
        &config.entries,
    )
    .context("Invalid AGENT_ENTRIES")?;
    info!(
        service_id = %agent_registration.service_id,
        %public_url,
        "agent advertisement prepared"
    );
    let registration_handle = registration::spawn_registration(
        config.locator_config(),
        agent_registration,
    );

    let mut shutdown = api_context.shutdown_watch();
    tokio::pin!(server);
    tokio::select! {
        result = &mut server => {
            result.map_err(|error| anyhow::anyhow!("server failed: {}", error))
        }
        _ = shutdown.changed() => {
            let action = *shutdown.borrow();
            registration_handle.deregister_all().await;
            // Let the kill/restart handler's 204 flush before the process
            // exits.
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            match action {
                PendingAction::Restart => {
                    info!("agent restarting");
                    std::process::exit(EXIT_CODE_RESTART);
                }
                _ => {
                    info!("agent shut down");
                    std::process::exit(0);
                }
            }
        }
    }
}
