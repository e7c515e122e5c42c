// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Forge Registry Service
//!
//! Directory service for forge build agents. It:
//!
//! - Accepts agent registrations and expires them when leases lapse
//! - Serves table snapshots and long-polled change events to coordinators
//! - Answers multicast locator probes with its own base URL

use anyhow::{Context, Result};
use dropshot::{ConfigDropshot, ConfigLogging, ConfigLoggingLevel, HttpServerStarter};
use tracing::{info, warn};

use forge_registry::ForgeRegistryImpl;
use forge_registry::config::RegistryConfig;
use forge_registry::context::ApiContext;

/// Default bind address for the HTTP server.
const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:7971";

/// Default maximum request body size (bytes). Registrations are tiny.
const DEFAULT_BODY_MAX_BYTES: usize = 1024 * 1024;

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
                println!("  PUBLIC_URL         Base URL to advertise (default: derived from hostname)");
                println!("  LEASE_SECS         Registration lease duration (default: 30)");
                println!("  EVENT_WINDOW       Retained change events (default: 4096)");
                println!("  MULTICAST_GROUP    Locator multicast group (default: 239.77.97.1)");
                println!("  MULTICAST_PORT     Locator UDP port (default: 7970)");
                println!("  MULTICAST_ENABLED  Answer locator probes (default: true)");
                println!(
                    "  RUST_LOG           Log filter (default: forge_registry=info,dropshot=info)"
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
                .unwrap_or_else(|_| "forge_registry=info,dropshot=info".to_string()),
        ))
        .init();

    print_version();

    // Load configuration
    let config = RegistryConfig::from_env();

    let bind_address: std::net::SocketAddr = std::env::var("BIND_ADDRESS")
        .unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string())
        .parse()
        .context("Invalid BIND_ADDRESS")?;

    // What we tell the network; the bind address itself may be a wildcard.
    let public_url = match &config.public_url {
        Some(url) => url.clone(),
        None => {
            let host = hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "localhost".to_string());
            format!("http://{}:{}", host, bind_address.port())
        }
    };
    info!(%public_url, lease_secs = config.lease_secs, "registry configuration");

    // Create API context
    let api_context = ApiContext::new(config.clone());

    // Get API description from the trait implementation
    let api = forge_registry_api::forge_registry_api_mod::api_description::<ForgeRegistryImpl>()
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
        .to_logger("forge-registry")
        .map_err(|error| anyhow::anyhow!("failed to create logger: {}", error))?;

    // Start the server
    let server = HttpServerStarter::new(&config_dropshot, api, api_context.clone(), &log)
        .map_err(|error| anyhow::anyhow!("failed to create server: {}", error))?
        .start();

    info!("Forge registry running on http://{}", bind_address);

    // Background work: lease expiry and locator presence.
    let _sweeper = api_context.start_lease_sweeper();
    let locator_config = config.locator_config();
    if locator_config.multicast_enabled {
        tokio::spawn(forge_locator::respond_to_probes(
            locator_config.clone(),
            public_url.clone(),
            api_context.shutdown_watch(),
        ));
        if let Err(error) = forge_locator::announce_once(&locator_config, &public_url).await {
            warn!(%error, "startup announcement failed");
        }
    }

    let mut shutdown = api_context.shutdown_watch();
    tokio::pin!(server);
    tokio::select! {
        result = &mut server => {
            result.map_err(|error| anyhow::anyhow!("server failed: {}", error))
        }
        _ = shutdown.changed() => {
            // Let the destroy handler's 204 flush before the process exits.
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            info!("registry destroyed");
            Ok(())
        }
    }
}
