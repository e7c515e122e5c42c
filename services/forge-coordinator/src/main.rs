// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Forge Coordinator
//!
//! One-shot distributed build driver. It locates registries, waits for a
//! free build agent matching the configured template, dispatches the
//! requested module build to it, mirrors the build's console output into
//! its own log, and unpacks the retrieved logs/output locally.
//!
//! Exits zero only when the remote build ran and succeeded.

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use tracing::{error, info};

use forge_coordinator::build::{BuildRequest, DistributedBuild};
use forge_coordinator::config::CoordinatorConfig;
use forge_coordinator::discovery::DiscoveryClient;

fn print_version() {
    let version = env!("CARGO_PKG_VERSION");
    let name = env!("CARGO_PKG_NAME");
    let buildstamp = option_env!("STAMP").unwrap_or("no-STAMP");
    println!("{} {} ({})", name, version, buildstamp);
}

fn print_help(program: &str) {
    print_version();
    println!("Usage: {} [OPTIONS] MODULE [TARGET]", program);
    println!();
    println!("Options:");
    println!("  -h, --help       Display this information");
    println!("  -V, --version    Display the program's version number");
    println!();
    println!("Environment variables:");
    println!("  SEARCH_ENTRIES     Agent template, e.g. 'build.type=nightly'");
    println!("  PROJECT_PROPERTIES Properties passed to the build, 'k=v;k2=v2'");
    println!("  MASTER_LOG_DIR     Where retrieved logs unpack (default: logs)");
    println!("  MASTER_OUTPUT_DIR  Where retrieved output unpacks (default: output)");
    println!("  AGENT_LOG_DIR      Agent-side log directory override");
    println!("  AGENT_OUTPUT_DIR   Agent-side output directory override");
    println!("  AGENT_WAIT_SECS    Wait for a free agent (default: 300)");
    println!("  TAIL_INTERVAL_MS   Live output poll interval (default: 2000)");
    println!("  REGISTRY_URLS      Comma-separated registry URLs (besides multicast)");
    println!("  MULTICAST_GROUP    Locator multicast group (default: 239.77.97.1)");
    println!("  MULTICAST_PORT     Locator UDP port (default: 7970)");
    println!("  MULTICAST_ENABLED  Locate registries via multicast (default: true)");
    println!("  RUST_LOG           Log filter (default: forge_coordinator=info,build_output=info)");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let mut positional: Vec<&String> = Vec::new();
    for arg in &args[1..] {
        match arg.as_str() {
            "-V" | "--version" => {
                print_version();
                return Ok(());
            }
            "-h" | "--help" => {
                print_help(&args[0]);
                return Ok(());
            }
            other if other.starts_with('-') => {
                eprintln!("Unknown option: {}", other);
                std::process::exit(1);
            }
            _ => positional.push(arg),
        }
    }

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "forge_coordinator=info,build_output=info".to_string()),
        ))
        .init();

    let (module, override_target) = match positional.as_slice() {
        [module] => (module.to_string(), None),
        [module, target] => (module.to_string(), Some(target.to_string())),
        _ => {
            print_help(&args[0]);
            bail!("expected MODULE [TARGET]");
        }
    };

    // Load configuration
    let config = CoordinatorConfig::from_env();
    let template = forge_types::parse_attribute_entries(&config.search_entries)
        .context("Invalid SEARCH_ENTRIES")?;

    let project_properties: BTreeMap<String, String> = forge_types::parse_attribute_entries(
        &std::env::var("PROJECT_PROPERTIES").unwrap_or_default(),
    )
    .context("Invalid PROJECT_PROPERTIES")?
    .into_iter()
    .map(|entry| (entry.name, entry.value))
    .collect();

    info!(%module, target = ?override_target, "starting distributed build");

    let discovery = DiscoveryClient::new(
        config.locator_config(),
        template,
        config.event_poll_wait,
    );
    let builder = DistributedBuild::new(config, discovery.clone());

    let result = builder
        .run(BuildRequest {
            module,
            override_target,
            project_properties,
        })
        .await;
    discovery.shutdown();

    let report = result.context("distributed build failed")?;
    info!(
        module = %report.module,
        succeeded = report.succeeded,
        duration_ms = report.duration_ms,
        summary = %report.summary,
        "distributed build complete"
    );
    if !report.succeeded {
        error!(module = %report.module, "remote build failed");
        std::process::exit(1);
    }
    Ok(())
}
