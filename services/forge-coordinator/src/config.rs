// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Coordinator configuration

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use forge_locator::LocatorConfig;

/// Default wait for an agent to become claimable (seconds)
const DEFAULT_AGENT_WAIT_SECS: u64 = 300;

/// Default interval between live-output polls (milliseconds)
const DEFAULT_TAIL_INTERVAL_MS: u64 = 2000;

/// Default long-poll wait used by registry watchers (seconds)
const DEFAULT_EVENT_POLL_SECS: u64 = 30;

/// Coordinator configuration
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Attribute template agents must match, `;`-delimited `name=value`
    /// pairs; empty matches every build agent
    pub search_entries: String,
    /// Directory retrieved build logs are unpacked into
    pub master_log_dir: PathBuf,
    /// Directory retrieved output artifacts are unpacked into
    pub master_output_dir: PathBuf,
    /// Agent-side log directory override, passed through with the dispatch
    pub agent_log_dir: Option<String>,
    /// Agent-side output directory override, passed through with the
    /// dispatch
    pub agent_output_dir: Option<String>,
    /// How long to wait for a claimable agent before giving up
    pub agent_wait: Duration,
    /// Interval between live-output polls while a build runs
    pub tail_interval: Duration,
    /// Long-poll wait used by registry watchers
    pub event_poll_wait: Duration,
    /// Explicitly configured registry base URLs (comma-separated in the
    /// environment), merged with whatever multicast location finds
    pub registry_urls: Vec<String>,
    /// Multicast group probed for registries
    pub multicast_group: Ipv4Addr,
    /// UDP port of the locator protocol
    pub multicast_port: u16,
    /// Whether to locate registries via multicast at all
    pub multicast_enabled: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            search_entries: String::new(),
            master_log_dir: PathBuf::from("logs"),
            master_output_dir: PathBuf::from("output"),
            agent_log_dir: None,
            agent_output_dir: None,
            agent_wait: Duration::from_secs(DEFAULT_AGENT_WAIT_SECS),
            tail_interval: Duration::from_millis(DEFAULT_TAIL_INTERVAL_MS),
            event_poll_wait: Duration::from_secs(DEFAULT_EVENT_POLL_SECS),
            registry_urls: Vec::new(),
            multicast_group: forge_locator::DEFAULT_GROUP,
            multicast_port: forge_locator::DEFAULT_PORT,
            multicast_enabled: true,
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let search_entries = std::env::var("SEARCH_ENTRIES").unwrap_or_default();

        let master_log_dir = std::env::var("MASTER_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.master_log_dir);

        let master_output_dir = std::env::var("MASTER_OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.master_output_dir);

        let agent_log_dir = std::env::var("AGENT_LOG_DIR").ok();
        let agent_output_dir = std::env::var("AGENT_OUTPUT_DIR").ok();

        let agent_wait = std::env::var("AGENT_WAIT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.agent_wait);

        let tail_interval = std::env::var("TAIL_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.tail_interval);

        let event_poll_wait = std::env::var("EVENT_POLL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.event_poll_wait);

        let registry_urls = std::env::var("REGISTRY_URLS")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let multicast_group = std::env::var("MULTICAST_GROUP")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.multicast_group);

        let multicast_port = std::env::var("MULTICAST_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.multicast_port);

        let multicast_enabled = std::env::var("MULTICAST_ENABLED")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.multicast_enabled);

        Self {
            search_entries,
            master_log_dir,
            master_output_dir,
            agent_log_dir,
            agent_output_dir,
            agent_wait,
            tail_interval,
            event_poll_wait,
            registry_urls,
            multicast_group,
            multicast_port,
            multicast_enabled,
        }
    }

    /// Where a retrieved result set is unpacked on the coordinator side
    pub fn master_dir(&self, result_type: forge_types::ResultType) -> &PathBuf {
        match result_type {
            forge_types::ResultType::Logs => &self.master_log_dir,
            forge_types::ResultType::Output => &self.master_output_dir,
        }
    }

    /// Locator settings for registry discovery
    pub fn locator_config(&self) -> LocatorConfig {
        LocatorConfig {
            group: self.multicast_group,
            port: self.multicast_port,
            multicast_enabled: self.multicast_enabled,
            unicast_registries: self.registry_urls.clone(),
            ..LocatorConfig::default()
        }
    }
}
