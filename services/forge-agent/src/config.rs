// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Agent configuration

use std::net::Ipv4Addr;
use std::path::PathBuf;

use forge_locator::LocatorConfig;

/// Default data directory for agent storage
const DEFAULT_DATA_DIR: &str = "/var/tmp/forge-agent";

/// Default build command when `BUILD_COMMAND` is unset
const DEFAULT_BUILD_COMMAND: &str = "make";

/// Agent configuration
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Directory for build logs, output artifacts and result archives
    pub data_dir: PathBuf,
    /// Program the build executor invokes for each build
    pub build_command: String,
    /// Working directory builds run in; defaults to the data directory
    pub work_dir: Option<PathBuf>,
    /// User-defined advertisement entries, `;`-delimited `name=value` pairs
    pub entries: String,
    /// Externally reachable base URL to advertise; derived from the local
    /// hostname and bind port when unset
    pub public_url: Option<String>,
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

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            build_command: DEFAULT_BUILD_COMMAND.to_string(),
            work_dir: None,
            entries: String::new(),
            public_url: None,
            registry_urls: Vec::new(),
            multicast_group: forge_locator::DEFAULT_GROUP,
            multicast_port: forge_locator::DEFAULT_PORT,
            multicast_enabled: true,
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let build_command =
            std::env::var("BUILD_COMMAND").unwrap_or_else(|_| defaults.build_command);

        let work_dir = std::env::var("WORK_DIR").map(PathBuf::from).ok();

        let entries = std::env::var("AGENT_ENTRIES").unwrap_or_default();

        let public_url = std::env::var("PUBLIC_URL").ok();

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
            data_dir,
            build_command,
            work_dir,
            entries,
            public_url,
            registry_urls,
            multicast_group,
            multicast_port,
            multicast_enabled,
        }
    }

    /// Default directory builds write logs into
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Default directory builds write output artifacts into
    pub fn output_dir(&self) -> PathBuf {
        self.data_dir.join("output")
    }

    /// Where the zipped result sets live between a build and its retrieval
    pub fn archive_path(&self, result_type: forge_types::ResultType) -> PathBuf {
        self.data_dir.join(format!("{result_type}.zip"))
    }

    /// Working directory for build commands
    pub fn effective_work_dir(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(|| self.data_dir.clone())
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
