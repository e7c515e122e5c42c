// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Registry configuration

use std::net::Ipv4Addr;
use std::time::Duration;

use forge_locator::LocatorConfig;

/// Default lease duration granted to registrations (seconds)
const DEFAULT_LEASE_SECS: u64 = 30;

/// Default number of change events retained for long-pollers
const DEFAULT_EVENT_WINDOW: usize = 4096;

/// Registry configuration
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Lease duration granted to registrations, in seconds
    pub lease_secs: u64,
    /// How many change events to retain; pollers further behind than this
    /// receive a reset snapshot instead of a replay
    pub event_window: usize,
    /// Externally reachable base URL to advertise; derived from the local
    /// hostname and bind port when unset
    pub public_url: Option<String>,
    /// Multicast group answered for locator probes
    pub multicast_group: Ipv4Addr,
    /// UDP port of the locator protocol
    pub multicast_port: u16,
    /// Whether to participate in multicast location at all
    pub multicast_enabled: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            lease_secs: DEFAULT_LEASE_SECS,
            event_window: DEFAULT_EVENT_WINDOW,
            public_url: None,
            multicast_group: forge_locator::DEFAULT_GROUP,
            multicast_port: forge_locator::DEFAULT_PORT,
            multicast_enabled: true,
        }
    }
}

impl RegistryConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let lease_secs = std::env::var("LEASE_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.lease_secs);

        let event_window = std::env::var("EVENT_WINDOW")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.event_window);

        let public_url = std::env::var("PUBLIC_URL").ok();

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
            lease_secs,
            event_window,
            public_url,
            multicast_group,
            multicast_port,
            multicast_enabled,
        }
    }

    /// Lease duration as a [`Duration`]
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    /// Locator settings for the probe responder
    pub fn locator_config(&self) -> LocatorConfig {
        LocatorConfig {
            group: self.multicast_group,
            port: self.multicast_port,
            multicast_enabled: self.multicast_enabled,
            ..LocatorConfig::default()
        }
    }
}
