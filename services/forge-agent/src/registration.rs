// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Self-registration with discovered registries.
//!
//! The agent probes for registries via the locator and keeps one
//! registration task per registry it hears about. Each task registers,
//! renews at half the granted lease, and falls back to re-registering when
//! the registry forgets it (expired lease or a registry restart). A registry
//! that stays unreachable just keeps the task retrying; it costs one small
//! request per interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use forge_locator::LocatorConfig;
use forge_registry_client::{RegistryClient, RegistryClientError};
use forge_types::{AgentRegistration, AttributeEntry, AttributeParseError, ServiceId, ServiceKind};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long to wait before retrying an unreachable registry.
const RETRY_INTERVAL: Duration = Duration::from_secs(15);

/// Floor on the renewal interval, whatever lease the registry grants.
const MIN_RENEW_INTERVAL: Duration = Duration::from_secs(1);

/// Build this agent's advertisement: the user-configured entries plus the
/// built-in machine facts coordinators commonly filter on.
pub fn build_registration(
    machine_name: &str,
    base_url: &str,
    user_entries: &str,
) -> Result<AgentRegistration, AttributeParseError> {
    let mut attributes = vec![
        AttributeEntry::new("hostname", machine_name),
        AttributeEntry::new("os.name", std::env::consts::OS),
        AttributeEntry::new("os.arch", std::env::consts::ARCH),
    ];
    for entry in forge_types::parse_attribute_entries(user_entries)? {
        // User entries override the built-ins of the same name.
        attributes.retain(|existing| existing.name != entry.name);
        attributes.push(entry);
    }
    Ok(AgentRegistration {
        service_id: Uuid::new_v4(),
        kind: ServiceKind::BuildAgent,
        machine_name: machine_name.to_string(),
        base_url: base_url.to_string(),
        attributes,
    })
}

/// Handle over the registration maintenance tasks. Supports explicit
/// deregistration on clean shutdown; lease expiry covers crashes.
pub struct RegistrationHandle {
    service_id: ServiceId,
    registered: Arc<Mutex<HashMap<String, RegistryClient>>>,
}

impl RegistrationHandle {
    /// Withdraw this agent's advertisement from every registry that holds
    /// one. Best effort; a registry we cannot reach will expire the lease
    /// on its own.
    pub async fn deregister_all(&self) {
        let registered: Vec<(String, RegistryClient)> = self
            .registered
            .lock()
            .await
            .iter()
            .map(|(url, client)| (url.clone(), client.clone()))
            .collect();
        for (registry_url, client) in registered {
            match client.deregister(self.service_id).await {
                Ok(()) => info!(%registry_url, "deregistered"),
                Err(error) => {
                    debug!(%registry_url, %error, "deregistration failed; lease will expire")
                }
            }
        }
    }
}

/// Spawn the registration maintenance tasks. They run for the life of the
/// agent; the returned handle deregisters on clean shutdown.
pub fn spawn_registration(
    locator: LocatorConfig,
    registration: AgentRegistration,
) -> RegistrationHandle {
    let handle = RegistrationHandle {
        service_id: registration.service_id,
        registered: Arc::new(Mutex::new(HashMap::new())),
    };
    let registered = handle.registered.clone();
    tokio::spawn(async move {
        let (found_tx, mut found_rx) = mpsc::channel(16);
        let _locator = forge_locator::spawn_locator(locator, found_tx);
        while let Some(registry_url) = found_rx.recv().await {
            info!(%registry_url, "registry located");
            tokio::spawn(maintain_registration(
                registry_url,
                registration.clone(),
                registered.clone(),
            ));
        }
    });
    handle
}

/// Keep one registry holding a live registration for this agent.
async fn maintain_registration(
    registry_url: String,
    registration: AgentRegistration,
    registered_with: Arc<Mutex<HashMap<String, RegistryClient>>>,
) {
    let client = match RegistryClient::new(&registry_url) {
        Ok(client) => client,
        Err(error) => {
            warn!(%registry_url, %error, "could not build registry client");
            return;
        }
    };

    let mut registered = false;
    let mut renew_interval = MIN_RENEW_INTERVAL;
    loop {
        if !registered {
            match client.register(&registration).await {
                Ok(reply) => {
                    info!(%registry_url, lease_secs = reply.lease_secs, "registered with registry");
                    renew_interval = renew_interval_for(reply.lease_secs);
                    registered = true;
                    registered_with
                        .lock()
                        .await
                        .insert(registry_url.clone(), client.clone());
                }
                Err(error) => {
                    debug!(%registry_url, %error, "registration attempt failed; will retry");
                    tokio::time::sleep(RETRY_INTERVAL).await;
                    continue;
                }
            }
        }

        tokio::time::sleep(renew_interval).await;
        match client.renew(&registration).await {
            Ok(reply) => {
                renew_interval = renew_interval_for(reply.lease_secs);
            }
            Err(RegistryClientError::NotFound) => {
                // The registry forgot us (lease lapsed or it restarted).
                debug!(%registry_url, "lease gone; re-registering");
                registered = false;
            }
            Err(error) => {
                debug!(%registry_url, %error, "renewal failed; re-registering");
                registered = false;
            }
        }
    }
}

/// Renew at half the lease so a single missed renewal is survivable.
fn renew_interval_for(lease_secs: u64) -> Duration {
    Duration::from_secs(lease_secs / 2).max(MIN_RENEW_INTERVAL)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn registration_carries_builtin_and_user_entries() {
        let reg = build_registration("worker-1", "http://worker-1:7980", "build.type=nightly")
            .unwrap();
        assert_eq!(reg.kind, ServiceKind::BuildAgent);
        assert_eq!(reg.machine_name, "worker-1");
        assert!(
            reg.attributes
                .contains(&AttributeEntry::new("hostname", "worker-1"))
        );
        assert!(
            reg.attributes
                .contains(&AttributeEntry::new("build.type", "nightly"))
        );
    }

    #[test]
    fn user_entries_override_builtins() {
        let reg = build_registration("worker-1", "http://worker-1:7980", "os.name=illumos")
            .unwrap();
        let os_entries: Vec<_> = reg
            .attributes
            .iter()
            .filter(|e| e.name == "os.name")
            .collect();
        assert_eq!(os_entries.len(), 1);
        assert_eq!(os_entries[0].value, "illumos");
    }

    #[test]
    fn malformed_user_entries_are_rejected() {
        assert!(build_registration("w", "http://w:1", "no-separator").is_err());
    }

    #[test]
    fn renewal_runs_at_half_lease_with_a_floor() {
        assert_eq!(renew_interval_for(30), Duration::from_secs(15));
        assert_eq!(renew_interval_for(1), MIN_RENEW_INTERVAL);
        assert_eq!(renew_interval_for(0), MIN_RENEW_INTERVAL);
    }
}
