// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Agent discovery: a cache of registered build agents, kept current by
//! watching every located registry's event stream.
//!
//! The cache answers "which agents exist" only. Whether an agent is free is
//! always asked of the agent itself, freshly, because the busy flag on the
//! agent is the sole source of truth for "claimed".
//!
//! An agent advertised by several registries stays cached until every one
//! of those registries drops it; losing one registry (or one registry's
//! reset) never evicts an agent another registry still vouches for.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use forge_agent_client::{AgentClient, AgentClientError};
use forge_locator::LocatorConfig;
use forge_registry_client::{RegistryClient, RegistryClientError};
use forge_types::{
    AttributeEntry, EventBatch, RegistryEventKind, ServiceId, ServiceKind, template_matches,
};
use thiserror::Error;
use tokio::sync::{Mutex, Notify, RwLock, mpsc, watch};
use tracing::{debug, info, warn};

use crate::availability::agent_available;

/// Backoff bounds for a failing registry watcher.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(15);

/// Consecutive poll failures before a registry's advertisements are dropped
/// from the cache. The watcher keeps retrying afterwards; a registry that
/// comes back resyncs from scratch.
const FAILURES_BEFORE_EVICT: u32 = 4;

/// How often a blocked claim attempt re-checks agents even without a cache
/// change. A busy agent becoming free emits no registry event.
const CLAIM_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Discovery failures that are not "nothing found".
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// An agent actively rejected a claim with something other than "busy".
    #[error("claim of agent {agent} failed: {source}")]
    Claim {
        agent: String,
        source: AgentClientError,
    },

    /// A direct registry call (not the background watching) failed.
    #[error("registry call failed: {0}")]
    Registry(#[from] RegistryClientError),
}

/// A build agent as the cache knows it.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredAgent {
    pub service_id: ServiceId,
    pub machine_name: String,
    pub base_url: String,
    pub attributes: Vec<AttributeEntry>,
}

/// A successfully claimed agent, ready for dispatch.
pub struct ClaimedAgent {
    pub agent: DiscoveredAgent,
    pub client: AgentClient,
}

struct CacheEntry {
    agent: DiscoveredAgent,
    /// Registries currently advertising this service, by base URL.
    registries: HashSet<String>,
}

struct DiscoveryInner {
    template: Vec<AttributeEntry>,
    event_poll_wait: Duration,
    cache: RwLock<HashMap<ServiceId, CacheEntry>>,
    /// Woken whenever the cache contents change.
    cache_changed: Notify,
    /// Serializes find-and-claim so concurrent builds on this coordinator
    /// never race each other for the same idle agent.
    claim_lock: Mutex<()>,
    registries: Mutex<HashMap<String, RegistryClient>>,
    shutdown_tx: watch::Sender<bool>,
}

/// Discovery client: locates registries, watches their event streams, and
/// hands out claimed agents.
#[derive(Clone)]
pub struct DiscoveryClient {
    inner: Arc<DiscoveryInner>,
}

impl DiscoveryClient {
    /// Start discovery. `template` restricts which agents this client will
    /// ever return; an empty template means every build agent.
    pub fn new(
        locator: LocatorConfig,
        template: Vec<AttributeEntry>,
        event_poll_wait: Duration,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let client = Self {
            inner: Arc::new(DiscoveryInner {
                template,
                event_poll_wait,
                cache: RwLock::new(HashMap::new()),
                cache_changed: Notify::new(),
                claim_lock: Mutex::new(()),
                registries: Mutex::new(HashMap::new()),
                shutdown_tx,
            }),
        };
        client.spawn_registry_intake(locator);
        client
    }

    /// Feed located registries into per-registry watcher tasks.
    fn spawn_registry_intake(&self, locator: LocatorConfig) {
        let inner = self.inner.clone();
        let mut shutdown = inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let (found_tx, mut found_rx) = mpsc::channel(16);
            let _locator = forge_locator::spawn_locator(locator, found_tx);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                    found = found_rx.recv() => {
                        let Some(registry_url) = found else { return };
                        match RegistryClient::new(&registry_url) {
                            Ok(client) => {
                                info!(%registry_url, "watching registry");
                                inner
                                    .registries
                                    .lock()
                                    .await
                                    .insert(registry_url.clone(), client.clone());
                                tokio::spawn(watch_registry(inner.clone(), client, registry_url));
                            }
                            Err(error) => {
                                warn!(%registry_url, %error, "could not build registry client");
                            }
                        }
                    }
                }
            }
        });
    }

    /// Snapshot of cached agents matching this client's template.
    async fn matching_agents(&self) -> Vec<DiscoveredAgent> {
        let cache = self.inner.cache.read().await;
        cache
            .values()
            .filter(|entry| template_matches(&self.inner.template, &entry.agent.attributes))
            .map(|entry| entry.agent.clone())
            .collect()
    }

    /// Agents matching this client's template, waiting up to `wait` for at
    /// least one to be discovered. Empty after the timeout, never an error.
    pub async fn find_all(&self, wait: Duration) -> Vec<DiscoveredAgent> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.inner.cache_changed.notified();
            let agents = self.matching_agents().await;
            if !agents.is_empty() {
                return agents;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return Vec::new(),
            }
        }
    }

    /// First matching agent that also answers its status call as not busy,
    /// waiting up to `wait`. `None` after the timeout.
    pub async fn find_one_available(&self, wait: Duration) -> Option<DiscoveredAgent> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.inner.cache_changed.notified();
            if let Some(agent) = self.find_available().await.into_iter().next() {
                return Some(agent);
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(CLAIM_RETRY_INTERVAL) => {}
                _ = tokio::time::sleep_until(deadline) => return None,
            }
        }
    }

    /// Matching agents that also answer their status call as not busy.
    /// Unreachable agents are filtered out, never an error.
    pub async fn find_available(&self) -> Vec<DiscoveredAgent> {
        let mut available = Vec::new();
        for agent in self.matching_agents().await {
            match AgentClient::new(&agent.base_url) {
                Ok(client) => {
                    if agent_available(&client).await {
                        available.push(agent);
                    }
                }
                Err(error) => {
                    warn!(agent = %agent.base_url, %error, "could not build agent client");
                }
            }
        }
        available
    }

    /// Find an available agent and claim it, atomically with respect to
    /// other claim attempts through this client. `Ok(None)` when no cached
    /// agent could be claimed right now.
    pub async fn find_and_claim(&self) -> Result<Option<ClaimedAgent>, DiscoveryError> {
        let _guard = self.inner.claim_lock.lock().await;
        for agent in self.matching_agents().await {
            let client = match AgentClient::new(&agent.base_url) {
                Ok(client) => client,
                Err(error) => {
                    warn!(agent = %agent.base_url, %error, "could not build agent client");
                    continue;
                }
            };
            if !agent_available(&client).await {
                continue;
            }
            match client.claim().await {
                Ok(()) => {
                    info!(
                        machine_name = %agent.machine_name,
                        base_url = %agent.base_url,
                        "claimed build agent"
                    );
                    return Ok(Some(ClaimedAgent { agent, client }));
                }
                Err(AgentClientError::Busy) => {
                    // Someone else got there between our status check and
                    // the claim.
                    debug!(agent = %agent.base_url, "lost claim race; trying next agent");
                }
                Err(error) if error.is_transport() => {
                    debug!(agent = %agent.base_url, %error, "agent became unreachable mid-claim");
                }
                Err(source) => {
                    return Err(DiscoveryError::Claim {
                        agent: agent.base_url.clone(),
                        source,
                    });
                }
            }
        }
        Ok(None)
    }

    /// Like [`find_and_claim`](Self::find_and_claim), but waits up to
    /// `timeout` for an agent to appear or become free.
    pub async fn wait_and_claim(
        &self,
        timeout: Duration,
    ) -> Result<Option<ClaimedAgent>, DiscoveryError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.cache_changed.notified();
            if let Some(claimed) = self.find_and_claim().await? {
                return Ok(Some(claimed));
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(CLAIM_RETRY_INTERVAL) => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    /// Base URLs of every registry currently being watched.
    pub async fn known_registries(&self) -> Vec<String> {
        self.inner.registries.lock().await.keys().cloned().collect()
    }

    /// Administratively shut down one registry.
    pub async fn destroy_registry(&self, registry_url: &str) -> Result<(), DiscoveryError> {
        let existing = self.inner.registries.lock().await.get(registry_url).cloned();
        let client = match existing {
            Some(client) => client,
            None => RegistryClient::new(registry_url)?,
        };
        client.destroy().await?;
        Ok(())
    }

    /// Stop all background watching.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
    }
}

/// Poll cursor and failure bookkeeping for one registry watcher.
struct WatchState {
    after_seq: u64,
    consecutive_failures: u32,
    backoff: Duration,
}

impl WatchState {
    fn new() -> Self {
        Self {
            after_seq: 0,
            consecutive_failures: 0,
            backoff: INITIAL_BACKOFF,
        }
    }

    fn record_success(&mut self, next_seq: u64) {
        self.after_seq = next_seq;
        self.consecutive_failures = 0;
        self.backoff = INITIAL_BACKOFF;
    }

    /// Count one failed poll. True exactly when this failure crosses the
    /// eviction threshold; the cursor rewinds to zero so a registry that
    /// comes back answers with a full replay or reset snapshot.
    fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        let evict = self.consecutive_failures == FAILURES_BEFORE_EVICT;
        if evict {
            self.after_seq = 0;
        }
        evict
    }

    fn next_backoff(&mut self) -> Duration {
        let delay = self.backoff;
        self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
        delay
    }
}

/// One registry's watcher: long-polls its event stream and folds every
/// batch into the cache. Starts from sequence zero, which the registry
/// answers with either a full replay or a reset snapshot.
async fn watch_registry(
    inner: Arc<DiscoveryInner>,
    client: RegistryClient,
    registry_url: String,
) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    let mut state = WatchState::new();
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            result = client.poll_events(state.after_seq, inner.event_poll_wait) => match result {
                Ok(batch) => {
                    state.record_success(inner.apply_batch(&registry_url, batch).await);
                }
                Err(error) => {
                    debug!(
                        %registry_url,
                        %error,
                        failures = state.consecutive_failures + 1,
                        "registry event poll failed"
                    );
                    if state.record_failure() {
                        warn!(%registry_url, "registry unresponsive; dropping its advertisements");
                        inner.drop_registry_attributions(&registry_url).await;
                    }
                    tokio::time::sleep(state.next_backoff()).await;
                }
            }
        }
    }
}

impl DiscoveryInner {
    /// Fold one event batch into the cache; returns the new cursor.
    async fn apply_batch(&self, registry_url: &str, batch: EventBatch) -> u64 {
        let mut cache = self.cache.write().await;
        if batch.reset {
            // The batch is this registry's whole current view; everything
            // it previously vouched for is re-established below or gone.
            for entry in cache.values_mut() {
                entry.registries.remove(registry_url);
            }
        }
        for event in batch.events {
            match event.body {
                RegistryEventKind::Added(reg) | RegistryEventKind::Changed(reg) => {
                    if reg.kind != ServiceKind::BuildAgent {
                        continue;
                    }
                    let entry = cache.entry(reg.service_id).or_insert_with(|| CacheEntry {
                        agent: DiscoveredAgent {
                            service_id: reg.service_id,
                            machine_name: String::new(),
                            base_url: String::new(),
                            attributes: Vec::new(),
                        },
                        registries: HashSet::new(),
                    });
                    entry.agent.machine_name = reg.machine_name;
                    entry.agent.base_url = reg.base_url;
                    entry.agent.attributes = reg.attributes;
                    entry.registries.insert(registry_url.to_string());
                }
                RegistryEventKind::Removed { service_id } => {
                    if let Some(entry) = cache.get_mut(&service_id) {
                        entry.registries.remove(registry_url);
                    }
                }
            }
        }
        cache.retain(|_, entry| !entry.registries.is_empty());
        drop(cache);
        self.cache_changed.notify_waiters();
        batch.next_seq
    }

    /// Forget everything one registry advertised, keeping agents other
    /// registries still vouch for.
    async fn drop_registry_attributions(&self, registry_url: &str) {
        let mut cache = self.cache.write().await;
        for entry in cache.values_mut() {
            entry.registries.remove(registry_url);
        }
        cache.retain(|_, entry| !entry.registries.is_empty());
        drop(cache);
        self.cache_changed.notify_waiters();
    }
}
