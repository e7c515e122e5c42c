// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Registry state: the service table, the lease sweeper and the bounded
//! change-event log that backs the long-poll endpoint.
//!
//! Every mutation of the table appends a [`RegistryEvent`] with a monotonic
//! sequence number. The log keeps the most recent `event_window` events; a
//! poller that asks for older events than that gets a `reset` batch carrying
//! the full current table, which is always a correct (if blunt) resync.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use forge_types::{AgentRegistration, EventBatch, RegistryEvent, RegistryEventKind, ServiceId};
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::RegistryConfig;

/// How often the sweeper checks for expired leases.
const SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// One live registration with its lease deadline.
struct LeaseEntry {
    registration: AgentRegistration,
    expires_at: Instant,
}

/// The service table plus the retained event log. Guarded by one mutex; all
/// operations on it are short.
struct ServiceTable {
    services: HashMap<ServiceId, LeaseEntry>,
    log: VecDeque<RegistryEvent>,
    /// Sequence number of the most recently appended event; 0 before any.
    latest_seq: u64,
}

impl ServiceTable {
    fn push_event(&mut self, window: usize, body: RegistryEventKind) {
        self.latest_seq += 1;
        self.log.push_back(RegistryEvent {
            seq: self.latest_seq,
            body,
        });
        while self.log.len() > window {
            self.log.pop_front();
        }
    }

    /// Events past `after_seq`, or `None` when there is nothing to deliver
    /// yet. A caller whose cursor falls outside the retained window gets a
    /// reset snapshot instead of a replay.
    fn batch_after(&self, after_seq: u64) -> Option<EventBatch> {
        let oldest_available = self.latest_seq - self.log.len() as u64;
        if after_seq > self.latest_seq || after_seq < oldest_available {
            let events = self
                .services
                .values()
                .map(|entry| RegistryEvent {
                    seq: self.latest_seq,
                    body: RegistryEventKind::Added(entry.registration.clone()),
                })
                .collect();
            return Some(EventBatch {
                events,
                next_seq: self.latest_seq,
                reset: true,
            });
        }
        let events: Vec<RegistryEvent> = self
            .log
            .iter()
            .filter(|event| event.seq > after_seq)
            .cloned()
            .collect();
        if events.is_empty() {
            None
        } else {
            Some(EventBatch {
                events,
                next_seq: self.latest_seq,
                reset: false,
            })
        }
    }
}

struct Inner {
    config: RegistryConfig,
    table: Mutex<ServiceTable>,
    /// Woken whenever an event is appended.
    changed: Notify,
    shutdown_tx: watch::Sender<bool>,
}

/// API context for registry request handlers
#[derive(Clone)]
pub struct ApiContext {
    inner: Arc<Inner>,
}

impl ApiContext {
    pub fn new(config: RegistryConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                table: Mutex::new(ServiceTable {
                    services: HashMap::new(),
                    log: VecDeque::new(),
                    latest_seq: 0,
                }),
                changed: Notify::new(),
                shutdown_tx,
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Register a service or, for a known id, renew it in place. Emits
    /// `Added` for new ids and `Changed` when an advertisement differs.
    pub async fn register(&self, registration: AgentRegistration) -> u64 {
        let expires_at = Instant::now() + self.inner.config.lease_duration();
        let window = self.inner.config.event_window;
        let mut table = self.inner.table.lock().await;
        if table.services.contains_key(&registration.service_id) {
            if Self::refresh_entry(&mut table.services, &registration, expires_at) {
                table.push_event(window, RegistryEventKind::Changed(registration));
                self.inner.changed.notify_waiters();
            }
        } else {
            info!(
                service_id = %registration.service_id,
                machine_name = %registration.machine_name,
                base_url = %registration.base_url,
                "service registered"
            );
            table.services.insert(
                registration.service_id,
                LeaseEntry {
                    registration: registration.clone(),
                    expires_at,
                },
            );
            table.push_event(window, RegistryEventKind::Added(registration));
            self.inner.changed.notify_waiters();
        }
        self.inner.config.lease_secs
    }

    /// Renew the lease of a known service. Returns the granted lease
    /// duration, or `None` when the id is unknown (already expired).
    pub async fn renew(&self, registration: AgentRegistration) -> Option<u64> {
        let expires_at = Instant::now() + self.inner.config.lease_duration();
        let window = self.inner.config.event_window;
        let mut table = self.inner.table.lock().await;
        if !table.services.contains_key(&registration.service_id) {
            return None;
        }
        if Self::refresh_entry(&mut table.services, &registration, expires_at) {
            table.push_event(window, RegistryEventKind::Changed(registration));
            self.inner.changed.notify_waiters();
        }
        Some(self.inner.config.lease_secs)
    }

    /// Push an existing entry's deadline out and take the new advertisement.
    /// True when the advertisement actually changed.
    fn refresh_entry(
        services: &mut HashMap<ServiceId, LeaseEntry>,
        registration: &AgentRegistration,
        expires_at: Instant,
    ) -> bool {
        let Some(entry) = services.get_mut(&registration.service_id) else {
            return false;
        };
        entry.expires_at = expires_at;
        if entry.registration != *registration {
            entry.registration = registration.clone();
            true
        } else {
            false
        }
    }

    /// Remove a registration, emitting `Removed` if it was present.
    pub async fn deregister(&self, service_id: ServiceId) {
        let mut table = self.inner.table.lock().await;
        if table.services.remove(&service_id).is_some() {
            info!(%service_id, "service deregistered");
            let window = self.inner.config.event_window;
            table.push_event(window, RegistryEventKind::Removed { service_id });
            self.inner.changed.notify_waiters();
        }
    }

    /// Snapshot of all live registrations.
    pub async fn list_services(&self) -> Vec<AgentRegistration> {
        let table = self.inner.table.lock().await;
        table
            .services
            .values()
            .map(|entry| entry.registration.clone())
            .collect()
    }

    /// Long-poll for events past `after_seq`, waiting up to `wait` for the
    /// first one. An empty batch means the wait elapsed quietly.
    pub async fn poll_events(&self, after_seq: u64, wait: Duration) -> EventBatch {
        let deadline = Instant::now() + wait;
        loop {
            // Created before the table check so a concurrent notify between
            // the check and the await is not lost.
            let notified = self.inner.changed.notified();
            {
                let table = self.inner.table.lock().await;
                if let Some(batch) = table.batch_after(after_seq) {
                    return batch;
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return EventBatch {
                    events: Vec::new(),
                    next_seq: after_seq,
                    reset: false,
                };
            }
        }
    }

    /// Drop every lease whose deadline has passed, emitting `Removed` for
    /// each. Returns how many were dropped.
    pub async fn sweep_expired_leases(&self) -> usize {
        let now = Instant::now();
        let mut table = self.inner.table.lock().await;
        let expired: Vec<ServiceId> = table
            .services
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        let window = self.inner.config.event_window;
        for service_id in &expired {
            table.services.remove(service_id);
            debug!(%service_id, "lease expired");
            table.push_event(
                window,
                RegistryEventKind::Removed {
                    service_id: *service_id,
                },
            );
        }
        if !expired.is_empty() {
            self.inner.changed.notify_waiters();
        }
        expired.len()
    }

    /// Spawn the background task that expires leases.
    pub fn start_lease_sweeper(&self) -> JoinHandle<()> {
        let context = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                context.sweep_expired_leases().await;
            }
        })
    }

    /// Flip the shutdown signal observed by `main` and the probe responder.
    pub fn request_shutdown(&self) {
        // Send only fails when nobody is watching, which is fine.
        let _ = self.inner.shutdown_tx.send(true);
    }

    pub fn shutdown_watch(&self) -> watch::Receiver<bool> {
        self.inner.shutdown_tx.subscribe()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use forge_types::ServiceKind;
    use uuid::Uuid;

    fn test_config() -> RegistryConfig {
        RegistryConfig {
            lease_secs: 30,
            event_window: 4,
            multicast_enabled: false,
            ..RegistryConfig::default()
        }
    }

    fn registration(name: &str) -> AgentRegistration {
        AgentRegistration {
            service_id: Uuid::new_v4(),
            kind: ServiceKind::BuildAgent,
            machine_name: name.to_string(),
            base_url: format!("http://{name}:7980"),
            attributes: Vec::new(),
        }
    }

    #[tokio::test]
    async fn register_then_deregister_produces_add_and_remove_events() {
        let ctx = ApiContext::new(test_config());
        let reg = registration("worker-1");
        ctx.register(reg.clone()).await;
        ctx.deregister(reg.service_id).await;

        let batch = ctx.poll_events(0, Duration::ZERO).await;
        assert!(!batch.reset);
        assert_eq!(batch.events.len(), 2);
        assert!(matches!(batch.events[0].body, RegistryEventKind::Added(_)));
        assert!(matches!(
            batch.events[1].body,
            RegistryEventKind::Removed { service_id } if service_id == reg.service_id
        ));
        assert_eq!(batch.next_seq, 2);
    }

    #[tokio::test]
    async fn reregistration_with_same_advertisement_is_silent() {
        let ctx = ApiContext::new(test_config());
        let reg = registration("worker-1");
        ctx.register(reg.clone()).await;
        ctx.register(reg.clone()).await;

        let batch = ctx.poll_events(0, Duration::ZERO).await;
        assert_eq!(batch.events.len(), 1);

        let mut changed = reg.clone();
        changed.attributes = forge_types::parse_attribute_entries("os=linux").unwrap();
        ctx.register(changed).await;
        let batch = ctx.poll_events(batch.next_seq, Duration::ZERO).await;
        assert_eq!(batch.events.len(), 1);
        assert!(matches!(batch.events[0].body, RegistryEventKind::Changed(_)));
    }

    #[tokio::test]
    async fn poller_behind_the_window_gets_a_reset_snapshot() {
        let ctx = ApiContext::new(test_config());
        let survivor = registration("survivor");
        ctx.register(survivor.clone()).await;
        // Churn enough short-lived services to push the Added of `survivor`
        // out of the 4-event window.
        for i in 0..4 {
            let reg = registration(&format!("churn-{i}"));
            ctx.register(reg.clone()).await;
            ctx.deregister(reg.service_id).await;
        }

        let batch = ctx.poll_events(0, Duration::ZERO).await;
        assert!(batch.reset);
        assert_eq!(batch.events.len(), 1);
        match &batch.events[0].body {
            RegistryEventKind::Added(reg) => assert_eq!(reg.service_id, survivor.service_id),
            other => panic!("expected Added, got {other:?}"),
        }
        assert_eq!(batch.next_seq, 9);
    }

    #[tokio::test]
    async fn poller_ahead_of_the_log_is_reset_too() {
        // A cursor from a previous registry incarnation.
        let ctx = ApiContext::new(test_config());
        let batch = ctx.poll_events(500, Duration::ZERO).await;
        assert!(batch.reset);
        assert!(batch.events.is_empty());
        assert_eq!(batch.next_seq, 0);
    }

    #[tokio::test]
    async fn poll_wakes_on_new_event() {
        let ctx = ApiContext::new(test_config());
        let poller = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.poll_events(0, Duration::from_secs(5)).await })
        };
        // Give the poller time to block.
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctx.register(registration("worker-1")).await;

        let batch = poller.await.unwrap();
        assert_eq!(batch.events.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unrenewed_lease_expires() {
        let ctx = ApiContext::new(test_config());
        let reg = registration("worker-1");
        ctx.register(reg.clone()).await;

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(ctx.sweep_expired_leases().await, 0);
        // A renewal pushes the deadline out again.
        ctx.renew(reg.clone()).await.unwrap();
        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(ctx.sweep_expired_leases().await, 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(ctx.sweep_expired_leases().await, 1);
        assert!(ctx.list_services().await.is_empty());
        assert!(ctx.renew(reg).await.is_none());
    }
}
