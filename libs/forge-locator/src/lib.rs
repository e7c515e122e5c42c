// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! UDP-based location of forge registry services.
//!
//! Registries join a well-known multicast group and answer probe datagrams
//! with their HTTP base URL. Clients (agents registering themselves,
//! coordinators building a discovery cache) probe the group periodically and
//! feed every base URL they hear about into a channel, merged with any
//! explicitly configured unicast addresses.
//!
//! The wire format is a single line of UTF-8 per datagram:
//!
//! ```text
//! forge-registry?v1                      probe
//! forge-registry:v1 http://host:7971     response / announcement
//! ```
//!
//! New registries are picked up on the next probe cycle; there is no
//! listener on the shared group port on the client side, so clients never
//! contend with a co-located registry for the port.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Default multicast group registries listen on.
pub const DEFAULT_GROUP: Ipv4Addr = Ipv4Addr::new(239, 77, 97, 1);

/// Default UDP port for the locator protocol.
pub const DEFAULT_PORT: u16 = 7970;

const PROBE: &str = "forge-registry?v1";
const ANNOUNCE_PREFIX: &str = "forge-registry:v1 ";

/// Maximum datagram size we accept; everything in this protocol is far
/// smaller.
const MAX_DATAGRAM: usize = 512;

/// Errors from locator setup.
#[derive(Debug, Error)]
pub enum LocateError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Locator configuration shared by clients and registries.
#[derive(Debug, Clone)]
pub struct LocatorConfig {
    /// Multicast group to probe/answer on
    pub group: Ipv4Addr,
    /// UDP port of the group
    pub port: u16,
    /// Local interface address for multicast membership
    pub interface: Ipv4Addr,
    /// Whether to use multicast at all (explicit addresses still work when
    /// disabled)
    pub multicast_enabled: bool,
    /// How often clients re-probe the group
    pub probe_interval: Duration,
    /// How long to collect responses after each probe
    pub probe_window: Duration,
    /// Explicitly configured registry base URLs (unicast side channel)
    pub unicast_registries: Vec<String>,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            group: DEFAULT_GROUP,
            port: DEFAULT_PORT,
            interface: Ipv4Addr::UNSPECIFIED,
            multicast_enabled: true,
            probe_interval: Duration::from_secs(30),
            probe_window: Duration::from_secs(2),
            unicast_registries: Vec::new(),
        }
    }
}

/// A parsed locator datagram.
#[derive(Debug, PartialEq, Eq)]
enum Datagram {
    Probe,
    Announcement(String),
}

fn encode_announcement(base_url: &str) -> String {
    format!("{ANNOUNCE_PREFIX}{base_url}")
}

fn parse_datagram(bytes: &[u8]) -> Option<Datagram> {
    let text = std::str::from_utf8(bytes).ok()?.trim();
    if text == PROBE {
        return Some(Datagram::Probe);
    }
    text.strip_prefix(ANNOUNCE_PREFIX)
        .map(|url| Datagram::Announcement(url.trim().to_string()))
}

// ============================================================================
// Registry side
// ============================================================================

/// Answer locator probes with this registry's base URL until `shutdown`
/// flips to true. Run by the registry service as a background task.
pub async fn respond_to_probes(
    config: LocatorConfig,
    base_url: String,
    shutdown: watch::Receiver<bool>,
) -> Result<(), LocateError> {
    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port)).await?;
    socket.join_multicast_v4(config.group, config.interface)?;
    debug!(
        group = %config.group,
        port = config.port,
        "answering registry locator probes"
    );
    respond_on_socket(socket, base_url, shutdown).await
}

async fn respond_on_socket(
    socket: UdpSocket,
    base_url: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), LocateError> {
    let reply = encode_announcement(&base_url);
    let mut buf = [0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                // A dropped sender also means shutdown.
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            }
            recv = socket.recv_from(&mut buf) => {
                let (len, peer) = recv?;
                if parse_datagram(&buf[..len]) == Some(Datagram::Probe) {
                    trace!(%peer, "answering locator probe");
                    if let Err(error) = socket.send_to(reply.as_bytes(), peer).await {
                        warn!(%peer, %error, "failed to answer locator probe");
                    }
                }
            }
        }
    }
}

/// Announce this registry's presence to the group once (called at registry
/// startup so long-running clients hear about it before their next probe...
/// if they happen to be listening; probing clients pick it up on the next
/// cycle either way).
pub async fn announce_once(config: &LocatorConfig, base_url: &str) -> Result<(), LocateError> {
    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).await?;
    let target = SocketAddrV4::new(config.group, config.port);
    socket
        .send_to(encode_announcement(base_url).as_bytes(), target)
        .await?;
    Ok(())
}

// ============================================================================
// Client side
// ============================================================================

/// Spawn the locator task: emit every registry base URL discovered via
/// multicast probing or explicit configuration into `found_tx`, exactly once
/// each. The task ends when the receiver is dropped.
pub fn spawn_locator(config: LocatorConfig, found_tx: mpsc::Sender<String>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut seen: HashSet<String> = HashSet::new();

        for url in &config.unicast_registries {
            if seen.insert(url.clone()) && found_tx.send(url.clone()).await.is_err() {
                return;
            }
        }

        if !config.multicast_enabled {
            return;
        }

        let socket = match UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).await {
            Ok(s) => s,
            Err(error) => {
                warn!(%error, "could not bind locator probe socket; multicast discovery disabled");
                return;
            }
        };
        // Allow a registry on this same host to hear our probes.
        if let Err(error) = socket.set_multicast_loop_v4(true) {
            warn!(%error, "could not enable multicast loopback");
        }
        let target = SocketAddr::from(SocketAddrV4::new(config.group, config.port));

        loop {
            if let Err(error) =
                probe_once(&socket, target, config.probe_window, &mut seen, &found_tx).await
            {
                match error {
                    ProbeOutcome::ReceiverClosed => return,
                    ProbeOutcome::Io(error) => {
                        warn!(%error, "locator probe cycle failed");
                    }
                }
            }
            tokio::time::sleep(config.probe_interval).await;
        }
    })
}

enum ProbeOutcome {
    ReceiverClosed,
    Io(std::io::Error),
}

/// One probe cycle: send a probe, then collect announcements until the
/// window closes.
async fn probe_once(
    socket: &UdpSocket,
    target: SocketAddr,
    window: Duration,
    seen: &mut HashSet<String>,
    found_tx: &mpsc::Sender<String>,
) -> Result<(), ProbeOutcome> {
    socket
        .send_to(PROBE.as_bytes(), target)
        .await
        .map_err(ProbeOutcome::Io)?;

    let deadline = tokio::time::Instant::now() + window;
    let mut buf = [0u8; MAX_DATAGRAM];

    loop {
        let recv = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await;
        match recv {
            Err(_) => return Ok(()), // window closed
            Ok(Err(error)) => return Err(ProbeOutcome::Io(error)),
            Ok(Ok((len, peer))) => {
                if let Some(Datagram::Announcement(url)) = parse_datagram(&buf[..len]) {
                    trace!(%peer, %url, "located registry");
                    if seen.insert(url.clone()) && found_tx.send(url).await.is_err() {
                        return Err(ProbeOutcome::ReceiverClosed);
                    }
                }
            }
        }
    }
}
