//! Peer discovery: find devices sharing the discovery key, query their
//! installer lists, and track what they offer until it expires.
//!
//! One timer task owns every deadline (entry TTLs and the emit throttle) and
//! keeps running after `stop` so tracked entries still expire. Peer queries
//! are independent tasks, at most one per list URL.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use peer_upgrade_core::{
    parse_installer_list, short_hash, AvailableInstaller, InstallerDescriptor, InstallerTracker,
    ServiceState, Throttle, DEFAULT_PEER_TTL,
};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::events::Notifier;
use crate::storage::{not_found_stream, ByteStream};
use crate::transport::{AnnounceLookup, PeerFound};

pub const DEFAULT_EMIT_THROTTLE: Duration = Duration::from_millis(5000);
pub const DEFAULT_LOOKUP_INTERVAL: Duration = Duration::from_millis(2000);
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Only devices announcing the same key are queried.
    pub discovery_key: String,
    pub installer_emit_throttle: Duration,
    pub lookup_interval: Duration,
    pub peer_ttl: Duration,
    /// Bound on one installer-list request.
    pub query_timeout: Duration,
}

impl DiscoveryOptions {
    pub fn new(discovery_key: impl Into<String>) -> Self {
        Self {
            discovery_key: discovery_key.into(),
            installer_emit_throttle: DEFAULT_EMIT_THROTTLE,
            lookup_interval: DEFAULT_LOOKUP_INTERVAL,
            peer_ttl: DEFAULT_PEER_TTL,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}

/// Route a peer serves its installer list on.
pub fn list_url(peer: SocketAddr) -> String {
    format!("http://{peer}/installers")
}

struct DiscoveryState {
    lifecycle: ServiceState,
    port: u16,
    tracker: InstallerTracker,
    throttle: Throttle,
    /// `host:port` of peers that answered since the last start, in answer order.
    checked: Vec<String>,
    in_flight: HashSet<String>,
    tasks: Vec<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
}

struct Shared {
    options: DiscoveryOptions,
    transport: Arc<dyn AnnounceLookup>,
    client: reqwest::Client,
    state: Mutex<DiscoveryState>,
    wake: Notify,
    installers: Notifier<Vec<AvailableInstaller>>,
    checked: Notifier<Vec<String>>,
}

pub struct PeerDiscovery {
    shared: Arc<Shared>,
}

impl PeerDiscovery {
    pub fn new(options: DiscoveryOptions, transport: Arc<dyn AnnounceLookup>) -> Result<Self> {
        if options.discovery_key.is_empty() {
            return Err(Error::Config("discovery key must not be empty".to_string()));
        }
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(5))
            .tcp_keepalive(Duration::from_secs(1))
            .connect_timeout(options.query_timeout)
            .build()?;
        let state = DiscoveryState {
            lifecycle: ServiceState::Stopped,
            port: 0,
            tracker: InstallerTracker::new(options.peer_ttl),
            throttle: Throttle::new(options.installer_emit_throttle),
            checked: Vec::new(),
            in_flight: HashSet::new(),
            tasks: Vec::new(),
            timer: None,
        };
        Ok(Self {
            shared: Arc::new(Shared {
                options,
                transport,
                client,
                state: Mutex::new(state),
                wake: Notify::new(),
                installers: Notifier::new(),
                checked: Notifier::new(),
            }),
        })
    }

    /// Announce `port` under the discovery key and begin periodic lookups.
    /// A no-op unless stopped. Must be called inside a runtime.
    pub fn start(&self, port: u16) -> Result<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        if !state.lifecycle.can_start() {
            debug!(state = ?state.lifecycle, "discovery already started");
            return Ok(());
        }
        state.lifecycle = ServiceState::Starting;
        if let Err(e) = shared.transport.announce(&shared.options.discovery_key, port) {
            state.lifecycle = ServiceState::Stopped;
            return Err(e);
        }
        state.port = port;
        let peers = shared.transport.subscribe();
        state.tasks.push(tokio::spawn(watch_peers(shared.clone(), peers)));
        state.tasks.push(tokio::spawn(lookup_loop(shared.clone())));
        if state.timer.is_none() {
            state.timer = Some(tokio::spawn(run_timers(shared.clone())));
        }
        state.lifecycle = ServiceState::Running;
        info!(port, key = %shared.options.discovery_key, "discovery started");
        Ok(())
    }

    /// Withdraw the announcement and stop looking up. Tracked installers are
    /// kept and expire on their own; a pending throttled notification is
    /// delivered before this returns.
    pub fn stop(&self) -> Result<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        if !state.lifecycle.can_stop() {
            return Ok(());
        }
        state.lifecycle = ServiceState::Stopping;
        for task in state.tasks.drain(..) {
            task.abort();
        }
        state.checked.clear();
        state.in_flight.clear();
        let result = shared
            .transport
            .unannounce(&shared.options.discovery_key, state.port);
        if state.throttle.flush() {
            shared.installers.emit(state.tracker.snapshot());
        }
        state.lifecycle = ServiceState::Stopped;
        info!("discovery stopped");
        result
    }

    pub fn state(&self) -> ServiceState {
        self.shared.state.lock().lifecycle
    }

    pub fn options(&self) -> &DiscoveryOptions {
        &self.shared.options
    }

    /// Installers currently offered by peers, ordered by hash.
    pub fn installers(&self) -> Vec<AvailableInstaller> {
        self.shared.state.lock().tracker.snapshot()
    }

    pub fn checked_peers(&self) -> Vec<String> {
        self.shared.state.lock().checked.clone()
    }

    /// Throttled: bursts of changes arrive as one snapshot.
    pub fn subscribe_installers(&self) -> mpsc::UnboundedReceiver<Vec<AvailableInstaller>> {
        self.shared.installers.subscribe()
    }

    /// Emitted the first time each peer answers after a start.
    pub fn subscribe_checked(&self) -> mpsc::UnboundedReceiver<Vec<String>> {
        self.shared.checked.subscribe()
    }

    /// Stream a tracked installer from the peer offering it. A failure at any
    /// point evicts the entry. Untracked hashes yield a single `NotFound`.
    pub fn create_read_stream(&self, hash: &str) -> ByteStream {
        let url = self
            .shared
            .state
            .lock()
            .tracker
            .get(hash)
            .map(|a| a.url.clone());
        let Some(url) = url else {
            return not_found_stream(hash);
        };
        debug!(hash = short_hash(hash), %url, "fetching installer from peer");
        let request = self.shared.client.get(url).send();
        let shared = self.shared.clone();
        let hash = hash.to_string();
        stream::once(async move { request.await?.error_for_status() })
            .map_ok(|response| response.bytes_stream())
            .try_flatten()
            .map_err(Error::from)
            .inspect_err(move |e| shared.evict(&hash, e))
            .boxed()
    }
}

impl Drop for PeerDiscovery {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        for task in state.tasks.drain(..) {
            task.abort();
        }
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }
}

impl Shared {
    fn on_peer(self: &Arc<Self>, peer: PeerFound) {
        if peer.key != self.options.discovery_key {
            return;
        }
        let addr = peer.addr();
        let url = list_url(addr);
        {
            let mut state = self.state.lock();
            if state.lifecycle != ServiceState::Running {
                return;
            }
            if peer.host == self.transport.local_host() && peer.port == state.port {
                trace!(peer = %addr, "ignoring own announcement");
                return;
            }
            if !state.in_flight.insert(url.clone()) {
                trace!(peer = %addr, "query already in flight");
                return;
            }
        }
        tokio::spawn(query_peer(self.clone(), addr, url));
    }

    async fn fetch_list(&self, url: &str) -> Result<Vec<InstallerDescriptor>> {
        let body = self
            .client
            .get(url)
            .timeout(self.options.query_timeout)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(parse_installer_list(&body)?)
    }

    fn evict(&self, hash: &str, error: &Error) {
        let mut state = self.state.lock();
        if let Some(gone) = state.tracker.remove(hash) {
            warn!(hash = short_hash(hash), peer = %gone.peer(), error = %error, "peer transfer failed; evicting");
            state.throttle.trigger(now());
            drop(state);
            self.wake.notify_one();
        }
    }

    /// Expire due entries and deliver a throttled notification if its window closed.
    fn fire_timers(&self, at: Instant) {
        let mut state = self.state.lock();
        let expired = state.tracker.expire(at);
        if !expired.is_empty() {
            for installer in &expired {
                debug!(hash = short_hash(installer.hash()), peer = %installer.peer(), "installer expired");
            }
            state.throttle.trigger(at);
        }
        if state.throttle.poll(at) {
            self.installers.emit(state.tracker.snapshot());
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let state = self.state.lock();
        match (state.tracker.next_deadline(), state.throttle.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

async fn query_peer(shared: Arc<Shared>, peer: SocketAddr, url: String) {
    let result = shared.fetch_list(&url).await;
    let at = now();
    {
        let mut state = shared.state.lock();
        state.in_flight.remove(&url);
        match result {
            Ok(list) => {
                debug!(%peer, installers = list.len(), "peer answered");
                if !list.is_empty() {
                    for installer in list {
                        state
                            .tracker
                            .refresh(AvailableInstaller::from_peer(installer, peer), at);
                    }
                    state.throttle.trigger(at);
                }
                let id = peer.to_string();
                if state.lifecycle == ServiceState::Running && !state.checked.contains(&id) {
                    state.checked.push(id);
                    shared.checked.emit(state.checked.clone());
                }
            }
            Err(e) => {
                let purged = state.tracker.purge_peer(peer);
                debug!(%peer, error = %e, purged = purged.len(), "peer query failed");
                if !purged.is_empty() {
                    state.throttle.trigger(at);
                }
            }
        }
    }
    shared.wake.notify_one();
}

async fn watch_peers(shared: Arc<Shared>, mut peers: mpsc::UnboundedReceiver<PeerFound>) {
    while let Some(peer) = peers.recv().await {
        shared.on_peer(peer);
    }
}

async fn lookup_loop(shared: Arc<Shared>) {
    let mut interval = tokio::time::interval(shared.options.lookup_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if let Err(e) = shared.transport.lookup(&shared.options.discovery_key) {
            warn!(error = %e, "peer lookup failed");
        }
    }
}

async fn run_timers(shared: Arc<Shared>) {
    loop {
        match shared.next_deadline() {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {}
                    _ = shared.wake.notified() => {}
                }
            }
            None => shared.wake.notified().await,
        }
        shared.fire_timers(now());
    }
}

/// Runtime clock, so paused-time tests drive the deadlines.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}
