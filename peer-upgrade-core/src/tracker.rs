//! Installers offered by other peers, each kept alive by a TTL deadline.
//!
//! One entry per hash. Refreshing an entry replaces its deadline in place, so a
//! stale expiry can never remove a freshly inserted entry.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::installer::InstallerDescriptor;

/// Default time an unrefreshed remote installer stays available.
pub const DEFAULT_PEER_TTL: Duration = Duration::from_millis(4000);

/// An installer a peer offers, with where to fetch it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailableInstaller {
    #[serde(flatten)]
    pub installer: InstallerDescriptor,
    pub url: String,
    pub host: IpAddr,
    pub port: u16,
}

impl AvailableInstaller {
    pub fn from_peer(installer: InstallerDescriptor, peer: SocketAddr) -> Self {
        let url = format!("http://{}/installers/{}", peer, installer.hash);
        Self {
            installer,
            url,
            host: peer.ip(),
            port: peer.port(),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn hash(&self) -> &str {
        &self.installer.hash
    }
}

#[derive(Debug)]
struct Entry {
    available: AvailableInstaller,
    expires_at: Instant,
}

/// TTL arena keyed by installer hash.
#[derive(Debug)]
pub struct InstallerTracker {
    ttl: Duration,
    entries: HashMap<String, Entry>,
}

impl InstallerTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Insert or replace the entry for this hash with a fresh deadline.
    /// Returns the entry it replaced, if any.
    pub fn refresh(
        &mut self,
        available: AvailableInstaller,
        now: Instant,
    ) -> Option<AvailableInstaller> {
        let hash = available.installer.hash.clone();
        let previous = self.entries.remove(&hash).map(|e| e.available);
        self.entries.insert(
            hash,
            Entry {
                available,
                expires_at: now + self.ttl,
            },
        );
        previous
    }

    pub fn remove(&mut self, hash: &str) -> Option<AvailableInstaller> {
        self.entries.remove(hash).map(|e| e.available)
    }

    /// Drop every entry sourced from `peer`.
    pub fn purge_peer(&mut self, peer: SocketAddr) -> Vec<AvailableInstaller> {
        let hashes: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.available.peer() == peer)
            .map(|(h, _)| h.clone())
            .collect();
        hashes
            .iter()
            .filter_map(|h| self.remove(h))
            .collect()
    }

    /// Remove entries whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<AvailableInstaller> {
        let hashes: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(h, _)| h.clone())
            .collect();
        hashes
            .iter()
            .filter_map(|h| self.remove(h))
            .collect()
    }

    /// Earliest pending expiry.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|e| e.expires_at).min()
    }

    pub fn get(&self, hash: &str) -> Option<&AvailableInstaller> {
        self.entries.get(hash).map(|e| &e.available)
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.entries.contains_key(hash)
    }

    /// Current entries ordered by hash.
    pub fn snapshot(&self) -> Vec<AvailableInstaller> {
        let mut out: Vec<AvailableInstaller> =
            self.entries.values().map(|e| e.available.clone()).collect();
        out.sort_by(|a, b| a.installer.hash.cmp(&b.installer.hash));
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for InstallerTracker {
    fn default() -> Self {
        Self::new(DEFAULT_PEER_TTL)
    }
}
