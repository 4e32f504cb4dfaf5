//! In-process announce/lookup: transports created from one directory see each other.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{AnnounceLookup, PeerFound};
use crate::error::Result;
use crate::events::Notifier;

/// Shared registry of announcements.
#[derive(Debug, Clone, Default)]
pub struct MemoryDirectory {
    records: Arc<Mutex<Vec<PeerFound>>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport on the loopback address.
    pub fn transport(&self) -> MemoryTransport {
        self.transport_at(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    pub fn transport_at(&self, host: IpAddr) -> MemoryTransport {
        MemoryTransport {
            directory: self.clone(),
            host,
            found: Notifier::new(),
        }
    }

    pub fn records(&self) -> Vec<PeerFound> {
        self.records.lock().clone()
    }
}

/// Lookups are answered from the directory, including the issuer's own
/// records, the way real announce/lookup primitives tend to echo.
pub struct MemoryTransport {
    directory: MemoryDirectory,
    host: IpAddr,
    found: Notifier<PeerFound>,
}

impl AnnounceLookup for MemoryTransport {
    fn announce(&self, key: &str, port: u16) -> Result<()> {
        let record = PeerFound {
            key: key.to_string(),
            host: self.host,
            port,
        };
        let mut records = self.directory.records.lock();
        if !records.contains(&record) {
            records.push(record);
        }
        Ok(())
    }

    fn unannounce(&self, key: &str, port: u16) -> Result<()> {
        self.directory
            .records
            .lock()
            .retain(|r| !(r.key == key && r.host == self.host && r.port == port));
        Ok(())
    }

    fn lookup(&self, key: &str) -> Result<()> {
        let matches: Vec<PeerFound> = self
            .directory
            .records
            .lock()
            .iter()
            .filter(|r| r.key == key)
            .cloned()
            .collect();
        for record in matches {
            self.found.emit(record);
        }
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<PeerFound> {
        self.found.subscribe()
    }

    fn local_host(&self) -> IpAddr {
        self.host
    }
}
