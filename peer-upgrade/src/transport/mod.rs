//! Local-network announce/lookup primitive used by peer discovery.
//!
//! A transport registers `(key, port)` records for this device and, on lookup,
//! reports every device holding a record under the key as a [`PeerFound`].
//! Answers may include this device's own record.

mod memory;
mod multicast;

pub use memory::{MemoryDirectory, MemoryTransport};
pub use multicast::{MulticastTransport, DEFAULT_DISCOVERY_PORT, MULTICAST_GROUP};

use std::net::{IpAddr, SocketAddr};

use tokio::sync::mpsc;

use crate::error::Result;

/// A device answering for a discovery key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerFound {
    pub key: String,
    pub host: IpAddr,
    pub port: u16,
}

impl PeerFound {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

pub trait AnnounceLookup: Send + Sync + 'static {
    /// Advertise an installer surface for `key` on `port`.
    fn announce(&self, key: &str, port: u16) -> Result<()>;

    fn unannounce(&self, key: &str, port: u16) -> Result<()>;

    /// Ask for every device advertising `key`. Answers arrive on `subscribe`.
    fn lookup(&self, key: &str) -> Result<()>;

    fn subscribe(&self) -> mpsc::UnboundedReceiver<PeerFound>;

    /// Address other devices see this one at.
    fn local_host(&self) -> IpAddr;
}
