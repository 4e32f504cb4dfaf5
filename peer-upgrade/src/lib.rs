//! Peer-to-peer installer upgrades over the local network.
//!
//! Devices announce an HTTP installer surface under a shared discovery key,
//! learn what newer installers their peers hold, fetch one, and only keep it
//! once its bytes hash to the advertised value.

pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod logging;
pub mod manager;
pub mod server;
pub mod storage;
pub mod transport;

pub use discovery::{DiscoveryOptions, PeerDiscovery};
pub use error::{Error, Result};
pub use manager::{ManagerOptions, UpgradeManager};
pub use server::HttpServer;
pub use storage::{
    ApkValidator, ByteStream, DeclaredMetadataValidator, InstallerStore, InstallerValidator, InstallerWriter,
    StoreOptions, WriteRequest,
};
pub use transport::{AnnounceLookup, MemoryDirectory, MemoryTransport, MulticastTransport, PeerFound};

pub use peer_upgrade_core::{
    AvailableInstaller, CheckState, DownloadProgress, DownloadState, InstallerDescriptor,
    ManagerState, PackageInfo, SearchState,
};
