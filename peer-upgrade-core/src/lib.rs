//! Peer-to-peer installer upgrades: protocol, tracking and state machine.
//! Host-driven: no network or filesystem I/O; time is passed in and the host
//! performs the requests, timers and disk writes these types describe.

pub mod installer;
pub mod integrity;
pub mod protocol;
pub mod service;
pub mod state;
pub mod throttle;
pub mod tracker;

pub use installer::{
    is_valid_hash, parse_installer_list, precedence, short_hash, InstallerDescriptor, ListError,
    PackageInfo, HASH_TYPE_SHA256,
};
pub use integrity::{hash_bytes, hash_reader, ContentHasher};
pub use protocol::{DatagramError, DiscoveryMessage, MAX_DATAGRAM_LEN, PROTOCOL_VERSION};
pub use service::ServiceState;
pub use state::{
    choose_candidate, upgrade_candidates, CheckState, DownloadProgress, DownloadState,
    ManagerState, SearchState,
};
pub use throttle::Throttle;
pub use tracker::{AvailableInstaller, InstallerTracker, DEFAULT_PEER_TTL};
