//! Local-network discovery protocol: message types and their datagram encoding.
//!
//! One message per UDP datagram: a two-byte magic followed by the bincode
//! encoding of a [`DiscoveryMessage`]. The datagram boundary is the frame.

use bincode::Options;
use serde::{Deserialize, Serialize};

/// Current protocol version. Carried in every discovery message.
pub const PROTOCOL_VERSION: u8 = 1;

/// Prefix that tells our datagrams apart from other traffic on the group.
const MAGIC: [u8; 2] = *b"PU";

/// Upper bound for a whole datagram, magic included.
pub const MAX_DATAGRAM_LEN: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryMessage {
    /// Advertise that an HTTP installer surface for `key` listens on `port` at the sender's address.
    Announce {
        protocol_version: u8,
        key: String,
        port: u16,
    },
    /// Ask every device that announced `key` to answer with an `Announce`.
    Lookup { protocol_version: u8, key: String },
}

#[derive(Debug, thiserror::Error)]
pub enum DatagramError {
    #[error("datagram exceeds {MAX_DATAGRAM_LEN} bytes")]
    TooLarge,
    #[error("not a discovery datagram")]
    BadMagic,
    #[error("unsupported protocol version {0}")]
    Version(u8),
    #[error("bincode: {0}")]
    Codec(#[from] bincode::Error),
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit((MAX_DATAGRAM_LEN - MAGIC.len()) as u64)
        .reject_trailing_bytes()
}

impl DiscoveryMessage {
    pub fn announce(key: &str, port: u16) -> Self {
        Self::Announce {
            protocol_version: PROTOCOL_VERSION,
            key: key.to_string(),
            port,
        }
    }

    pub fn lookup(key: &str) -> Self {
        Self::Lookup {
            protocol_version: PROTOCOL_VERSION,
            key: key.to_string(),
        }
    }

    pub fn protocol_version(&self) -> u8 {
        match self {
            Self::Announce {
                protocol_version, ..
            }
            | Self::Lookup {
                protocol_version, ..
            } => *protocol_version,
        }
    }

    /// Encode as a single datagram.
    pub fn to_datagram(&self) -> Result<Vec<u8>, DatagramError> {
        let payload = codec().serialize(self).map_err(|e| match *e {
            bincode::ErrorKind::SizeLimit => DatagramError::TooLarge,
            _ => DatagramError::Codec(e),
        })?;
        let mut out = Vec::with_capacity(MAGIC.len() + payload.len());
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Decode exactly one message from a received datagram. Trailing bytes,
    /// oversized input and foreign protocol versions are rejected.
    pub fn from_datagram(datagram: &[u8]) -> Result<Self, DatagramError> {
        if datagram.len() > MAX_DATAGRAM_LEN {
            return Err(DatagramError::TooLarge);
        }
        let payload = datagram
            .strip_prefix(&MAGIC[..])
            .ok_or(DatagramError::BadMagic)?;
        let msg: Self = codec().deserialize(payload)?;
        match msg.protocol_version() {
            PROTOCOL_VERSION => Ok(msg),
            other => Err(DatagramError::Version(other)),
        }
    }
}
