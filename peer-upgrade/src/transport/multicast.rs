//! LAN announce/lookup over UDP multicast.
//!
//! `Announce` datagrams go to the group when a record is registered; `Lookup`
//! datagrams go to the group on every lookup and are answered with unicast
//! `Announce` datagrams by each device holding a record under the key.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use parking_lot::Mutex;
use peer_upgrade_core::{DiscoveryMessage, MAX_DATAGRAM_LEN};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{AnnounceLookup, PeerFound};
use crate::error::{Error, Result};
use crate::events::Notifier;

pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);
pub const DEFAULT_DISCOVERY_PORT: u16 = 45461;

/// (key, port) pairs this device answers lookups for.
type Records = Arc<Mutex<Vec<(String, u16)>>>;

pub struct MulticastTransport {
    socket: Arc<UdpSocket>,
    group: SocketAddr,
    local_host: IpAddr,
    records: Records,
    found: Arc<Notifier<PeerFound>>,
    recv_task: JoinHandle<()>,
}

impl MulticastTransport {
    /// Join the group on `discovery_port`. Must be called inside a runtime.
    pub async fn bind(discovery_port: u16) -> io::Result<Self> {
        let socket = Arc::new(make_multicast_socket(discovery_port)?);
        let records: Records = Arc::default();
        let found = Arc::new(Notifier::new());
        let recv_task = tokio::spawn(recv_loop(socket.clone(), records.clone(), found.clone()));
        let local_host = detect_local_host();
        debug!(port = discovery_port, host = %local_host, "multicast discovery bound");
        Ok(Self {
            socket,
            group: SocketAddr::V4(SocketAddrV4::new(MULTICAST_GROUP, discovery_port)),
            local_host,
            records,
            found,
            recv_task,
        })
    }

    fn send(&self, msg: &DiscoveryMessage, dest: SocketAddr) -> Result<()> {
        let datagram = msg
            .to_datagram()
            .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        self.socket.try_send_to(&datagram, dest)?;
        Ok(())
    }
}

impl AnnounceLookup for MulticastTransport {
    fn announce(&self, key: &str, port: u16) -> Result<()> {
        {
            let mut records = self.records.lock();
            if !records.iter().any(|(k, p)| k == key && *p == port) {
                records.push((key.to_string(), port));
            }
        }
        self.send(&DiscoveryMessage::announce(key, port), self.group)
    }

    fn unannounce(&self, key: &str, port: u16) -> Result<()> {
        self.records
            .lock()
            .retain(|(k, p)| !(k == key && *p == port));
        Ok(())
    }

    fn lookup(&self, key: &str) -> Result<()> {
        self.send(&DiscoveryMessage::lookup(key), self.group)
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<PeerFound> {
        self.found.subscribe()
    }

    fn local_host(&self) -> IpAddr {
        self.local_host
    }
}

impl Drop for MulticastTransport {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

fn make_multicast_socket(discovery_port: u16) -> io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_multicast_loop_v4(true)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

/// Source address of the interface that routes to the group. Falls back to loopback.
fn detect_local_host() -> IpAddr {
    std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|s| {
            s.connect((MULTICAST_GROUP, DEFAULT_DISCOVERY_PORT))?;
            s.local_addr()
        })
        .map(|addr| addr.ip())
        .ok()
        .filter(|ip| !ip.is_unspecified())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

async fn recv_loop(socket: Arc<UdpSocket>, records: Records, found: Arc<Notifier<PeerFound>>) {
    // One byte over the limit so oversized datagrams are seen as such.
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN + 1];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!(error = %e, "discovery socket receive failed");
                return;
            }
        };
        let Some(datagram) = buf.get(..n) else {
            continue;
        };
        let msg = match DiscoveryMessage::from_datagram(datagram) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(%from, error = %e, "ignoring discovery datagram");
                continue;
            }
        };
        match msg {
            DiscoveryMessage::Announce { key, port, .. } => {
                found.emit(PeerFound {
                    key,
                    host: from.ip(),
                    port,
                });
            }
            DiscoveryMessage::Lookup { key, .. } => {
                let ports: Vec<u16> = records
                    .lock()
                    .iter()
                    .filter(|(k, _)| *k == key)
                    .map(|(_, p)| *p)
                    .collect();
                for port in ports {
                    let reply = match DiscoveryMessage::announce(&key, port).to_datagram() {
                        Ok(datagram) => datagram,
                        Err(e) => {
                            warn!(error = %e, "failed to encode announce");
                            continue;
                        }
                    };
                    if let Err(e) = socket.send_to(&reply, from).await {
                        debug!(%from, error = %e, "failed to answer lookup");
                    }
                }
            }
        }
    }
}
