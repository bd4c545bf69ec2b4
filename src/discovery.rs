//! Multicast peer discovery and the peer directory.
//!
//! Presence is announced as `HELLO|<name>|<port>` datagrams to a well-known
//! multicast group; the listen loop fills the directory with
//! name -> control-address mappings. No coordinator, no handshake: whoever is
//! announcing is reachable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Notify};

use crate::config::NetworkConfig;
use crate::protocol::{encode_announcement, parse_announcement};

/// Multicast group for presence announcements.
pub const MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(230, 0, 0, 0);

/// Port of the multicast group.
pub const MULTICAST_PORT: u16 = 9999;

/// Interval between presence announcements in milliseconds.
pub const ANNOUNCE_INTERVAL_MS: u64 = 2000;

/// Receive buffer for announcement datagrams.
const ANNOUNCE_BUF_SIZE: usize = 512;

/// A known peer: display name plus the address of its control listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub display_name: String,
    pub address: SocketAddr,
    pub last_seen: DateTime<Utc>,
}

/// Discovery event.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// Peer announced itself for the first time or moved to a new address.
    PeerOnline { name: String, address: SocketAddr },
    /// Peer was dropped by the liveness sweep.
    PeerExpired { name: String },
}

/// Live mapping of peer display name to control address.
///
/// Written by the discovery listen loop, read concurrently by anyone; entries
/// are replaced wholesale on a newer announcement (last write wins).
pub struct PeerDirectory {
    peers: RwLock<HashMap<String, PeerRecord>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace a peer; returns true when the peer is new or its
    /// address changed. Refreshes the last-seen stamp either way.
    pub fn insert(&self, name: &str, address: SocketAddr) -> bool {
        let mut peers = self.peers.write().unwrap();
        match peers.get_mut(name) {
            Some(record) => {
                record.last_seen = Utc::now();
                if record.address != address {
                    record.address = address;
                    true
                } else {
                    false
                }
            }
            None => {
                peers.insert(
                    name.to_string(),
                    PeerRecord {
                        display_name: name.to_string(),
                        address,
                        last_seen: Utc::now(),
                    },
                );
                true
            }
        }
    }

    /// Cached control address for a peer, if known. No network I/O.
    pub fn lookup(&self, name: &str) -> Option<SocketAddr> {
        self.peers.read().unwrap().get(name).map(|r| r.address)
    }

    /// Full record for a peer, if known.
    pub fn get(&self, name: &str) -> Option<PeerRecord> {
        self.peers.read().unwrap().get(name).cloned()
    }

    /// Remove a peer; idempotent. Returns true when an entry was removed.
    pub fn remove(&self, name: &str) -> bool {
        self.peers.write().unwrap().remove(name).is_some()
    }

    /// Known peer names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.peers.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Snapshot of all records, sorted by name.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        let mut records: Vec<PeerRecord> =
            self.peers.read().unwrap().values().cloned().collect();
        records.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        records
    }

    pub fn len(&self) -> usize {
        self.peers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().unwrap().is_empty()
    }

    /// Drop peers not seen within `ttl`; returns the removed names, sorted.
    pub fn remove_expired(&self, ttl: Duration) -> Vec<String> {
        let Some(cutoff) = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl))
        else {
            return Vec::new();
        };

        let mut peers = self.peers.write().unwrap();
        let mut expired: Vec<String> = peers
            .iter()
            .filter(|(_, record)| record.last_seen < cutoff)
            .map(|(name, _)| name.clone())
            .collect();
        expired.sort();
        for name in &expired {
            peers.remove(name);
        }
        expired
    }
}

impl Default for PeerDirectory {
    fn default() -> Self {
        Self::new()
    }
}

/// Discovery errors.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("discovery already running")]
    AlreadyRunning,

    #[error("no usable LAN network interface")]
    NoInterface,

    #[error("failed to bind: {0}")]
    BindFailed(String),

    #[error("failed to join multicast group: {0}")]
    MulticastFailed(String),
}

/// Multicast discovery service: one announce loop, one listen loop, and an
/// optional liveness sweep.
pub struct DiscoveryService {
    local_name: String,
    control_port: u16,
    config: NetworkConfig,
    directory: Arc<PeerDirectory>,
    socket: Option<Arc<UdpSocket>>,
    event_tx: broadcast::Sender<DiscoveryEvent>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl DiscoveryService {
    /// Create a new discovery service announcing `local_name` and the port of
    /// the local control listener.
    pub fn new(
        local_name: &str,
        control_port: u16,
        config: NetworkConfig,
        directory: Arc<PeerDirectory>,
    ) -> Self {
        let (tx, _) = broadcast::channel(64);

        Self {
            local_name: local_name.to_string(),
            control_port,
            config,
            directory,
            socket: None,
            event_tx: tx,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Subscribe to discovery events.
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.event_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Join the multicast group and spawn the announce/listen loops.
    pub async fn start(&mut self) -> Result<(), DiscoveryError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(DiscoveryError::AlreadyRunning);
        }

        // A loopback-only host has nothing to announce on.
        lan_ipv4().ok_or(DiscoveryError::NoInterface)?;

        let socket = bind_multicast(self.config.multicast_port)?;
        socket
            .set_nonblocking(true)
            .map_err(|e| DiscoveryError::BindFailed(e.to_string()))?;
        let socket =
            UdpSocket::from_std(socket).map_err(|e| DiscoveryError::BindFailed(e.to_string()))?;
        socket
            .join_multicast_v4(self.config.multicast_addr, Ipv4Addr::UNSPECIFIED)
            .map_err(|e| DiscoveryError::MulticastFailed(e.to_string()))?;

        let socket = Arc::new(socket);
        self.socket = Some(Arc::clone(&socket));
        self.running.store(true, Ordering::SeqCst);

        tracing::info!(
            "joined multicast group {}:{}",
            self.config.multicast_addr,
            self.config.multicast_port
        );

        self.spawn_announce_loop().await?;
        self.spawn_listen_loop(socket);
        if let Some(expiry) = self.config.peer_expiry {
            self.spawn_sweep_loop(expiry);
        }

        Ok(())
    }

    async fn spawn_announce_loop(&self) -> Result<(), DiscoveryError> {
        let sender = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| DiscoveryError::BindFailed(e.to_string()))?;
        let group = SocketAddr::from((self.config.multicast_addr, self.config.multicast_port));
        let message = encode_announcement(&self.local_name, self.control_port);
        let interval = self.config.announce_interval;
        let running = Arc::clone(&self.running);

        tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                if let Err(e) = sender.send_to(message.as_bytes(), group).await {
                    tracing::warn!("announce failed: {}", e);
                }
                tokio::time::sleep(interval).await;
            }
        });

        Ok(())
    }

    fn spawn_listen_loop(&self, socket: Arc<UdpSocket>) {
        let local_name = self.local_name.clone();
        let directory = Arc::clone(&self.directory);
        let event_tx = self.event_tx.clone();
        let running = Arc::clone(&self.running);
        let shutdown = Arc::clone(&self.shutdown);

        tokio::spawn(async move {
            let mut buf = vec![0u8; ANNOUNCE_BUF_SIZE];

            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    received = socket.recv_from(&mut buf) => match received {
                        Ok((len, src)) => {
                            let Ok(text) = std::str::from_utf8(&buf[..len]) else {
                                continue;
                            };
                            let Some((name, port)) = parse_announcement(text) else {
                                continue;
                            };
                            if name == local_name {
                                continue;
                            }
                            let address = SocketAddr::new(src.ip(), port);
                            if directory.insert(&name, address) {
                                tracing::info!("discovered peer {} -> {}", name, address);
                                let _ = event_tx.send(DiscoveryEvent::PeerOnline { name, address });
                            }
                        }
                        Err(e) => {
                            // No reconnection: the loop ends with the socket.
                            if running.load(Ordering::SeqCst) {
                                tracing::warn!("discovery receive error: {}", e);
                            }
                            break;
                        }
                    }
                }
            }

            tracing::debug!("discovery listen loop exited");
        });
    }

    fn spawn_sweep_loop(&self, expiry: Duration) {
        let directory = Arc::clone(&self.directory);
        let event_tx = self.event_tx.clone();
        let running = Arc::clone(&self.running);
        let period = (expiry / 2).max(Duration::from_millis(250));

        tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                tokio::time::sleep(period).await;
                for name in directory.remove_expired(expiry) {
                    tracing::info!("peer {} expired", name);
                    let _ = event_tx.send(DiscoveryEvent::PeerExpired { name });
                }
            }
        });
    }

    /// Leave the multicast group and halt the loops; safe to call once (and a
    /// no-op after that).
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();
        if let Some(socket) = self.socket.take() {
            let _ = socket.leave_multicast_v4(self.config.multicast_addr, Ipv4Addr::UNSPECIFIED);
        }
        tracing::info!("discovery stopped");
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Resolve the LAN-facing IPv4 address by probing the routing table. No
/// packets are sent; `connect` on a datagram socket only selects the outbound
/// interface. Loopback, virtual, and down interfaces never win the route.
fn lan_ipv4() -> Option<Ipv4Addr> {
    let socket = StdUdpSocket::bind("0.0.0.0:0").ok()?;
    let targets = [
        SocketAddr::from((MULTICAST_ADDR, MULTICAST_PORT)),
        SocketAddr::from((Ipv4Addr::new(8, 8, 8, 8), 53)),
    ];
    for target in targets {
        if socket.connect(target).is_err() {
            continue;
        }
        if let Ok(SocketAddr::V4(addr)) = socket.local_addr() {
            let ip = *addr.ip();
            if !ip.is_loopback() && !ip.is_unspecified() {
                return Some(ip);
            }
        }
    }
    None
}

/// Local address advertised in signaling envelopes; falls back to loopback
/// when no LAN interface is available.
pub(crate) fn local_ip_best_effort() -> IpAddr {
    lan_ipv4()
        .map(IpAddr::V4)
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Bind the shared multicast listen port with SO_REUSEADDR so several
/// instances on one host can coexist.
#[cfg(unix)]
fn bind_multicast(port: u16) -> Result<StdUdpSocket, DiscoveryError> {
    use std::os::unix::io::FromRawFd;

    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
        if fd < 0 {
            return Err(DiscoveryError::BindFailed(
                std::io::Error::last_os_error().to_string(),
            ));
        }

        let reuse: libc::c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &reuse as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) < 0
        {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(DiscoveryError::BindFailed(err.to_string()));
        }

        let mut addr: libc::sockaddr_in = std::mem::zeroed();
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = port.to_be();
        addr.sin_addr.s_addr = u32::from(Ipv4Addr::UNSPECIFIED).to_be();

        if libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ) < 0
        {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(DiscoveryError::BindFailed(err.to_string()));
        }

        Ok(StdUdpSocket::from_raw_fd(fd))
    }
}

#[cfg(not(unix))]
fn bind_multicast(port: u16) -> Result<StdUdpSocket, DiscoveryError> {
    StdUdpSocket::bind(("0.0.0.0", port)).map_err(|e| DiscoveryError::BindFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 5], port))
    }

    #[test]
    fn test_directory_insert_and_lookup() {
        let directory = PeerDirectory::new();
        assert!(directory.is_empty());
        assert!(directory.insert("bob", addr(4000)));
        assert_eq!(directory.lookup("bob"), Some(addr(4000)));
        assert_eq!(directory.lookup("carol"), None);
    }

    #[test]
    fn test_directory_address_update_without_removal() {
        let directory = PeerDirectory::new();
        directory.insert("bob", addr(4000));

        // Same address again: not a change.
        assert!(!directory.insert("bob", addr(4000)));

        // Moved: last write wins, no removal required first.
        assert!(directory.insert("bob", addr(4100)));
        assert_eq!(directory.lookup("bob"), Some(addr(4100)));
        assert_eq!(directory.len(), 1);
    }

    #[test]
    fn test_directory_names_sorted() {
        let directory = PeerDirectory::new();
        directory.insert("carol", addr(1));
        directory.insert("alice", addr(2));
        directory.insert("bob", addr(3));
        assert_eq!(directory.names(), vec!["alice", "bob", "carol"]);
    }

    #[test]
    fn test_directory_remove_idempotent() {
        let directory = PeerDirectory::new();
        directory.insert("bob", addr(4000));
        assert!(directory.remove("bob"));
        assert!(!directory.remove("bob"));
        assert_eq!(directory.lookup("bob"), None);
    }

    #[test]
    fn test_directory_expiry() {
        let directory = PeerDirectory::new();
        directory.insert("bob", addr(4000));
        directory.insert("carol", addr(4001));

        // Nothing is older than an hour.
        assert!(directory.remove_expired(Duration::from_secs(3600)).is_empty());

        // Backdate bob beyond the TTL.
        {
            let mut peers = directory.peers.write().unwrap();
            peers.get_mut("bob").unwrap().last_seen = Utc::now() - chrono::Duration::seconds(30);
        }
        let expired = directory.remove_expired(Duration::from_secs(10));
        assert_eq!(expired, vec!["bob"]);
        assert_eq!(directory.names(), vec!["carol"]);
    }
}
