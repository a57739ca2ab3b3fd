//! BitChat Network - Local Peer Discovery
//!
//! LAN challenge-response discovery over UDP broadcast (IPv4) and multicast
//! (IPv6). The network ID never appears on the wire:
//! - Query:    `version=5 | challenge(32) | HMAC(network_id, challenge)`
//! - Response: `version=6 | port(2, LE) | challenge(32) | HMAC(network_id, challenge | ip | port)`
//!
//! Only a node that already knows a network ID can answer a query for it or
//! validate an answer, so passive listeners learn nothing about membership.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::collections::{HashMap, HashSet};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::config::NetworkConfig;
use crate::identifier::{Identifier, CHALLENGE_LEN};
use crate::peer_endpoint::{normalize_endpoint, normalize_ip};

type HmacSha256 = Hmac<Sha256>;

// =============================================================================
// Error Types
// =============================================================================

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("Packet too short: {0} bytes")]
    TooShort(usize),

    #[error("Packet too long: {0} bytes")]
    TooLong(usize),

    #[error("Unknown packet version: {0}")]
    UnknownVersion(u8),

    #[error("Socket error: {0}")]
    Socket(String),
}

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

impl From<std::io::Error> for DiscoveryError {
    fn from(e: std::io::Error) -> Self {
        DiscoveryError::Socket(e.to_string())
    }
}

// =============================================================================
// Constants
// =============================================================================

/// Query packet version byte
pub const QUERY_VERSION: u8 = 5;

/// Response packet version byte
pub const RESPONSE_VERSION: u8 = 6;

/// Largest datagram we accept
pub const MAX_DATAGRAM_SIZE: usize = 128;

const HMAC_LEN: usize = 32;
const QUERY_LEN: usize = 1 + CHALLENGE_LEN + HMAC_LEN;
const RESPONSE_LEN: usize = 1 + 2 + CHALLENGE_LEN + HMAC_LEN;

/// How long a sent or received challenge stays valid
pub const QUERY_EXPIRY: Duration = Duration::from_secs(2);

/// How long a discovered peer is suppressed from being reported again
pub const PEER_EXPIRY: Duration = Duration::from_secs(30);

/// IPv6 multicast group (link-local scope, transient)
pub const IPV6_MULTICAST_GROUP: Ipv6Addr = Ipv6Addr::new(0xff12, 0, 0, 0, 0, 0, 0, 1);

// =============================================================================
// HMAC helpers
// =============================================================================

fn compute_hmac(key: &Identifier, parts: &[&[u8]]) -> [u8; HMAC_LEN] {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC accepts any key length");
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; HMAC_LEN];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

fn verify_hmac(key: &Identifier, parts: &[&[u8]], tag: &[u8]) -> bool {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC accepts any key length");
    for part in parts {
        mac.update(part);
    }
    mac.verify_slice(tag).is_ok()
}

fn ip_bytes(ip: IpAddr) -> Vec<u8> {
    match normalize_ip(ip) {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

// =============================================================================
// Packets
// =============================================================================

/// Unsolicited broadcast asking "does anyone know this network?"
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveryQuery {
    pub challenge: [u8; CHALLENGE_LEN],
    pub hmac: [u8; HMAC_LEN],
}

impl DiscoveryQuery {
    /// New query with a random challenge
    pub fn new(network_id: &Identifier) -> Self {
        let mut challenge = [0u8; CHALLENGE_LEN];
        OsRng.fill_bytes(&mut challenge);
        Self::with_challenge(network_id, challenge)
    }

    pub fn with_challenge(network_id: &Identifier, challenge: [u8; CHALLENGE_LEN]) -> Self {
        let hmac = compute_hmac(network_id, &[&challenge]);
        Self { challenge, hmac }
    }

    /// True if this query was built with `network_id`
    pub fn is_this_network(&self, network_id: &Identifier) -> bool {
        verify_hmac(network_id, &[&self.challenge], &self.hmac)
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(QUERY_LEN);
        buf.put_u8(QUERY_VERSION);
        buf.put_slice(&self.challenge);
        buf.put_slice(&self.hmac);
        buf.freeze()
    }
}

/// Unicast answer to a query
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveryResponse {
    pub service_port: u16,
    pub challenge: [u8; CHALLENGE_LEN],
    pub hmac: [u8; HMAC_LEN],
}

impl DiscoveryResponse {
    pub fn new(
        network_id: &Identifier,
        challenge: [u8; CHALLENGE_LEN],
        responder_ip: IpAddr,
        service_port: u16,
    ) -> Self {
        let ip = ip_bytes(responder_ip);
        let port = service_port.to_le_bytes();
        let hmac = compute_hmac(network_id, &[&challenge, &ip, &port]);
        Self {
            service_port,
            challenge,
            hmac,
        }
    }

    /// True if the response was built with `network_id` by a node at `responder_ip`
    pub fn is_this_network(&self, network_id: &Identifier, responder_ip: IpAddr) -> bool {
        let ip = ip_bytes(responder_ip);
        let port = self.service_port.to_le_bytes();
        verify_hmac(network_id, &[&self.challenge, &ip, &port], &self.hmac)
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(RESPONSE_LEN);
        buf.put_u8(RESPONSE_VERSION);
        buf.put_u16_le(self.service_port);
        buf.put_slice(&self.challenge);
        buf.put_slice(&self.hmac);
        buf.freeze()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiscoveryPacket {
    Query(DiscoveryQuery),
    Response(DiscoveryResponse),
}

impl DiscoveryPacket {
    pub fn parse(data: &[u8]) -> DiscoveryResult<Self> {
        if data.is_empty() {
            return Err(DiscoveryError::TooShort(0));
        }
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(DiscoveryError::TooLong(data.len()));
        }
        let mut buf = data;
        match buf.get_u8() {
            QUERY_VERSION => {
                if data.len() < QUERY_LEN {
                    return Err(DiscoveryError::TooShort(data.len()));
                }
                let mut challenge = [0u8; CHALLENGE_LEN];
                buf.copy_to_slice(&mut challenge);
                let mut hmac = [0u8; HMAC_LEN];
                buf.copy_to_slice(&mut hmac);
                Ok(DiscoveryPacket::Query(DiscoveryQuery { challenge, hmac }))
            }
            RESPONSE_VERSION => {
                if data.len() < RESPONSE_LEN {
                    return Err(DiscoveryError::TooShort(data.len()));
                }
                let service_port = buf.get_u16_le();
                let mut challenge = [0u8; CHALLENGE_LEN];
                buf.copy_to_slice(&mut challenge);
                let mut hmac = [0u8; HMAC_LEN];
                buf.copy_to_slice(&mut hmac);
                Ok(DiscoveryPacket::Response(DiscoveryResponse {
                    service_port,
                    challenge,
                    hmac,
                }))
            }
            other => Err(DiscoveryError::UnknownVersion(other)),
        }
    }
}

// =============================================================================
// Discovery State
// =============================================================================

/// Peer found on the local segment
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiscoveryEvent {
    PeerDiscovered {
        network_id: Identifier,
        endpoint: SocketAddr,
    },
}

/// What the receive loop should do with a datagram
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DatagramAction {
    /// Send `packet` back to `to`
    Reply { packet: Bytes, to: SocketAddr },
    /// A peer for an announced network answered
    Discovered { network_id: Identifier, endpoint: SocketAddr },
    Ignore,
}

/// Synchronous discovery bookkeeping; all socket I/O lives in [`LocalPeerDiscovery`]
#[derive(Debug, Default)]
pub struct DiscoveryCore {
    /// Networks we answer queries for, with the service port to advertise
    tracking: HashMap<Identifier, u16>,
    /// Networks we are actively searching
    announcing: HashSet<Identifier>,
    /// Challenges we sent, by challenge
    sent_queries: HashMap<[u8; CHALLENGE_LEN], (Identifier, Instant)>,
    /// Challenges we already answered
    seen_queries: HashMap<[u8; CHALLENGE_LEN], Instant>,
    /// Peers already reported
    discovered: HashMap<(Identifier, SocketAddr), Instant>,
    /// Our own interface addresses (self-originated packets are dropped)
    local_ips: HashSet<IpAddr>,
}

impl DiscoveryCore {
    pub fn new(local_ips: HashSet<IpAddr>) -> Self {
        Self {
            local_ips: local_ips.into_iter().map(normalize_ip).collect(),
            ..Self::default()
        }
    }

    pub fn track(&mut self, network_id: Identifier, service_port: u16) {
        self.tracking.insert(network_id, service_port);
    }

    pub fn untrack(&mut self, network_id: &Identifier) {
        self.tracking.remove(network_id);
    }

    pub fn is_tracking(&self, network_id: &Identifier) -> bool {
        self.tracking.contains_key(network_id)
    }

    pub fn set_announcing(&mut self, network_id: Identifier, announcing: bool) {
        if announcing {
            self.announcing.insert(network_id);
        } else {
            self.announcing.remove(&network_id);
            self.sent_queries.retain(|_, (id, _)| *id != network_id);
        }
    }

    pub fn is_announcing(&self, network_id: &Identifier) -> bool {
        self.announcing.contains(network_id)
    }

    pub fn announcing(&self) -> Vec<Identifier> {
        self.announcing.iter().cloned().collect()
    }

    /// Replace the local address set; true if a previously unknown address appeared
    pub fn set_local_ips(&mut self, ips: HashSet<IpAddr>) -> bool {
        let ips: HashSet<IpAddr> = ips.into_iter().map(normalize_ip).collect();
        let added = ips.iter().any(|ip| !self.local_ips.contains(ip));
        self.local_ips = ips;
        added
    }

    /// Build a query for `network_id` and remember its challenge
    pub fn new_query(&mut self, network_id: &Identifier, now: Instant) -> DiscoveryQuery {
        let query = DiscoveryQuery::new(network_id);
        self.sent_queries.insert(query.challenge, (network_id.clone(), now));
        query
    }

    /// Drop expired challenges and peers
    pub fn purge(&mut self, now: Instant) {
        self.sent_queries
            .retain(|_, (_, sent)| now.duration_since(*sent) < QUERY_EXPIRY);
        self.seen_queries
            .retain(|_, seen| now.duration_since(*seen) < QUERY_EXPIRY);
        self.discovered
            .retain(|_, found| now.duration_since(*found) < PEER_EXPIRY);
    }

    /// Process one datagram. `responder_ip` resolves the local address used to
    /// reach a querier.
    pub fn handle_datagram(
        &mut self,
        data: &[u8],
        from: SocketAddr,
        now: Instant,
        responder_ip: impl FnOnce(IpAddr) -> Option<IpAddr>,
    ) -> DatagramAction {
        let from = normalize_endpoint(from);
        if self.local_ips.contains(&from.ip()) {
            return DatagramAction::Ignore;
        }
        self.purge(now);

        let packet = match DiscoveryPacket::parse(data) {
            Ok(packet) => packet,
            Err(e) => {
                log::debug!("Dropping discovery datagram from {}: {}", from, e);
                return DatagramAction::Ignore;
            }
        };

        match packet {
            DiscoveryPacket::Query(query) => self.handle_query(query, from, now, responder_ip),
            DiscoveryPacket::Response(response) => self.handle_response(response, from, now),
        }
    }

    fn handle_query(
        &mut self,
        query: DiscoveryQuery,
        from: SocketAddr,
        now: Instant,
        responder_ip: impl FnOnce(IpAddr) -> Option<IpAddr>,
    ) -> DatagramAction {
        if self.seen_queries.contains_key(&query.challenge) {
            return DatagramAction::Ignore;
        }

        let matched = self
            .tracking
            .iter()
            .find(|(id, _)| query.is_this_network(id))
            .map(|(id, port)| (id.clone(), *port));
        let Some((network_id, service_port)) = matched else {
            return DatagramAction::Ignore;
        };
        self.seen_queries.insert(query.challenge, now);

        let Some(local_ip) = responder_ip(from.ip()) else {
            log::debug!("No local route to {}, not answering", from);
            return DatagramAction::Ignore;
        };
        let response = DiscoveryResponse::new(&network_id, query.challenge, local_ip, service_port);
        log::debug!("Answering discovery query from {} for network {}", from, network_id.short());
        DatagramAction::Reply {
            packet: response.to_bytes(),
            to: from,
        }
    }

    fn handle_response(
        &mut self,
        response: DiscoveryResponse,
        from: SocketAddr,
        now: Instant,
    ) -> DatagramAction {
        let Some((network_id, _)) = self.sent_queries.get(&response.challenge).cloned() else {
            return DatagramAction::Ignore;
        };
        if !self.announcing.contains(&network_id) {
            return DatagramAction::Ignore;
        }
        if !response.is_this_network(&network_id, from.ip()) {
            log::debug!("Discovery response from {} failed verification", from);
            return DatagramAction::Ignore;
        }

        let endpoint = SocketAddr::new(from.ip(), response.service_port);
        let key = (network_id.clone(), endpoint);
        if self.discovered.contains_key(&key) {
            return DatagramAction::Ignore;
        }
        self.discovered.insert(key, now);
        DatagramAction::Discovered {
            network_id,
            endpoint,
        }
    }
}

// =============================================================================
// Local interface helpers
// =============================================================================

/// Local address the OS would use to reach `remote`
pub fn local_ip_towards(remote: IpAddr) -> Option<IpAddr> {
    let remote = normalize_ip(remote);
    let socket = match remote {
        IpAddr::V4(_) => StdUdpSocket::bind("0.0.0.0:0").ok()?,
        IpAddr::V6(_) => StdUdpSocket::bind("[::]:0").ok()?,
    };
    socket.connect(SocketAddr::new(remote, 9)).ok()?;
    let local = socket.local_addr().ok()?.ip();
    if local.is_unspecified() {
        None
    } else {
        Some(normalize_ip(local))
    }
}

/// One address of a local, non-loopback interface
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LocalInterface {
    pub ip: IpAddr,
    /// Directed broadcast address of the IPv4 subnet
    pub broadcast: Option<Ipv4Addr>,
    /// OS interface index; scopes IPv6 link-local multicast. 0 when unknown.
    pub index: u32,
}

/// Broadcast address of the subnet `ip/netmask`; `None` for /31 and /32
pub fn directed_broadcast(ip: Ipv4Addr, netmask: Ipv4Addr) -> Option<Ipv4Addr> {
    let mask = u32::from(netmask);
    if mask.count_ones() >= 31 {
        return None;
    }
    Some(Ipv4Addr::from(u32::from(ip) | !mask))
}

/// Addresses of every interface that is up, with their subnet broadcast
#[cfg(unix)]
pub fn local_interfaces() -> Vec<LocalInterface> {
    use nix::ifaddrs::getifaddrs;
    use nix::net::if_::{if_nametoindex, InterfaceFlags};
    use std::net::SocketAddrV4;

    let addrs = match getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            log::debug!("Interface enumeration failed, probing routes instead: {}", e);
            return probed_interfaces();
        }
    };

    let mut interfaces = Vec::new();
    for ifaddr in addrs {
        if ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK) || !ifaddr.flags.contains(InterfaceFlags::IFF_UP) {
            continue;
        }
        let Some(address) = ifaddr.address else {
            continue;
        };
        let index = if_nametoindex(ifaddr.interface_name.as_str()).unwrap_or(0);

        if let Some(sin) = address.as_sockaddr_in() {
            let ip = *SocketAddrV4::from(*sin).ip();
            let broadcast = if ifaddr.flags.contains(InterfaceFlags::IFF_BROADCAST) {
                ifaddr
                    .broadcast
                    .as_ref()
                    .and_then(|b| b.as_sockaddr_in())
                    .map(|b| *SocketAddrV4::from(*b).ip())
                    .or_else(|| {
                        let mask = ifaddr.netmask.as_ref()?.as_sockaddr_in()?;
                        directed_broadcast(ip, *SocketAddrV4::from(*mask).ip())
                    })
            } else {
                None
            };
            interfaces.push(LocalInterface {
                ip: IpAddr::V4(ip),
                broadcast,
                index,
            });
        } else if let Some(sin6) = address.as_sockaddr_in6() {
            interfaces.push(LocalInterface {
                ip: normalize_ip(IpAddr::V6(*SocketAddrV6::from(*sin6).ip())),
                broadcast: None,
                index,
            });
        }
    }
    interfaces
}

#[cfg(not(unix))]
pub fn local_interfaces() -> Vec<LocalInterface> {
    probed_interfaces()
}

/// Source addresses of the default routes; no subnet information
fn probed_interfaces() -> Vec<LocalInterface> {
    let probes = [
        IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
        IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1)),
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
        IpAddr::V6(Ipv6Addr::new(0x2001, 0x4860, 0x4860, 0, 0, 0, 0, 0x8888)),
    ];
    let mut interfaces: Vec<LocalInterface> = Vec::new();
    for probe in probes {
        if let Some(ip) = local_ip_towards(probe) {
            if !ip.is_loopback() && !interfaces.iter().any(|i| i.ip == ip) {
                interfaces.push(LocalInterface {
                    ip,
                    broadcast: None,
                    index: 0,
                });
            }
        }
    }
    interfaces
}

/// Entries of `current` missing from `known`
pub fn new_interfaces(known: &[LocalInterface], current: &[LocalInterface]) -> Vec<LocalInterface> {
    current.iter().filter(|i| !known.contains(i)).cloned().collect()
}

/// Per-interface destinations: each subnet's directed broadcast and the
/// IPv6 group scoped to each IPv6 interface
pub fn interface_targets(interfaces: &[LocalInterface], port: u16) -> Vec<SocketAddr> {
    let mut targets = Vec::new();
    for interface in interfaces {
        let target = match interface.ip {
            IpAddr::V4(_) => match interface.broadcast {
                Some(broadcast) => SocketAddr::new(IpAddr::V4(broadcast), port),
                None => continue,
            },
            IpAddr::V6(_) if interface.index != 0 => {
                SocketAddr::V6(SocketAddrV6::new(IPV6_MULTICAST_GROUP, port, 0, interface.index))
            }
            IpAddr::V6(_) => continue,
        };
        if !targets.contains(&target) {
            targets.push(target);
        }
    }
    targets
}

/// Limited broadcast and unscoped multicast, then every interface target
pub fn announce_targets(interfaces: &[LocalInterface], port: u16) -> Vec<SocketAddr> {
    let mut targets = vec![
        SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port),
        SocketAddr::new(IpAddr::V6(IPV6_MULTICAST_GROUP), port),
    ];
    for target in interface_targets(interfaces, port) {
        if !targets.contains(&target) {
            targets.push(target);
        }
    }
    targets
}

/// IPv6-only socket on `port`, so it never competes with the IPv4 socket
fn bind_v6(port: u16) -> std::io::Result<StdUdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_only_v6(true)?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port).into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Join the discovery group on the default interface and on each IPv6 interface
fn join_discovery_group(socket: &UdpSocket, interfaces: &[LocalInterface]) {
    let mut indexes = vec![0];
    for interface in interfaces {
        if interface.ip.is_ipv6() && !indexes.contains(&interface.index) {
            indexes.push(interface.index);
        }
    }
    let mut joined = 0;
    for index in indexes {
        match socket.join_multicast_v6(&IPV6_MULTICAST_GROUP, index) {
            Ok(()) => joined += 1,
            Err(e) => log::debug!("IPv6 multicast join on interface {} failed: {}", index, e),
        }
    }
    if joined == 0 {
        log::warn!("IPv6 discovery only answers unicast, no multicast group joined");
    }
}

// =============================================================================
// Local Peer Discovery Service
// =============================================================================

/// Sockets and state shared by the background tasks
#[derive(Clone)]
struct Broadcaster {
    port: u16,
    socket_v4: Arc<UdpSocket>,
    socket_v6: Option<Arc<UdpSocket>>,
    core: Arc<RwLock<DiscoveryCore>>,
    interfaces: Arc<RwLock<Vec<LocalInterface>>>,
}

impl Broadcaster {
    /// Send one fresh query for `network_id` to every segment we are on
    async fn announce(&self, network_id: &Identifier) {
        let targets = announce_targets(&self.interfaces.read().await, self.port);
        self.send_query(network_id, &targets).await;
    }

    /// Send one fresh query for `network_id` on `interfaces` only
    async fn announce_on(&self, network_id: &Identifier, interfaces: &[LocalInterface]) {
        let targets = interface_targets(interfaces, self.port);
        if !targets.is_empty() {
            self.send_query(network_id, &targets).await;
        }
    }

    async fn send_query(&self, network_id: &Identifier, targets: &[SocketAddr]) {
        let packet = {
            let mut core = self.core.write().await;
            if !core.is_announcing(network_id) {
                return;
            }
            core.new_query(network_id, Instant::now()).to_bytes()
        };

        for target in targets {
            let socket = match target {
                SocketAddr::V4(_) => &self.socket_v4,
                SocketAddr::V6(_) => match &self.socket_v6 {
                    Some(socket) => socket,
                    None => continue,
                },
            };
            if let Err(e) = socket.send_to(&packet, target).await {
                log::debug!("Discovery query to {} failed: {}", target, e);
            }
        }
        log::debug!("Announced network {} to {} targets", network_id.short(), targets.len());
    }
}

/// LAN discovery service. One instance serves every network on this node.
pub struct LocalPeerDiscovery {
    config: NetworkConfig,
    broadcaster: Broadcaster,
    announcements: Arc<RwLock<HashMap<Identifier, JoinHandle<()>>>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    event_handler: Arc<RwLock<Option<mpsc::Sender<DiscoveryEvent>>>>,
}

impl LocalPeerDiscovery {
    /// Bind the discovery sockets on `config.discovery_port`
    pub async fn bind(config: NetworkConfig) -> DiscoveryResult<Self> {
        let port = config.discovery_port;
        let socket_v4 = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)).await?;
        socket_v4.set_broadcast(true)?;
        let port = socket_v4.local_addr()?.port();

        let interfaces = local_interfaces();
        let socket_v6 = match bind_v6(port).and_then(UdpSocket::from_std) {
            Ok(socket) => {
                join_discovery_group(&socket, &interfaces);
                Some(Arc::new(socket))
            }
            Err(e) => {
                log::warn!("IPv6 discovery disabled, bind failed: {}", e);
                None
            }
        };

        let core = DiscoveryCore::new(interfaces.iter().map(|i| i.ip).collect());
        log::info!("Local peer discovery bound on UDP port {}", port);

        Ok(Self {
            config,
            broadcaster: Broadcaster {
                port,
                socket_v4: Arc::new(socket_v4),
                socket_v6,
                core: Arc::new(RwLock::new(core)),
                interfaces: Arc::new(RwLock::new(interfaces)),
            },
            announcements: Arc::new(RwLock::new(HashMap::new())),
            tasks: std::sync::Mutex::new(Vec::new()),
            event_handler: Arc::new(RwLock::new(None)),
        })
    }

    /// Port the discovery sockets are bound to
    pub fn port(&self) -> u16 {
        self.broadcaster.port
    }

    pub async fn set_event_handler(&self, handler: mpsc::Sender<DiscoveryEvent>) {
        *self.event_handler.write().await = Some(handler);
    }

    /// Start the receive loops and the interface watcher
    pub fn start(&self) {
        let mut tasks = match self.tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !tasks.is_empty() {
            return;
        }

        tasks.push(tokio::spawn(Self::receive_loop(
            self.broadcaster.socket_v4.clone(),
            self.broadcaster.core.clone(),
            self.event_handler.clone(),
        )));
        if let Some(socket) = &self.broadcaster.socket_v6 {
            tasks.push(tokio::spawn(Self::receive_loop(
                socket.clone(),
                self.broadcaster.core.clone(),
                self.event_handler.clone(),
            )));
        }
        tasks.push(tokio::spawn(Self::interface_watcher(
            self.broadcaster.clone(),
            self.config.interface_watch_interval(),
        )));
    }

    /// Stop every background task and announcement
    pub async fn stop(&self) {
        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for task in tasks {
            task.abort();
        }
        for (_, task) in self.announcements.write().await.drain() {
            task.abort();
        }
    }

    /// Answer queries for `network_id`, advertising `service_port`
    pub async fn start_tracking(&self, network_id: Identifier, service_port: u16) {
        self.broadcaster.core.write().await.track(network_id, service_port);
    }

    pub async fn stop_tracking(&self, network_id: &Identifier) {
        self.broadcaster.core.write().await.untrack(network_id);
    }

    /// Actively search for peers of `network_id`
    pub async fn start_announcement(&self, network_id: Identifier) {
        let mut announcements = self.announcements.write().await;
        if announcements.contains_key(&network_id) {
            return;
        }
        self.broadcaster
            .core
            .write()
            .await
            .set_announcing(network_id.clone(), true);

        let broadcaster = self.broadcaster.clone();
        let retry_interval = self.config.announce_retry_interval();
        let retry_count = self.config.announce_retry_count;
        let reannounce = self.config.reannounce_interval();
        let id = network_id.clone();
        let task = tokio::spawn(async move {
            for _ in 0..retry_count {
                broadcaster.announce(&id).await;
                tokio::time::sleep(retry_interval).await;
            }
            loop {
                tokio::time::sleep(reannounce).await;
                broadcaster.announce(&id).await;
            }
        });
        announcements.insert(network_id, task);
    }

    pub async fn stop_announcement(&self, network_id: &Identifier) {
        if let Some(task) = self.announcements.write().await.remove(network_id) {
            task.abort();
        }
        self.broadcaster
            .core
            .write()
            .await
            .set_announcing(network_id.clone(), false);
    }

    pub async fn is_announcing(&self, network_id: &Identifier) -> bool {
        self.broadcaster.core.read().await.is_announcing(network_id)
    }

    async fn receive_loop(
        socket: Arc<UdpSocket>,
        core: Arc<RwLock<DiscoveryCore>>,
        handler: Arc<RwLock<Option<mpsc::Sender<DiscoveryEvent>>>>,
    ) {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE + 1];
        loop {
            let (len, from) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    log::debug!("Discovery receive error: {}", e);
                    continue;
                }
            };

            let action = core
                .write()
                .await
                .handle_datagram(&buf[..len], from, Instant::now(), local_ip_towards);

            match action {
                DatagramAction::Reply { packet, to } => {
                    if let Err(e) = socket.send_to(&packet, to).await {
                        log::debug!("Failed to answer discovery query from {}: {}", to, e);
                    }
                }
                DatagramAction::Discovered { network_id, endpoint } => {
                    log::info!("Discovered peer {} for network {} on LAN", endpoint, network_id.short());
                    if let Some(ref h) = *handler.read().await {
                        if let Err(mpsc::error::TrySendError::Full(_)) =
                            h.try_send(DiscoveryEvent::PeerDiscovered { network_id, endpoint })
                        {
                            log::warn!("Discovery event queue full, dropping {}", endpoint);
                        }
                    }
                }
                DatagramAction::Ignore => {}
            }
        }
    }

    async fn interface_watcher(broadcaster: Broadcaster, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;

            let interfaces = tokio::task::spawn_blocking(local_interfaces)
                .await
                .unwrap_or_default();
            let added = {
                let mut known = broadcaster.interfaces.write().await;
                let added = new_interfaces(&known, &interfaces);
                *known = interfaces.clone();
                added
            };
            let announcing = {
                let mut core = broadcaster.core.write().await;
                core.purge(Instant::now());
                core.set_local_ips(interfaces.iter().map(|i| i.ip).collect());
                core.announcing()
            };

            if !added.is_empty() {
                log::info!(
                    "{} new local addresses, re-announcing {} networks on them",
                    added.len(),
                    announcing.len()
                );
                for network_id in announcing {
                    broadcaster.announce_on(&network_id, &added).await;
                }
            }
        }
    }
}

impl Drop for LocalPeerDiscovery {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        if let Ok(mut announcements) = self.announcements.try_write() {
            for (_, task) in announcements.drain() {
                task.abort();
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn network(n: u8) -> Identifier {
        Identifier::from_array([n; 20])
    }

    fn peer_addr() -> SocketAddr {
        "192.168.1.20:41733".parse().unwrap()
    }

    fn responder(_: IpAddr) -> Option<IpAddr> {
        Some("192.168.1.10".parse().unwrap())
    }

    #[test]
    fn test_query_roundtrip_validates() {
        let id = network(1);
        let query = DiscoveryQuery::new(&id);
        let bytes = query.to_bytes();
        assert_eq!(bytes.len(), QUERY_LEN);
        assert_eq!(bytes[0], QUERY_VERSION);

        let DiscoveryPacket::Query(parsed) = DiscoveryPacket::parse(&bytes).unwrap() else {
            panic!("expected query");
        };
        assert!(parsed.is_this_network(&id));
        assert!(!parsed.is_this_network(&network(2)));
    }

    #[test]
    fn test_response_binds_ip_and_port() {
        let id = network(1);
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        let response = DiscoveryResponse::new(&id, [9u8; 32], ip, 5000);
        let DiscoveryPacket::Response(parsed) = DiscoveryPacket::parse(&response.to_bytes()).unwrap() else {
            panic!("expected response");
        };
        assert!(parsed.is_this_network(&id, ip));
        assert!(!parsed.is_this_network(&id, "10.0.0.6".parse().unwrap()));
        assert!(!parsed.is_this_network(&network(2), ip));

        let mut forged = parsed.clone();
        forged.service_port = 5001;
        assert!(!forged.is_this_network(&id, ip));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(DiscoveryPacket::parse(&[]), Err(DiscoveryError::TooShort(0)));
        assert_eq!(DiscoveryPacket::parse(&[5, 1, 2]), Err(DiscoveryError::TooShort(3)));
        assert_eq!(DiscoveryPacket::parse(&[9; 70]), Err(DiscoveryError::UnknownVersion(9)));
        assert_eq!(DiscoveryPacket::parse(&[5; 200]), Err(DiscoveryError::TooLong(200)));
    }

    #[test]
    fn test_tracked_network_answers_query() {
        let id = network(1);
        let mut core = DiscoveryCore::new(HashSet::new());
        core.track(id.clone(), 7000);

        let query = DiscoveryQuery::new(&id);
        let action = core.handle_datagram(&query.to_bytes(), peer_addr(), Instant::now(), responder);
        let DatagramAction::Reply { packet, to } = action else {
            panic!("expected reply, got {:?}", action);
        };
        assert_eq!(to, peer_addr());
        let DiscoveryPacket::Response(response) = DiscoveryPacket::parse(&packet).unwrap() else {
            panic!("expected response");
        };
        assert_eq!(response.service_port, 7000);
        assert!(response.is_this_network(&id, "192.168.1.10".parse().unwrap()));

        // Same broadcast heard again on another interface
        let again = core.handle_datagram(&query.to_bytes(), peer_addr(), Instant::now(), responder);
        assert_eq!(again, DatagramAction::Ignore);
    }

    #[test]
    fn test_untracked_network_ignored() {
        let mut core = DiscoveryCore::new(HashSet::new());
        core.track(network(1), 7000);
        let query = DiscoveryQuery::new(&network(2));
        let action = core.handle_datagram(&query.to_bytes(), peer_addr(), Instant::now(), responder);
        assert_eq!(action, DatagramAction::Ignore);
    }

    #[test]
    fn test_self_originated_dropped() {
        let id = network(1);
        let mut core = DiscoveryCore::new(["192.168.1.20".parse().unwrap()].into_iter().collect());
        core.track(id.clone(), 7000);
        let query = DiscoveryQuery::new(&id);
        let action = core.handle_datagram(&query.to_bytes(), peer_addr(), Instant::now(), responder);
        assert_eq!(action, DatagramAction::Ignore);
    }

    #[test]
    fn test_response_requires_outstanding_challenge() {
        let id = network(1);
        let now = Instant::now();
        let mut core = DiscoveryCore::new(HashSet::new());
        core.set_announcing(id.clone(), true);

        // Unsolicited response with a challenge we never sent
        let unsolicited = DiscoveryResponse::new(&id, [1u8; 32], peer_addr().ip(), 7000);
        assert_eq!(
            core.handle_datagram(&unsolicited.to_bytes(), peer_addr(), now, responder),
            DatagramAction::Ignore
        );

        let query = core.new_query(&id, now);
        let response = DiscoveryResponse::new(&id, query.challenge, peer_addr().ip(), 7000);
        let action = core.handle_datagram(&response.to_bytes(), peer_addr(), now, responder);
        assert_eq!(
            action,
            DatagramAction::Discovered {
                network_id: id.clone(),
                endpoint: "192.168.1.20:7000".parse().unwrap(),
            }
        );

        // Reported once per expiry window
        let again = core.handle_datagram(&response.to_bytes(), peer_addr(), now, responder);
        assert_eq!(again, DatagramAction::Ignore);
    }

    #[test]
    fn test_expired_challenge_rejected() {
        let id = network(1);
        let sent = Instant::now();
        let mut core = DiscoveryCore::new(HashSet::new());
        core.set_announcing(id.clone(), true);
        let query = core.new_query(&id, sent);
        let response = DiscoveryResponse::new(&id, query.challenge, peer_addr().ip(), 7000);

        let late = sent + QUERY_EXPIRY + Duration::from_millis(10);
        assert_eq!(
            core.handle_datagram(&response.to_bytes(), peer_addr(), late, responder),
            DatagramAction::Ignore
        );
    }

    #[test]
    fn test_response_from_wrong_ip_rejected() {
        let id = network(1);
        let now = Instant::now();
        let mut core = DiscoveryCore::new(HashSet::new());
        core.set_announcing(id.clone(), true);
        let query = core.new_query(&id, now);
        // Signed for a different responder address than the datagram source
        let response = DiscoveryResponse::new(&id, query.challenge, "192.168.1.99".parse().unwrap(), 7000);
        assert_eq!(
            core.handle_datagram(&response.to_bytes(), peer_addr(), now, responder),
            DatagramAction::Ignore
        );
    }

    #[test]
    fn test_stop_announcing_forgets_challenges() {
        let id = network(1);
        let now = Instant::now();
        let mut core = DiscoveryCore::new(HashSet::new());
        core.set_announcing(id.clone(), true);
        let query = core.new_query(&id, now);
        core.set_announcing(id.clone(), false);

        let response = DiscoveryResponse::new(&id, query.challenge, peer_addr().ip(), 7000);
        assert_eq!(
            core.handle_datagram(&response.to_bytes(), peer_addr(), now, responder),
            DatagramAction::Ignore
        );
    }

    #[test]
    fn test_local_ip_change_detection() {
        let mut core = DiscoveryCore::new(["10.0.0.1".parse().unwrap()].into_iter().collect());
        assert!(!core.set_local_ips(["10.0.0.1".parse().unwrap()].into_iter().collect()));
        assert!(core.set_local_ips(
            ["10.0.0.1".parse().unwrap(), "192.168.5.2".parse().unwrap()]
                .into_iter()
                .collect()
        ));
        // Losing an interface is not a reason to re-announce
        assert!(!core.set_local_ips(["192.168.5.2".parse().unwrap()].into_iter().collect()));
    }

    #[test]
    fn test_directed_broadcast() {
        let ip: Ipv4Addr = "192.168.1.37".parse().unwrap();
        assert_eq!(
            directed_broadcast(ip, "255.255.255.0".parse().unwrap()),
            Some("192.168.1.255".parse().unwrap())
        );
        assert_eq!(
            directed_broadcast("10.4.3.2".parse().unwrap(), "255.252.0.0".parse().unwrap()),
            Some("10.7.255.255".parse().unwrap())
        );
        assert_eq!(directed_broadcast(ip, "255.255.255.254".parse().unwrap()), None);
        assert_eq!(directed_broadcast(ip, Ipv4Addr::BROADCAST), None);
    }

    fn wired() -> LocalInterface {
        LocalInterface {
            ip: "192.168.1.37".parse().unwrap(),
            broadcast: Some("192.168.1.255".parse().unwrap()),
            index: 2,
        }
    }

    fn wireless() -> LocalInterface {
        LocalInterface {
            ip: "10.8.0.5".parse().unwrap(),
            broadcast: Some("10.8.255.255".parse().unwrap()),
            index: 3,
        }
    }

    #[test]
    fn test_announce_reaches_every_subnet() {
        let link_local = LocalInterface {
            ip: "fe80::1".parse().unwrap(),
            broadcast: None,
            index: 3,
        };
        let targets = announce_targets(&[wired(), wireless(), link_local], 4567);
        assert_eq!(targets[0], "255.255.255.255:4567".parse().unwrap());
        assert!(targets.contains(&"192.168.1.255:4567".parse().unwrap()));
        assert!(targets.contains(&"10.8.255.255:4567".parse().unwrap()));
        assert!(targets.contains(&SocketAddr::V6(SocketAddrV6::new(IPV6_MULTICAST_GROUP, 4567, 0, 3))));
        assert_eq!(targets.len(), 5);
    }

    #[test]
    fn test_new_interface_gets_its_own_targets() {
        let known = vec![wired()];
        let added = new_interfaces(&known, &[wired(), wireless()]);
        assert_eq!(added, vec![wireless()]);
        assert_eq!(
            interface_targets(&added, 4567),
            vec!["10.8.255.255:4567".parse::<SocketAddr>().unwrap()]
        );
        assert!(new_interfaces(&[wired(), wireless()], &[wired()]).is_empty());
    }

    #[tokio::test]
    async fn test_ipv6_socket_shares_port_with_ipv4() {
        if StdUdpSocket::bind("[::1]:0").is_err() {
            // host without IPv6
            return;
        }
        let mut config = NetworkConfig::default();
        config.discovery_port = 0;
        let discovery = LocalPeerDiscovery::bind(config).await.unwrap();
        let socket_v6 = discovery.broadcaster.socket_v6.as_ref().expect("IPv6 socket missing");
        assert_eq!(socket_v6.local_addr().unwrap().port(), discovery.port());
    }

    #[tokio::test]
    async fn test_two_nodes_discover_over_loopback() {
        let id = network(3);
        let responder_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let querier_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let mut responder_core = DiscoveryCore::new(HashSet::new());
        responder_core.track(id.clone(), 9100);
        let mut querier_core = DiscoveryCore::new(HashSet::new());
        querier_core.set_announcing(id.clone(), true);

        let query = querier_core.new_query(&id, Instant::now());
        querier_socket
            .send_to(&query.to_bytes(), responder_socket.local_addr().unwrap())
            .await
            .unwrap();

        let mut buf = [0u8; 256];
        let (len, from) = responder_socket.recv_from(&mut buf).await.unwrap();
        let DatagramAction::Reply { packet, to } =
            responder_core.handle_datagram(&buf[..len], from, Instant::now(), local_ip_towards)
        else {
            panic!("expected reply");
        };
        responder_socket.send_to(&packet, to).await.unwrap();

        let (len, from) = querier_socket.recv_from(&mut buf).await.unwrap();
        let action = querier_core.handle_datagram(&buf[..len], from, Instant::now(), local_ip_towards);
        assert_eq!(
            action,
            DatagramAction::Discovered {
                network_id: id,
                endpoint: "127.0.0.1:9100".parse().unwrap(),
            }
        );
    }
}
