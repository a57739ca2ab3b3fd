//! BitChat Network - TCP Relay
//!
//! Rendezvous for peers behind restrictive NATs:
//! - `TcpRelayService` runs on a publicly reachable node, records which
//!   clients are registered for which network IDs and answers queries with
//!   their endpoints
//! - `TcpRelayClient` keeps up to N relay connections alive, registers our
//!   networks on each and fans queries out to all of them
//!
//! A relay only ever learns endpoints. Chat traffic never passes through it.
//!
//! Wire frame: `kind(1) | length(2, LE) | payload`

use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use futures::future::join_all;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::NetworkConfig;
use crate::identifier::{Identifier, IdentifierError};
use crate::peer_endpoint::{normalize_endpoint, read_endpoint_list, write_endpoint_list, EndpointError};
use crate::tracker::DhtNode;

// =============================================================================
// Error Types
// =============================================================================

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Relay request timed out")]
    Timeout,

    #[error("Relay connection is out of sync")]
    Broken,

    #[error("Unknown frame kind: {0:#04x}")]
    UnknownKind(u8),

    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Payload too large: {0} bytes")]
    TooLarge(usize),

    #[error("Relay error: {0}")]
    Remote(String),

    #[error("Unexpected reply: {0:?}")]
    UnexpectedReply(RelayFrameKind),
}

pub type RelayResult<T> = Result<T, RelayError>;

impl From<IdentifierError> for RelayError {
    fn from(e: IdentifierError) -> Self {
        RelayError::Malformed(e.to_string())
    }
}

impl From<EndpointError> for RelayError {
    fn from(e: EndpointError) -> Self {
        RelayError::Malformed(e.to_string())
    }
}

// =============================================================================
// Constants
// =============================================================================

/// Idle time after which the service drops a client
pub const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Statistics reporting interval
pub const STATS_INTERVAL: Duration = Duration::from_secs(60);

const MAX_PAYLOAD: usize = u16::MAX as usize;

/// DHT key under which relay nodes announce themselves
pub fn relay_network_id() -> Identifier {
    let digest = Sha256::digest(b"bitchat/v1/tcp-relay");
    Identifier::new(digest[..20].to_vec()).expect("20 bytes")
}

// =============================================================================
// Frames
// =============================================================================

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayFrameKind {
    Register = 0x01,
    Unregister = 0x02,
    Query = 0x03,
    NoOp = 0x04,
    Ack = 0x10,
    Peers = 0x11,
    Error = 0x1f,
}

impl RelayFrameKind {
    fn from_u8(val: u8) -> Option<Self> {
        match val {
            0x01 => Some(Self::Register),
            0x02 => Some(Self::Unregister),
            0x03 => Some(Self::Query),
            0x04 => Some(Self::NoOp),
            0x10 => Some(Self::Ack),
            0x11 => Some(Self::Peers),
            0x1f => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayFrame {
    pub kind: RelayFrameKind,
    pub payload: Bytes,
}

impl RelayFrame {
    pub fn new(kind: RelayFrameKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    pub fn empty(kind: RelayFrameKind) -> Self {
        Self::new(kind, Bytes::new())
    }

    pub fn error(message: &str) -> Self {
        Self::new(RelayFrameKind::Error, Bytes::copy_from_slice(message.as_bytes()))
    }

    pub fn encode(&self) -> RelayResult<Bytes> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(RelayError::TooLarge(self.payload.len()));
        }
        let mut buf = BytesMut::with_capacity(3 + self.payload.len());
        buf.put_u8(self.kind as u8);
        buf.put_u16_le(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> RelayResult<Self> {
        let mut header = [0u8; 3];
        reader.read_exact(&mut header).await?;
        let kind = RelayFrameKind::from_u8(header[0]).ok_or(RelayError::UnknownKind(header[0]))?;
        let len = u16::from_le_bytes([header[1], header[2]]) as usize;
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        Ok(Self::new(kind, payload))
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> RelayResult<()> {
        writer.write_all(&self.encode()?).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Register/Unregister payload: `port(2, LE) | count(1) | identifiers`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Registration {
    pub service_port: u16,
    pub networks: Vec<Identifier>,
}

impl Registration {
    pub fn encode(&self) -> RelayResult<Bytes> {
        if self.networks.len() > u8::MAX as usize {
            return Err(RelayError::TooLarge(self.networks.len()));
        }
        let mut buf = BytesMut::new();
        buf.put_u16_le(self.service_port);
        buf.put_u8(self.networks.len() as u8);
        for id in &self.networks {
            id.write_to(&mut buf);
        }
        Ok(buf.freeze())
    }

    pub fn decode(mut data: Bytes) -> RelayResult<Self> {
        if data.remaining() < 3 {
            return Err(RelayError::Malformed("short registration".into()));
        }
        let service_port = data.get_u16_le();
        let count = data.get_u8() as usize;
        let mut networks = Vec::with_capacity(count);
        for _ in 0..count {
            networks.push(Identifier::read_from(&mut data)?);
        }
        Ok(Self {
            service_port,
            networks,
        })
    }
}

// =============================================================================
// Relay Service
// =============================================================================

type ClientId = u64;

/// Relay statistics
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_clients: u64,
    pub queries_answered: u64,
}

/// Server side of the relay
pub struct TcpRelayService {
    /// Registered endpoints: network ID -> client -> advertised endpoint
    registrations: DashMap<Identifier, HashMap<ClientId, SocketAddr>>,
    /// Networks per client (for cleanup)
    client_networks: DashMap<ClientId, HashSet<Identifier>>,
    next_client: AtomicU64,
    idle_timeout: Duration,
    stats: RwLock<RelayStats>,
}

impl Default for TcpRelayService {
    fn default() -> Self {
        Self::with_idle_timeout(CLIENT_IDLE_TIMEOUT)
    }
}

impl TcpRelayService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_idle_timeout(idle_timeout: Duration) -> Self {
        Self {
            registrations: DashMap::new(),
            client_networks: DashMap::new(),
            next_client: AtomicU64::new(1),
            idle_timeout,
            stats: RwLock::new(RelayStats::default()),
        }
    }

    /// Accept clients until the listener fails
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> RelayResult<()> {
        log::info!("TCP relay listening on {}", listener.local_addr()?);
        loop {
            let (stream, remote) = listener.accept().await?;
            let _ = stream.set_nodelay(true);
            let service = self.clone();
            tokio::spawn(async move {
                if let Err(e) = service.handle_client(stream, remote).await {
                    log::debug!("Relay client {} closed: {}", remote, e);
                }
            });
        }
    }

    /// Serve one client connection until it closes, errors or idles out
    pub async fn handle_client<S>(&self, mut stream: S, remote: SocketAddr) -> RelayResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let client = self.next_client.fetch_add(1, Ordering::Relaxed);
        let remote = normalize_endpoint(remote);
        {
            let mut stats = self.stats.write().await;
            stats.total_connections += 1;
            stats.active_clients += 1;
        }
        log::debug!("Relay client {} connected from {}", client, remote);

        let result = self.client_loop(&mut stream, client, remote).await;

        self.remove_client(client);
        self.stats.write().await.active_clients -= 1;
        log::debug!("Relay client {} from {} disconnected", client, remote);
        result
    }

    async fn client_loop<S>(&self, stream: &mut S, client: ClientId, remote: SocketAddr) -> RelayResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let frame = match timeout(self.idle_timeout, RelayFrame::read_from(stream)).await {
                Ok(Ok(frame)) => frame,
                Ok(Err(RelayError::Io(e))) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    log::info!("Dropping idle relay client {}", remote);
                    return Ok(());
                }
            };

            let reply = match frame.kind {
                RelayFrameKind::Register => match Registration::decode(frame.payload) {
                    Ok(reg) => {
                        let endpoint = SocketAddr::new(remote.ip(), reg.service_port);
                        for id in reg.networks {
                            self.register(client, id, endpoint);
                        }
                        RelayFrame::empty(RelayFrameKind::Ack)
                    }
                    Err(e) => RelayFrame::error(&e.to_string()),
                },
                RelayFrameKind::Unregister => match Registration::decode(frame.payload) {
                    Ok(reg) => {
                        for id in &reg.networks {
                            self.unregister(client, id);
                        }
                        RelayFrame::empty(RelayFrameKind::Ack)
                    }
                    Err(e) => RelayFrame::error(&e.to_string()),
                },
                RelayFrameKind::Query => {
                    let mut payload = frame.payload;
                    match Identifier::read_from(&mut payload) {
                        Ok(id) => {
                            let peers = self.query(&id, client);
                            self.stats.write().await.queries_answered += 1;
                            let mut buf = BytesMut::new();
                            let peers = &peers[..peers.len().min(u8::MAX as usize)];
                            write_endpoint_list(&mut buf, peers)?;
                            RelayFrame::new(RelayFrameKind::Peers, buf.freeze())
                        }
                        Err(e) => RelayFrame::error(&e.to_string()),
                    }
                }
                RelayFrameKind::NoOp => RelayFrame::empty(RelayFrameKind::Ack),
                other => RelayFrame::error(&format!("unexpected frame {:?}", other)),
            };
            reply.write_to(stream).await?;
        }
    }

    pub fn register(&self, client: ClientId, network_id: Identifier, endpoint: SocketAddr) {
        log::debug!("Relay client {} registered {} at {}", client, network_id.short(), endpoint);
        self.registrations
            .entry(network_id.clone())
            .or_default()
            .insert(client, endpoint);
        self.client_networks.entry(client).or_default().insert(network_id);
    }

    pub fn unregister(&self, client: ClientId, network_id: &Identifier) {
        if let Some(mut clients) = self.registrations.get_mut(network_id) {
            clients.remove(&client);
        }
        self.registrations.remove_if(network_id, |_, clients| clients.is_empty());
        if let Some(mut networks) = self.client_networks.get_mut(&client) {
            networks.remove(network_id);
        }
    }

    /// Endpoints registered for `network_id`, excluding the querier's own
    pub fn query(&self, network_id: &Identifier, querier: ClientId) -> Vec<SocketAddr> {
        let Some(clients) = self.registrations.get(network_id) else {
            return Vec::new();
        };
        let own = clients.get(&querier).copied();
        let mut peers: Vec<SocketAddr> = clients
            .iter()
            .filter(|(id, ep)| **id != querier && Some(**ep) != own)
            .map(|(_, ep)| *ep)
            .collect();
        peers.sort();
        peers.dedup();
        peers
    }

    pub fn remove_client(&self, client: ClientId) {
        if let Some((_, networks)) = self.client_networks.remove(&client) {
            for id in networks {
                if let Some(mut clients) = self.registrations.get_mut(&id) {
                    clients.remove(&client);
                }
                self.registrations.remove_if(&id, |_, clients| clients.is_empty());
            }
        }
    }

    pub fn network_count(&self) -> usize {
        self.registrations.len()
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    /// Log statistics periodically
    pub async fn stats_task(self: Arc<Self>) {
        let mut interval = tokio::time::interval(STATS_INTERVAL);
        loop {
            interval.tick().await;
            let stats = self.stats().await;
            log::info!(
                "Relay stats: {} active clients, {} total connections, {} networks, {} queries",
                stats.active_clients,
                stats.total_connections,
                self.network_count(),
                stats.queries_answered
            );
        }
    }
}

// =============================================================================
// Relay Client
// =============================================================================

/// One long-lived connection to a relay node
struct RelayConnection {
    endpoint: SocketAddr,
    stream: Mutex<TcpStream>,
    /// Set once an exchange was cut short; the next reply on the stream may belong to it
    broken: AtomicBool,
}

impl RelayConnection {
    async fn connect(endpoint: SocketAddr, connect_timeout: Duration) -> RelayResult<Self> {
        let stream = match timeout(connect_timeout, TcpStream::connect(endpoint)).await {
            Ok(stream) => stream?,
            Err(_) => return Err(RelayError::Timeout),
        };
        let _ = stream.set_nodelay(true);
        Ok(Self {
            endpoint,
            stream: Mutex::new(stream),
            broken: AtomicBool::new(false),
        })
    }

    /// Send `frame` and wait for the reply; one exchange at a time per connection
    async fn request(&self, frame: RelayFrame, request_timeout: Duration) -> RelayResult<RelayFrame> {
        if self.is_broken() {
            return Err(RelayError::Broken);
        }
        let exchange = async {
            let mut stream = self.stream.lock().await;
            if self.is_broken() {
                return Err(RelayError::Broken);
            }
            frame.write_to(&mut *stream).await?;
            RelayFrame::read_from(&mut *stream).await
        };
        let reply = match timeout(request_timeout, exchange).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                self.broken.store(true, Ordering::SeqCst);
                return Err(e);
            }
            Err(_) => {
                self.broken.store(true, Ordering::SeqCst);
                return Err(RelayError::Timeout);
            }
        };
        match reply.kind {
            RelayFrameKind::Error => Err(RelayError::Remote(String::from_utf8_lossy(&reply.payload).to_string())),
            _ => Ok(reply),
        }
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    async fn expect_ack(&self, frame: RelayFrame, request_timeout: Duration) -> RelayResult<()> {
        let reply = self.request(frame, request_timeout).await?;
        match reply.kind {
            RelayFrameKind::Ack => Ok(()),
            other => Err(RelayError::UnexpectedReply(other)),
        }
    }
}

struct ClientShared {
    config: NetworkConfig,
    service_port: u16,
    dht: Option<Arc<dyn DhtNode>>,
    relays: RwLock<HashMap<SocketAddr, Arc<RelayConnection>>>,
    networks: RwLock<HashSet<Identifier>>,
}

/// Client side of the relay
pub struct TcpRelayClient {
    shared: Arc<ClientShared>,
    maintenance: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TcpRelayClient {
    pub fn new(config: NetworkConfig, service_port: u16, dht: Option<Arc<dyn DhtNode>>) -> Self {
        Self {
            shared: Arc::new(ClientShared {
                config,
                service_port,
                dht,
                relays: RwLock::new(HashMap::new()),
                networks: RwLock::new(HashSet::new()),
            }),
            maintenance: std::sync::Mutex::new(None),
        }
    }

    /// Start the maintenance loop (keep-alive, eviction, replacement)
    pub fn start(&self) {
        let mut guard = match self.maintenance.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.is_some() {
            return;
        }
        let shared = self.shared.clone();
        *guard = Some(tokio::spawn(async move {
            loop {
                Self::maintain_shared(&shared).await;
                tokio::time::sleep(shared.config.relay_keepalive_interval()).await;
            }
        }));
    }

    pub async fn stop(&self) {
        let task = match self.maintenance.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            task.abort();
        }
        self.shared.relays.write().await.clear();
    }

    /// Run one maintenance pass now
    pub async fn maintain(&self) {
        Self::maintain_shared(&self.shared).await;
    }

    pub async fn connected_relays(&self) -> Vec<SocketAddr> {
        let mut relays: Vec<SocketAddr> = self.shared.relays.read().await.keys().copied().collect();
        relays.sort();
        relays
    }

    /// Register `network_id` on every connected relay
    pub async fn register_network(&self, network_id: Identifier) {
        if !self.shared.networks.write().await.insert(network_id.clone()) {
            return;
        }
        let registration = Registration {
            service_port: self.shared.service_port,
            networks: vec![network_id],
        };
        Self::for_each_relay(&self.shared, RelayFrameKind::Register, &registration).await;
    }

    pub async fn unregister_network(&self, network_id: &Identifier) {
        if !self.shared.networks.write().await.remove(network_id) {
            return;
        }
        let registration = Registration {
            service_port: self.shared.service_port,
            networks: vec![network_id.clone()],
        };
        Self::for_each_relay(&self.shared, RelayFrameKind::Unregister, &registration).await;
    }

    /// Ask every relay for peers of `network_id` and merge the answers
    pub async fn query_peers(&self, network_id: &Identifier) -> Vec<SocketAddr> {
        let relays: Vec<Arc<RelayConnection>> = self.shared.relays.read().await.values().cloned().collect();
        let mut query = BytesMut::new();
        network_id.write_to(&mut query);
        let query = query.freeze();
        let request_timeout = self.shared.config.relay_request_timeout();

        let shared = &self.shared;
        let results = join_all(relays.iter().map(|relay| {
            let frame = RelayFrame::new(RelayFrameKind::Query, query.clone());
            async move {
                let result = relay.request(frame, request_timeout).await;
                Self::evict_broken(shared, relay).await;
                (relay.endpoint, result)
            }
        }))
        .await;

        let mut peers = Vec::new();
        let mut failed = Vec::new();
        for (endpoint, result) in results {
            let parsed = result.and_then(|reply| match reply.kind {
                RelayFrameKind::Peers => {
                    let mut payload = reply.payload;
                    Ok(read_endpoint_list(&mut payload)?)
                }
                other => Err(RelayError::UnexpectedReply(other)),
            });
            match parsed {
                Ok(found) => {
                    for peer in found {
                        if !peers.contains(&peer) {
                            peers.push(peer);
                        }
                    }
                }
                Err(e) => {
                    log::debug!("Relay {} query failed: {}", endpoint, e);
                    failed.push(endpoint);
                }
            }
        }
        Self::evict(&self.shared, &failed).await;
        peers
    }

    async fn for_each_relay(shared: &ClientShared, kind: RelayFrameKind, registration: &Registration) {
        let payload = match registration.encode() {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("Cannot encode relay registration: {}", e);
                return;
            }
        };
        let relays: Vec<Arc<RelayConnection>> = shared.relays.read().await.values().cloned().collect();
        let request_timeout = shared.config.relay_request_timeout();
        let results = join_all(relays.iter().map(|relay| {
            let frame = RelayFrame::new(kind, payload.clone());
            async move {
                let result = relay.expect_ack(frame, request_timeout).await;
                Self::evict_broken(shared, relay).await;
                (relay.endpoint, result)
            }
        }))
        .await;

        let failed: Vec<SocketAddr> = results
            .into_iter()
            .filter_map(|(endpoint, result)| match result {
                Ok(()) => None,
                Err(e) => {
                    log::debug!("Relay {} rejected {:?}: {}", endpoint, kind, e);
                    Some(endpoint)
                }
            })
            .collect();
        Self::evict(shared, &failed).await;
    }

    async fn evict(shared: &ClientShared, endpoints: &[SocketAddr]) {
        if endpoints.is_empty() {
            return;
        }
        let mut relays = shared.relays.write().await;
        for endpoint in endpoints {
            if relays.remove(endpoint).is_some() {
                log::info!("Evicted relay {}", endpoint);
            }
        }
    }

    /// Drop `relay` from the pool as soon as its stream can no longer be trusted
    async fn evict_broken(shared: &ClientShared, relay: &Arc<RelayConnection>) {
        if !relay.is_broken() {
            return;
        }
        let mut relays = shared.relays.write().await;
        if relays.get(&relay.endpoint).is_some_and(|current| Arc::ptr_eq(current, relay)) {
            relays.remove(&relay.endpoint);
            log::info!("Dropped relay {} after a failed exchange", relay.endpoint);
        }
    }

    async fn maintain_shared(shared: &Arc<ClientShared>) {
        let request_timeout = shared.config.relay_request_timeout();

        // Keep-alive; a relay that does not answer is evicted
        let relays: Vec<Arc<RelayConnection>> = shared.relays.read().await.values().cloned().collect();
        let results = join_all(relays.iter().map(|relay| async move {
            let result = relay.expect_ack(RelayFrame::empty(RelayFrameKind::NoOp), request_timeout).await;
            Self::evict_broken(shared, relay).await;
            (relay.endpoint, result)
        }))
        .await;
        let failed: Vec<SocketAddr> = results
            .into_iter()
            .filter(|(_, result)| result.is_err())
            .map(|(endpoint, _)| endpoint)
            .collect();
        Self::evict(shared, &failed).await;

        let missing = shared
            .config
            .relay_max_connections
            .saturating_sub(shared.relays.read().await.len());
        if missing == 0 {
            return;
        }

        // Candidates: static seeds first, then relays announced on the DHT
        let mut candidates = shared.config.relay_seeds.clone();
        if let Some(dht) = &shared.dht {
            match dht.find_peers(&relay_network_id()).await {
                Ok(found) => candidates.extend(found),
                Err(e) => log::debug!("DHT relay lookup failed: {}", e),
            }
        }

        let networks: Vec<Identifier> = shared.networks.read().await.iter().cloned().collect();
        let mut added = 0;
        for candidate in candidates {
            if added >= missing {
                break;
            }
            if shared.relays.read().await.contains_key(&candidate) || failed.contains(&candidate) {
                continue;
            }
            match Self::open_relay(shared, candidate, &networks).await {
                Ok(relay) => {
                    shared.relays.write().await.insert(candidate, Arc::new(relay));
                    log::info!("Connected to relay {}", candidate);
                    added += 1;
                }
                Err(e) => log::debug!("Relay candidate {} failed: {}", candidate, e),
            }
        }
    }

    async fn open_relay(
        shared: &ClientShared,
        endpoint: SocketAddr,
        networks: &[Identifier],
    ) -> RelayResult<RelayConnection> {
        let relay = RelayConnection::connect(endpoint, shared.config.connect_timeout()).await?;
        if !networks.is_empty() {
            let registration = Registration {
                service_port: shared.service_port,
                networks: networks.to_vec(),
            };
            relay
                .expect_ack(
                    RelayFrame::new(RelayFrameKind::Register, registration.encode()?),
                    shared.config.relay_request_timeout(),
                )
                .await?;
        }
        Ok(relay)
    }
}

impl Drop for TcpRelayClient {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.maintenance.lock() {
            if let Some(task) = guard.take() {
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

    #[test]
    fn test_frame_encoding() {
        let frame = RelayFrame::new(RelayFrameKind::Query, vec![1, 2, 3]);
        let bytes = frame.encode().unwrap();
        assert_eq!(bytes.as_ref(), &[0x03, 3, 0, 1, 2, 3]);
        assert!(RelayFrame::new(RelayFrameKind::Peers, vec![0u8; 70_000]).encode().is_err());
    }

    #[tokio::test]
    async fn test_frame_read_unknown_kind() {
        let data = [0x7fu8, 0, 0];
        let mut reader = &data[..];
        assert!(matches!(
            RelayFrame::read_from(&mut reader).await,
            Err(RelayError::UnknownKind(0x7f))
        ));
    }

    #[test]
    fn test_registration_roundtrip() {
        let reg = Registration {
            service_port: 4000,
            networks: vec![network(1), network(2)],
        };
        assert_eq!(Registration::decode(reg.encode().unwrap()).unwrap(), reg);
        assert!(Registration::decode(Bytes::from_static(&[1])).is_err());
    }

    #[test]
    fn test_query_excludes_querier() {
        let service = TcpRelayService::default();
        let a: SocketAddr = "198.51.100.1:4000".parse().unwrap();
        let b: SocketAddr = "198.51.100.2:4000".parse().unwrap();
        service.register(1, network(1), a);
        service.register(2, network(1), b);
        service.register(3, network(2), b);

        assert_eq!(service.query(&network(1), 1), vec![b]);
        assert_eq!(service.query(&network(1), 9), vec![a, b]);
        assert!(service.query(&network(3), 1).is_empty());

        service.remove_client(2);
        assert!(service.query(&network(1), 1).is_empty());
        assert_eq!(service.query(&network(2), 1), vec![b]);
        assert_eq!(service.network_count(), 2);

        service.unregister(1, &network(1));
        assert_eq!(service.network_count(), 1);
    }

    #[tokio::test]
    async fn test_client_registers_and_queries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = listener.local_addr().unwrap();
        let service = TcpRelayService::new();
        tokio::spawn(service.clone().serve(listener));

        let mut config = NetworkConfig::default();
        config.relay_seeds = vec![relay_addr];

        let alice = TcpRelayClient::new(config.clone(), 5001, None);
        let bob = TcpRelayClient::new(config, 5002, None);
        alice.maintain().await;
        bob.maintain().await;
        assert_eq!(alice.connected_relays().await, vec![relay_addr]);

        alice.register_network(network(7)).await;
        bob.register_network(network(7)).await;

        let peers = bob.query_peers(&network(7)).await;
        assert_eq!(peers, vec!["127.0.0.1:5001".parse::<SocketAddr>().unwrap()]);
        assert!(alice.query_peers(&network(8)).await.is_empty());

        alice.unregister_network(&network(7)).await;
        assert!(bob.query_peers(&network(7)).await.is_empty());
        assert_eq!(service.stats().await.active_clients, 2);
    }

    #[tokio::test]
    async fn test_dead_relay_evicted() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = listener.local_addr().unwrap();
        let service = TcpRelayService::new();
        let server = tokio::spawn(service.clone().serve(listener));

        let mut config = NetworkConfig::default();
        config.relay_seeds = vec![relay_addr];
        config.relay_request_timeout_secs = 1;
        let client = TcpRelayClient::new(config, 5001, None);
        client.maintain().await;
        assert_eq!(client.connected_relays().await.len(), 1);

        // Accepted connections keep running; a raw listener that never answers replaces it
        server.abort();
        let _ = server.await;
        client.shared.relays.write().await.clear();
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let silent_addr = silent.local_addr().unwrap();
        let relay = RelayConnection::connect(silent_addr, Duration::from_secs(1)).await.unwrap();
        client.shared.relays.write().await.insert(silent_addr, Arc::new(relay));

        client.maintain().await;
        assert!(!client.connected_relays().await.contains(&silent_addr));
    }

    #[tokio::test]
    async fn test_timed_out_relay_ignores_late_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = RelayFrame::read_from(&mut stream).await;
            let _ = release_rx.await;
            // answers the query after the client gave up on it
            let _ = RelayFrame::empty(RelayFrameKind::Ack).write_to(&mut stream).await;
            let _ = RelayFrame::read_from(&mut stream).await;
        });

        let mut config = NetworkConfig::default();
        config.relay_request_timeout_secs = 1;
        let client = TcpRelayClient::new(config, 5001, None);
        let relay = Arc::new(RelayConnection::connect(addr, Duration::from_secs(1)).await.unwrap());
        client.shared.relays.write().await.insert(addr, relay.clone());

        assert!(client.query_peers(&network(1)).await.is_empty());
        assert!(client.connected_relays().await.is_empty());

        release_tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let reply = relay
            .expect_ack(RelayFrame::empty(RelayFrameKind::NoOp), Duration::from_secs(1))
            .await;
        assert!(matches!(reply, Err(RelayError::Broken)));
    }

    #[tokio::test]
    async fn test_idle_client_dropped() {
        let service = Arc::new(TcpRelayService::with_idle_timeout(Duration::from_millis(50)));
        let (client, server) = tokio::io::duplex(1024);
        let remote: SocketAddr = "203.0.113.9:1000".parse().unwrap();
        let handle = tokio::spawn({
            let service = service.clone();
            async move { service.handle_client(server, remote).await }
        });
        let result = tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert!(result.is_ok());
        drop(client);
        assert_eq!(service.stats().await.active_clients, 0);
    }
}
