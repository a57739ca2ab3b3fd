//! BitChat Network - Virtual Peer Network
//!
//! One overlay per chat on top of authenticated physical connections:
//! - dials discovered endpoints and accepts inbound channels named after the
//!   network id
//! - checks the remote identity before a session may join (private chats)
//! - keeps one `VirtualPeer` per member and fans session activity out as
//!   `NetworkEvent`s
//! - re-dials once when a session we dialed drops unexpectedly
//!
//! `NetworkRegistry` routes inbound channels to their network and rejects
//! network id collisions between chats.

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock as StdRwLock, Weak};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use zeroize::Zeroizing;

use crate::channel::{
    AuthenticatedStream, AuthenticationError, BoxedStream, ChannelRole, ConnectionManager, LocalIdentity,
    PeerCertificate, SecureChannel,
};
use crate::config::NetworkConfig;
use crate::descriptor::{private_network_id, NetworkDescriptor, NetworkType};
use crate::identifier::Identifier;
use crate::mux::{DataStream, MuxError};
use crate::peer_endpoint::{normalize_endpoint, PeerEndpointInfo};
use crate::virtual_peer::VirtualPeer;
use crate::virtual_session::{CloseReason, SessionEvent, SessionId, VirtualSession};

// =============================================================================
// Error Types
// =============================================================================

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Network disposed")]
    Disposed,

    #[error("Network is offline")]
    Offline,

    #[error("Peer not online: {0}")]
    PeerOffline(String),

    #[error("Authentication failed: {0}")]
    Authentication(#[from] AuthenticationError),

    #[error("Peer identity conflict: {actual} may not join this network")]
    PeerIdentityConflict { expected: Option<String>, actual: String },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Network id {0} is already used by another chat")]
    NetworkIdCollision(String),

    #[error("No network for channel {0}")]
    UnknownNetwork(String),

    #[error("Connection attempt timed out")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Stream error: {0}")]
    Mux(#[from] MuxError),
}

pub type NetworkResult<T> = Result<T, NetworkError>;

// =============================================================================
// Constants
// =============================================================================

/// Session events buffered between the read loops and the pump
const SESSION_EVENT_QUEUE: usize = 256;

// =============================================================================
// Events
// =============================================================================

/// Identity and trust problems worth showing to the user
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SecurityEvent {
    /// A remote holding the network secret is not the peer this chat is bound to
    PeerIdentityConflict {
        endpoint: SocketAddr,
        expected: Option<String>,
        actual: String,
    },
    AuthenticationFailed { endpoint: SocketAddr, reason: String },
    CertificateRevoked { peer: String },
    ProtocolViolation { peer: String, reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetworkEvent {
    /// First time this member is known
    PeerAdded { peer: String },
    PeerOnline { peer: String },
    PeerOffline { peer: String },
    MessageReceived { peer: String, payload: Bytes },
    /// Remote opened a sub-stream; claim it with `accept_stream`
    StreamOpened {
        peer: String,
        session_id: SessionId,
        port: u16,
    },
    Security(SecurityEvent),
}

// =============================================================================
// Peer Binding
// =============================================================================

/// Who may join a network
#[derive(Clone, PartialEq, Eq)]
pub enum PeerBinding {
    /// Group chat: anyone holding the network secret
    Open,
    /// Private chat bound to one remote email
    Bound(String),
    /// Private chat whose remote is not known yet. The first remote whose
    /// email reproduces the network id becomes bound.
    Expected { shared_secret: Zeroizing<String> },
}

impl PeerBinding {
    pub fn for_descriptor(descriptor: &NetworkDescriptor) -> Self {
        match descriptor.network_type() {
            NetworkType::Group => Self::Open,
            NetworkType::Private => Self::Bound(descriptor.label().to_lowercase()),
        }
    }

    pub fn expected(shared_secret: &str) -> Self {
        Self::Expected {
            shared_secret: Zeroizing::new(shared_secret.to_string()),
        }
    }

    pub fn bound_email(&self) -> Option<&str> {
        match self {
            Self::Bound(email) => Some(email),
            _ => None,
        }
    }
}

impl std::fmt::Debug for PeerBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "Open"),
            Self::Bound(email) => f.debug_tuple("Bound").field(email).finish(),
            Self::Expected { .. } => write!(f, "Expected"),
        }
    }
}

// =============================================================================
// Node Context
// =============================================================================

/// Collaborators shared by every network of one node
#[derive(Clone)]
pub struct NodeContext {
    pub identity: LocalIdentity,
    pub connections: Arc<dyn ConnectionManager>,
    pub secure_channel: Arc<dyn SecureChannel>,
    pub trusted_roots: Vec<PeerCertificate>,
    pub config: NetworkConfig,
}

impl NodeContext {
    pub fn local_email(&self) -> &str {
        &self.identity.certificate.email
    }
}

// =============================================================================
// Virtual Peer Network
// =============================================================================

pub struct VirtualPeerNetwork {
    me: Weak<VirtualPeerNetwork>,
    context: NodeContext,
    descriptor: StdRwLock<NetworkDescriptor>,
    binding: StdRwLock<PeerBinding>,
    /// Members keyed by lower-cased email, ourselves excluded
    peers: RwLock<HashMap<String, Arc<VirtualPeer>>>,
    revoked: Mutex<HashSet<String>>,
    /// Endpoints with a dial in flight
    dialing: DashMap<SocketAddr, ()>,
    /// Every session started and not yet reported closed; `dispose` tears these down without awaiting
    live_sessions: DashMap<SessionId, Arc<VirtualSession>>,
    online: AtomicBool,
    disposed: AtomicBool,
    next_session_id: AtomicU64,
    session_events: mpsc::Sender<SessionEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
    event_handler: Arc<RwLock<Option<mpsc::Sender<NetworkEvent>>>>,
}

impl VirtualPeerNetwork {
    /// Create the network and start its event pump. Must run inside a tokio runtime.
    pub fn new(context: NodeContext, descriptor: NetworkDescriptor, binding: PeerBinding) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(SESSION_EVENT_QUEUE);

        let mut peers = HashMap::new();
        if let Some(email) = binding.bound_email() {
            peers.insert(email.to_string(), Arc::new(VirtualPeer::new(email)));
        }

        let network = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            context,
            descriptor: StdRwLock::new(descriptor),
            binding: StdRwLock::new(binding),
            peers: RwLock::new(peers),
            revoked: Mutex::new(HashSet::new()),
            dialing: DashMap::new(),
            live_sessions: DashMap::new(),
            online: AtomicBool::new(true),
            disposed: AtomicBool::new(false),
            next_session_id: AtomicU64::new(1),
            session_events: tx,
            pump: Mutex::new(None),
            event_handler: Arc::new(RwLock::new(None)),
        });

        let pump = tokio::spawn(Self::pump(network.me.clone(), rx));
        *lock(&network.pump) = Some(pump);

        log::info!(
            "Network {} ({:?}) created for {}",
            network.network_id().short(),
            network.network_type(),
            network.local_email()
        );
        network
    }

    pub async fn set_event_handler(&self, handler: mpsc::Sender<NetworkEvent>) {
        *self.event_handler.write().await = Some(handler);
    }

    /// Never waits on the consumer; a full queue drops the event
    async fn emit(&self, event: NetworkEvent) {
        if let Some(ref handler) = *self.event_handler.read().await {
            match handler.try_send(event) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(event)) => {
                    log::warn!("Network {}: event queue full, dropping {:?}", self.network_id().short(), event)
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn network_id(&self) -> Identifier {
        read(&self.descriptor).network_id().clone()
    }

    pub fn network_type(&self) -> NetworkType {
        read(&self.descriptor).network_type()
    }

    pub fn descriptor(&self) -> NetworkDescriptor {
        read(&self.descriptor).clone()
    }

    pub fn binding(&self) -> PeerBinding {
        read(&self.binding).clone()
    }

    /// Name of the logical channel carrying this network on a connection
    pub fn channel_name(&self) -> String {
        self.network_id().to_hex()
    }

    pub fn local_email(&self) -> &str {
        self.context.local_email()
    }

    /// Port other nodes dial to reach us
    pub fn service_port(&self) -> u16 {
        self.context.connections.local_service_port()
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.context.config
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn ensure_usable(&self) -> NetworkResult<()> {
        if self.is_disposed() {
            return Err(NetworkError::Disposed);
        }
        if !self.is_online() {
            return Err(NetworkError::Offline);
        }
        Ok(())
    }

    pub fn is_revoked(&self, email: &str) -> bool {
        lock(&self.revoked).contains(&email.to_lowercase())
    }

    // -------------------------------------------------------------------------
    // Members
    // -------------------------------------------------------------------------

    pub async fn peer(&self, email: &str) -> Option<Arc<VirtualPeer>> {
        self.peers.read().await.get(&email.to_lowercase()).cloned()
    }

    pub async fn peers(&self) -> Vec<Arc<VirtualPeer>> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn online_peers(&self) -> Vec<Arc<VirtualPeer>> {
        let mut online = Vec::new();
        for peer in self.peers().await {
            if peer.is_online().await {
                online.push(peer);
            }
        }
        online
    }

    /// Every known member with its last known endpoints
    pub async fn members(&self) -> Vec<PeerEndpointInfo> {
        let mut members = Vec::new();
        for peer in self.peers().await {
            members.push(peer.endpoint_info().await);
        }
        members
    }

    /// Members we hold an open session with
    pub async fn connected_peers(&self) -> Vec<PeerEndpointInfo> {
        let mut connected = Vec::new();
        for peer in self.online_peers().await {
            connected.push(peer.endpoint_info().await);
        }
        connected
    }

    /// Add a member known from the roster or from peer exchange
    pub async fn add_member(&self, email: &str) -> Option<Arc<VirtualPeer>> {
        if email.eq_ignore_ascii_case(self.local_email()) {
            return None;
        }
        let (peer, added) = self.get_or_add_peer(email).await;
        if added {
            self.emit(NetworkEvent::PeerAdded {
                peer: peer.email().to_string(),
            })
            .await;
        }
        Some(peer)
    }

    async fn get_or_add_peer(&self, email: &str) -> (Arc<VirtualPeer>, bool) {
        let key = email.to_lowercase();
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get(&key) {
            return (peer.clone(), false);
        }
        let peer = Arc::new(VirtualPeer::new(email));
        peers.insert(key, peer.clone());
        log::debug!("Network {}: new member {}", self.network_id().short(), email);
        (peer, true)
    }

    /// True if an online member is reachable through exactly `endpoint`
    pub async fn is_connected_via(&self, endpoint: SocketAddr) -> bool {
        for peer in self.peers().await {
            if peer.is_connected_via(endpoint).await {
                return true;
            }
        }
        false
    }

    // -------------------------------------------------------------------------
    // Connections
    // -------------------------------------------------------------------------

    /// Dial `endpoint` unless a member is already connected through it.
    /// `Ok(None)` means the attempt was skipped.
    pub async fn make_connection(&self, endpoint: SocketAddr) -> NetworkResult<Option<Arc<VirtualPeer>>> {
        self.dial(normalize_endpoint(endpoint), true).await
    }

    async fn dial(&self, endpoint: SocketAddr, may_reconnect: bool) -> NetworkResult<Option<Arc<VirtualPeer>>> {
        self.ensure_usable()?;
        if self.is_connected_via(endpoint).await {
            log::debug!("Already connected via {}", endpoint);
            return Ok(None);
        }
        if self.dialing.insert(endpoint, ()).is_some() {
            return Ok(None);
        }

        let result = timeout(
            self.context.config.connect_timeout(),
            self.connect(endpoint, may_reconnect),
        )
        .await;
        self.dialing.remove(&endpoint);

        match result {
            Ok(Ok(peer)) => Ok(Some(peer)),
            Ok(Err(e)) => {
                log::debug!("Connection to {} failed: {}", endpoint, e);
                Err(e)
            }
            Err(_) => Err(NetworkError::Timeout),
        }
    }

    async fn connect(&self, endpoint: SocketAddr, may_reconnect: bool) -> NetworkResult<Arc<VirtualPeer>> {
        let connection = self.context.connections.make_connection(endpoint).await?;
        let stream = connection.request_channel(&self.channel_name()).await?;
        let authenticated = self.authenticate(stream, ChannelRole::Client, endpoint).await?;
        self.join_network(authenticated, endpoint, ChannelRole::Client, may_reconnect)
            .await
    }

    /// Inbound counterpart of `make_connection`
    pub async fn accept_channel(
        &self,
        stream: BoxedStream,
        remote_endpoint: SocketAddr,
    ) -> NetworkResult<Arc<VirtualPeer>> {
        self.ensure_usable()?;
        let endpoint = normalize_endpoint(remote_endpoint);
        let authenticated = timeout(
            self.context.config.connect_timeout(),
            self.authenticate(stream, ChannelRole::Server, endpoint),
        )
        .await
        .map_err(|_| NetworkError::Timeout)??;
        self.join_network(authenticated, endpoint, ChannelRole::Server, false)
            .await
    }

    async fn authenticate(
        &self,
        stream: BoxedStream,
        role: ChannelRole,
        endpoint: SocketAddr,
    ) -> NetworkResult<AuthenticatedStream> {
        let secret = Zeroizing::new(read(&self.descriptor).network_secret().to_vec());
        let result = self
            .context
            .secure_channel
            .wrap(
                stream,
                role,
                &self.context.identity,
                &self.context.trusted_roots,
                &secret,
            )
            .await;

        let e = match result {
            Ok(authenticated) => return Ok(authenticated),
            Err(e) => e,
        };
        log::warn!("Authentication with {} failed: {}", endpoint, e);
        let event = match &e {
            AuthenticationError::Io(_) => None,
            AuthenticationError::Revoked(email) => Some(SecurityEvent::CertificateRevoked { peer: email.clone() }),
            other => Some(SecurityEvent::AuthenticationFailed {
                endpoint,
                reason: other.to_string(),
            }),
        };
        if let Some(event) = event {
            self.emit(NetworkEvent::Security(event)).await;
        }
        Err(e.into())
    }

    /// Attach an authenticated stream as a new session of the remote member
    pub async fn join_network(
        &self,
        stream: AuthenticatedStream,
        endpoint: SocketAddr,
        role: ChannelRole,
        may_reconnect: bool,
    ) -> NetworkResult<Arc<VirtualPeer>> {
        self.ensure_usable()?;
        let email = stream.remote_certificate.email.clone();

        if self.is_revoked(&email) {
            self.emit(NetworkEvent::Security(SecurityEvent::CertificateRevoked { peer: email.clone() }))
                .await;
            return Err(AuthenticationError::Revoked(email).into());
        }
        if email.eq_ignore_ascii_case(self.local_email()) {
            return Err(NetworkError::ProtocolViolation("connected to ourselves".into()));
        }
        if let Err(e) = self.check_binding(&email) {
            if let NetworkError::PeerIdentityConflict { expected, actual } = &e {
                log::warn!(
                    "Network {}: {} at {} does not match the bound peer",
                    self.network_id().short(),
                    actual,
                    endpoint
                );
                self.emit(NetworkEvent::Security(SecurityEvent::PeerIdentityConflict {
                    endpoint,
                    expected: expected.clone(),
                    actual: actual.clone(),
                }))
                .await;
            }
            return Err(e);
        }

        let (peer, added) = self.get_or_add_peer(&email).await;
        if added {
            self.emit(NetworkEvent::PeerAdded { peer: email.clone() }).await;
        }

        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let (session, reader) = VirtualSession::new(
            id,
            stream,
            endpoint,
            role,
            &self.context.config,
            may_reconnect,
            self.session_events.clone(),
        );
        self.live_sessions.insert(id, session.clone());
        let came_online = peer.add_session(session.clone()).await;
        session.start(reader);

        // Dispose may have raced with the handshake
        if self.is_disposed() {
            session.abort();
            return Err(NetworkError::Disposed);
        }

        log::info!(
            "Network {}: session {} with {} at {} ({:?})",
            self.network_id().short(),
            id,
            email,
            endpoint,
            role
        );
        if came_online {
            self.emit(NetworkEvent::PeerOnline { peer: email }).await;
        }
        Ok(peer)
    }

    fn check_binding(&self, email: &str) -> NetworkResult<()> {
        let email = email.to_lowercase();
        let mut binding = write(&self.binding);
        let shared_secret = match &*binding {
            PeerBinding::Open => return Ok(()),
            PeerBinding::Bound(expected) if *expected == email => return Ok(()),
            PeerBinding::Bound(expected) => {
                return Err(NetworkError::PeerIdentityConflict {
                    expected: Some(expected.clone()),
                    actual: email,
                })
            }
            PeerBinding::Expected { shared_secret } => shared_secret.clone(),
        };

        let derived = private_network_id(self.local_email(), &email, &shared_secret);
        if derived != *read(&self.descriptor).network_id() {
            return Err(NetworkError::PeerIdentityConflict {
                expected: None,
                actual: email,
            });
        }
        log::info!("Network {} bound to {}", derived.short(), email);
        *binding = PeerBinding::Bound(email);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Messaging
    // -------------------------------------------------------------------------

    /// Send on port 0 to every online member; returns how many were reached
    pub async fn send_message(&self, payload: &[u8]) -> NetworkResult<usize> {
        self.ensure_usable()?;
        let mut delivered = 0;
        for peer in self.online_peers().await {
            match peer.send_message(payload).await {
                Ok(()) => delivered += 1,
                Err(e) => log::debug!("Broadcast to {} failed: {}", peer.email(), e),
            }
        }
        Ok(delivered)
    }

    pub async fn send_message_to(&self, email: &str, payload: &[u8]) -> NetworkResult<()> {
        self.ensure_usable()?;
        let peer = self.online_peer(email).await?;
        peer.send_message(payload).await?;
        Ok(())
    }

    pub async fn open_stream(&self, email: &str) -> NetworkResult<DataStream> {
        self.ensure_usable()?;
        let peer = self.online_peer(email).await?;
        Ok(peer.open_stream().await?)
    }

    /// Claim a stream announced by `NetworkEvent::StreamOpened`
    pub async fn accept_stream(&self, email: &str, session_id: SessionId, port: u16) -> Option<DataStream> {
        self.peer(email).await?.accept_stream(session_id, port).await
    }

    async fn online_peer(&self, email: &str) -> NetworkResult<Arc<VirtualPeer>> {
        match self.peer(email).await {
            Some(peer) if peer.is_online().await => Ok(peer),
            _ => Err(NetworkError::PeerOffline(email.to_string())),
        }
    }

    // -------------------------------------------------------------------------
    // Administration
    // -------------------------------------------------------------------------

    /// Close every session of `email` and refuse it from now on
    pub async fn certificate_revoked(&self, email: &str) {
        lock(&self.revoked).insert(email.to_lowercase());
        if let Some(peer) = self.peer(email).await {
            log::warn!("Certificate of {} revoked, closing its sessions", email);
            peer.close_all(CloseReason::Revoked).await;
        }
        self.emit(NetworkEvent::Security(SecurityEvent::CertificateRevoked {
            peer: email.to_string(),
        }))
        .await;
    }

    /// Disconnect everyone and stop dialing until `go_online`
    pub async fn go_offline(&self) {
        if !self.online.swap(false, Ordering::AcqRel) {
            return;
        }
        log::info!("Network {} going offline", self.network_id().short());
        for peer in self.peers().await {
            peer.close_all(CloseReason::Offline).await;
        }
    }

    pub fn go_online(&self) {
        if !self.online.swap(true, Ordering::AcqRel) {
            log::info!("Network {} back online", self.network_id().short());
        }
    }

    /// Tear down every session synchronously; blocked stream reads end and
    /// blocked writes fail with `Disposed`
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
        for session in self.live_sessions.iter() {
            session.abort();
        }
        self.live_sessions.clear();
        log::info!("Network {} disposed", self.network_id().short());
    }

    /// Swap in the descriptor derived from a new shared secret
    pub(crate) fn replace_descriptor(&self, descriptor: NetworkDescriptor, shared_secret: &str) {
        let mut binding = write(&self.binding);
        if let PeerBinding::Expected { .. } = *binding {
            *binding = PeerBinding::expected(shared_secret);
        }
        *write(&self.descriptor) = descriptor;
    }

    // -------------------------------------------------------------------------
    // Session events
    // -------------------------------------------------------------------------

    async fn pump(network: Weak<Self>, mut events: mpsc::Receiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            let Some(network) = network.upgrade() else {
                return;
            };
            network.handle_session_event(event).await;
        }
    }

    async fn handle_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Message { peer, payload, .. } => {
                self.emit(NetworkEvent::MessageReceived { peer, payload }).await;
            }
            SessionEvent::StreamOpened { session_id, peer, port } => {
                self.emit(NetworkEvent::StreamOpened { peer, session_id, port }).await;
            }
            SessionEvent::Closed {
                session_id,
                peer,
                endpoint,
                reason,
                may_reconnect,
            } => {
                self.live_sessions.remove(&session_id);
                if let Some(member) = self.peer(&peer).await {
                    if member.remove_session(session_id).await {
                        self.emit(NetworkEvent::PeerOffline { peer: peer.clone() }).await;
                    }
                }
                if let CloseReason::ProtocolViolation(why) = &reason {
                    self.emit(NetworkEvent::Security(SecurityEvent::ProtocolViolation {
                        peer: peer.clone(),
                        reason: why.clone(),
                    }))
                    .await;
                }
                if may_reconnect && self.is_online() && !self.is_disposed() {
                    self.spawn_reconnect(endpoint);
                }
            }
        }
    }

    /// One attempt, and the replacement session gets no reconnect budget
    fn spawn_reconnect(&self, endpoint: SocketAddr) {
        let Some(network) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            log::info!("Reconnecting to {}", endpoint);
            if let Err(e) = network.dial(endpoint, false).await {
                log::debug!("Reconnect to {} failed: {}", endpoint, e);
            }
        });
    }
}

impl Drop for VirtualPeerNetwork {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for VirtualPeerNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualPeerNetwork")
            .field("network_id", &self.network_id().short())
            .field("local", &self.local_email())
            .field("online", &self.is_online())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

// =============================================================================
// Network Registry
// =============================================================================

/// Live networks of one node keyed by network id
#[derive(Default)]
pub struct NetworkRegistry {
    networks: DashMap<Identifier, Weak<VirtualPeerNetwork>>,
}

impl NetworkRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, network: &Arc<VirtualPeerNetwork>) -> NetworkResult<()> {
        let id = network.network_id();
        match self.networks.entry(id.clone()) {
            Entry::Occupied(mut entry) => {
                if let Some(existing) = entry.get().upgrade() {
                    if !existing.is_disposed() && !Arc::ptr_eq(&existing, network) {
                        return Err(NetworkError::NetworkIdCollision(id.short()));
                    }
                }
                entry.insert(Arc::downgrade(network));
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::downgrade(network));
            }
        }
        Ok(())
    }

    pub fn unregister(&self, network_id: &Identifier) {
        self.networks.remove(network_id);
    }

    pub fn get(&self, network_id: &Identifier) -> Option<Arc<VirtualPeerNetwork>> {
        self.networks
            .get(network_id)
            .and_then(|network| network.upgrade())
            .filter(|network| !network.is_disposed())
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    /// Hand an inbound channel to the network its name designates
    pub async fn route_channel(
        &self,
        name: &str,
        stream: BoxedStream,
        remote_endpoint: SocketAddr,
    ) -> NetworkResult<Arc<VirtualPeer>> {
        let network = Identifier::from_hex(name)
            .ok()
            .and_then(|id| self.get(&id))
            .ok_or_else(|| NetworkError::UnknownNetwork(name.to_string()))?;
        network.accept_channel(stream, remote_endpoint).await
    }

    /// Re-derive the network id of `network` for a new shared secret
    pub fn change_shared_secret(&self, network: &Arc<VirtualPeerNetwork>, shared_secret: &str) -> NetworkResult<()> {
        let old = network.descriptor();
        let new = old.with_shared_secret(network.local_email(), shared_secret);
        let new_id = new.network_id().clone();

        if new_id != *old.network_id() {
            match self.networks.entry(new_id.clone()) {
                Entry::Occupied(mut entry) => {
                    if let Some(existing) = entry.get().upgrade() {
                        if !existing.is_disposed() && !Arc::ptr_eq(&existing, network) {
                            return Err(NetworkError::NetworkIdCollision(new_id.short()));
                        }
                    }
                    entry.insert(Arc::downgrade(network));
                }
                Entry::Vacant(entry) => {
                    entry.insert(Arc::downgrade(network));
                }
            }
            self.networks
                .remove_if(old.network_id(), |_, existing| existing.ptr_eq(&Arc::downgrade(network)));
        }

        network.replace_descriptor(new, shared_secret);
        log::info!("Network {} renamed to {}", old.network_id().short(), new_id.short());
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn read<T>(lock: &StdRwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &StdRwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryNetwork, PresharedKeyChannel};
    use std::time::Duration;

    const SECRET: &str = "hunter2";

    struct Node {
        network: Arc<VirtualPeerNetwork>,
        events: mpsc::Receiver<NetworkEvent>,
        endpoint: SocketAddr,
    }

    fn context(
        memory: &Arc<MemoryNetwork>,
        email: &str,
        endpoint: SocketAddr,
        config: NetworkConfig,
    ) -> (NodeContext, mpsc::Receiver<crate::memory::IncomingChannel>) {
        let (connections, incoming) = memory.bind(endpoint);
        let context = NodeContext {
            identity: LocalIdentity {
                certificate: PeerCertificate::new(email, email, Identifier::random(16)),
                private_key: Arc::new(Vec::new()),
            },
            connections,
            secure_channel: PresharedKeyChannel::new(),
            trusted_roots: Vec::new(),
            config,
        };
        (context, incoming)
    }

    async fn node(memory: &Arc<MemoryNetwork>, email: &str, endpoint: &str, descriptor: NetworkDescriptor, binding: PeerBinding) -> Node {
        node_with_config(memory, email, endpoint, descriptor, binding, NetworkConfig::default()).await
    }

    async fn node_with_config(
        memory: &Arc<MemoryNetwork>,
        email: &str,
        endpoint: &str,
        descriptor: NetworkDescriptor,
        binding: PeerBinding,
        config: NetworkConfig,
    ) -> Node {
        let endpoint: SocketAddr = endpoint.parse().unwrap();
        let (context, mut incoming) = context(memory, email, endpoint, config);
        let network = VirtualPeerNetwork::new(context, descriptor, binding);
        let (tx, events) = mpsc::channel(64);
        network.set_event_handler(tx).await;

        let acceptor = Arc::downgrade(&network);
        tokio::spawn(async move {
            while let Some(channel) = incoming.recv().await {
                let Some(network) = acceptor.upgrade() else { return };
                tokio::spawn(async move {
                    let _ = network.accept_channel(channel.stream, channel.remote_endpoint).await;
                });
            }
        });
        Node { network, events, endpoint }
    }

    async fn group_node(memory: &Arc<MemoryNetwork>, email: &str, endpoint: &str) -> Node {
        let descriptor = NetworkDescriptor::group("Friends", SECRET);
        let binding = PeerBinding::for_descriptor(&descriptor);
        node(memory, email, endpoint, descriptor, binding).await
    }

    async fn group_node_with_config(memory: &Arc<MemoryNetwork>, email: &str, endpoint: &str, config: NetworkConfig) -> Node {
        let descriptor = NetworkDescriptor::group("Friends", SECRET);
        let binding = PeerBinding::for_descriptor(&descriptor);
        node_with_config(memory, email, endpoint, descriptor, binding, config).await
    }

    async fn wait_for(events: &mut mpsc::Receiver<NetworkEvent>, wanted: impl Fn(&NetworkEvent) -> bool) -> NetworkEvent {
        timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.expect("event channel closed");
                if wanted(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn test_group_join_and_broadcast() {
        let memory = MemoryNetwork::new();
        let mut a = group_node(&memory, "a@x.com", "10.0.0.1:9000").await;
        let mut b = group_node(&memory, "b@y.com", "10.0.0.2:9000").await;

        let peer = a.network.make_connection(b.endpoint).await.unwrap().unwrap();
        assert_eq!(peer.email(), "b@y.com");

        wait_for(&mut a.events, |e| matches!(e, NetworkEvent::PeerOnline { peer } if peer == "b@y.com")).await;
        wait_for(&mut b.events, |e| matches!(e, NetworkEvent::PeerOnline { peer } if peer == "a@x.com")).await;

        assert_eq!(a.network.send_message(b"hello").await.unwrap(), 1);
        let event = wait_for(&mut b.events, |e| matches!(e, NetworkEvent::MessageReceived { .. })).await;
        assert_eq!(
            event,
            NetworkEvent::MessageReceived {
                peer: "a@x.com".into(),
                payload: Bytes::from_static(b"hello"),
            }
        );

        b.network.send_message_to("a@x.com", b"hi back").await.unwrap();
        wait_for(&mut a.events, |e| matches!(e, NetworkEvent::MessageReceived { payload, .. } if payload.as_ref() == b"hi back")).await;

        // Dialed endpoint is remembered for later reconnects
        let members = a.network.members().await;
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].endpoints, vec![b.endpoint]);
    }

    #[tokio::test]
    async fn test_duplicate_dial_is_skipped() {
        let memory = MemoryNetwork::new();
        let a = group_node(&memory, "a@x.com", "10.0.0.1:9000").await;
        let b = group_node(&memory, "b@y.com", "10.0.0.2:9000").await;

        assert!(a.network.make_connection(b.endpoint).await.unwrap().is_some());
        assert!(a.network.make_connection(b.endpoint).await.unwrap().is_none());
        assert_eq!(a.network.peer("b@y.com").await.unwrap().sessions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_wrong_secret_fails_authentication() {
        let memory = MemoryNetwork::new();
        let mut a = group_node(&memory, "a@x.com", "10.0.0.1:9000").await;
        let other = NetworkDescriptor::group("Friends", "different");
        let b = node(&memory, "b@y.com", "10.0.0.2:9000", other, PeerBinding::Open).await;

        let result = a.network.make_connection(b.endpoint).await;
        assert!(matches!(result, Err(NetworkError::Authentication(_))));
        wait_for(&mut a.events, |e| {
            matches!(e, NetworkEvent::Security(SecurityEvent::AuthenticationFailed { .. }))
        })
        .await;
        assert!(a.network.online_peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_private_chat_rejects_other_identity() {
        let memory = MemoryNetwork::new();
        let descriptor = NetworkDescriptor::private("a@x.com", "b@y.com", SECRET);
        let mut a = node(
            &memory,
            "a@x.com",
            "10.0.0.1:9000",
            descriptor.clone(),
            PeerBinding::for_descriptor(&descriptor),
        )
        .await;
        // Knows the secret but is not b@y.com
        let mallory = node(&memory, "m@evil.com", "10.0.0.3:9000", descriptor, PeerBinding::Open).await;

        let _ = mallory.network.make_connection(a.endpoint).await;
        let event = wait_for(&mut a.events, |e| matches!(e, NetworkEvent::Security(_))).await;
        match event {
            NetworkEvent::Security(SecurityEvent::PeerIdentityConflict { expected, actual, .. }) => {
                assert_eq!(expected.as_deref(), Some("b@y.com"));
                assert_eq!(actual, "m@evil.com");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(a.network.peer("m@evil.com").await.is_none());
        assert!(!a.network.peer("b@y.com").await.unwrap().is_online().await);
    }

    #[tokio::test]
    async fn test_expected_binding_binds_on_first_contact() {
        let memory = MemoryNetwork::new();
        let descriptor = NetworkDescriptor::private("a@x.com", "b@y.com", SECRET);
        let a = node(&memory, "a@x.com", "10.0.0.1:9000", descriptor.clone(), PeerBinding::expected(SECRET)).await;
        let b_descriptor = NetworkDescriptor::private("b@y.com", "a@x.com", SECRET);
        let b = node(
            &memory,
            "b@y.com",
            "10.0.0.2:9000",
            b_descriptor.clone(),
            PeerBinding::for_descriptor(&b_descriptor),
        )
        .await;

        assert_eq!(descriptor.network_id(), b_descriptor.network_id());
        b.network.make_connection(a.endpoint).await.unwrap();
        assert_eq!(a.network.binding(), PeerBinding::Bound("b@y.com".into()));
    }

    #[tokio::test]
    async fn test_dispose_wakes_blocked_stream_reads() {
        let memory = MemoryNetwork::new();
        let a = group_node(&memory, "a@x.com", "10.0.0.1:9000").await;
        let mut b = group_node(&memory, "b@y.com", "10.0.0.2:9000").await;
        a.network.make_connection(b.endpoint).await.unwrap();

        let outbound = a.network.open_stream("b@y.com").await.unwrap();
        outbound.write_all(b"first").await.unwrap();
        let (session_id, port) = match wait_for(&mut b.events, |e| matches!(e, NetworkEvent::StreamOpened { .. })).await {
            NetworkEvent::StreamOpened { session_id, port, .. } => (session_id, port),
            _ => unreachable!(),
        };
        let inbound = b.network.accept_stream("a@x.com", session_id, port).await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(inbound.read(&mut buf).await.unwrap(), 5);

        let reader = tokio::spawn(async move { inbound.read(&mut [0u8; 16]).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        b.network.dispose();

        let n = timeout(Duration::from_secs(2), reader).await.unwrap().unwrap().unwrap();
        assert_eq!(n, 0);
        assert!(matches!(b.network.send_message(b"x").await, Err(NetworkError::Disposed)));
    }

    #[tokio::test]
    async fn test_dispose_while_peer_table_is_locked() {
        let memory = MemoryNetwork::new();
        let a = group_node(&memory, "a@x.com", "10.0.0.1:9000").await;
        let mut b = group_node(&memory, "b@y.com", "10.0.0.2:9000").await;
        a.network.make_connection(b.endpoint).await.unwrap();

        let outbound = a.network.open_stream("b@y.com").await.unwrap();
        outbound.write_all(b"first").await.unwrap();
        let (session_id, port) = match wait_for(&mut b.events, |e| matches!(e, NetworkEvent::StreamOpened { .. })).await {
            NetworkEvent::StreamOpened { session_id, port, .. } => (session_id, port),
            _ => unreachable!(),
        };
        let inbound = b.network.accept_stream("a@x.com", session_id, port).await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(inbound.read(&mut buf).await.unwrap(), 5);

        let reader = tokio::spawn(async move { inbound.read(&mut [0u8; 16]).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        {
            let _members = b.network.peers.write().await;
            b.network.dispose();
        }

        let n = timeout(Duration::from_secs(2), reader).await.unwrap().unwrap().unwrap();
        assert_eq!(n, 0);
        assert!(b.network.live_sessions.is_empty());
    }

    #[tokio::test]
    async fn test_stalled_event_consumer_does_not_block_pump() {
        let memory = MemoryNetwork::new();
        let a = group_node(&memory, "a@x.com", "10.0.0.1:9000").await;
        let b = group_node(&memory, "b@y.com", "10.0.0.2:9000").await;
        let (stalled_tx, _stalled_rx) = mpsc::channel(1);
        a.network.set_event_handler(stalled_tx).await;

        b.network.make_connection(a.endpoint).await.unwrap();
        for _ in 0..5 {
            b.network.send_message(b"flood").await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (tx, mut events) = mpsc::channel(64);
        timeout(Duration::from_secs(2), a.network.set_event_handler(tx))
            .await
            .expect("handler lock held by a blocked emit");
        b.network.send_message(b"after").await.unwrap();
        wait_for(&mut events, |e| {
            matches!(e, NetworkEvent::MessageReceived { payload, .. } if payload.as_ref() == b"after")
        })
        .await;
    }

    #[tokio::test]
    async fn test_offline_closes_sessions_and_blocks_dials() {
        let memory = MemoryNetwork::new();
        let mut a = group_node(&memory, "a@x.com", "10.0.0.1:9000").await;
        let mut b = group_node(&memory, "b@y.com", "10.0.0.2:9000").await;
        a.network.make_connection(b.endpoint).await.unwrap();
        wait_for(&mut b.events, |e| matches!(e, NetworkEvent::PeerOnline { .. })).await;

        a.network.go_offline().await;
        wait_for(&mut a.events, |e| matches!(e, NetworkEvent::PeerOffline { .. })).await;
        wait_for(&mut b.events, |e| matches!(e, NetworkEvent::PeerOffline { .. })).await;
        assert!(matches!(a.network.make_connection(b.endpoint).await, Err(NetworkError::Offline)));

        a.network.go_online();
        assert!(a.network.make_connection(b.endpoint).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_revoked_certificate_is_disconnected() {
        let memory = MemoryNetwork::new();
        let mut a = group_node(&memory, "a@x.com", "10.0.0.1:9000").await;
        let b = group_node(&memory, "b@y.com", "10.0.0.2:9000").await;
        a.network.make_connection(b.endpoint).await.unwrap();

        a.network.certificate_revoked("B@y.com").await;
        wait_for(&mut a.events, |e| matches!(e, NetworkEvent::PeerOffline { .. })).await;
        assert!(a.network.is_revoked("b@y.com"));

        let again = b.network.make_connection(a.endpoint).await;
        assert!(again.is_ok());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!a.network.peer("b@y.com").await.unwrap().is_online().await);
    }

    #[tokio::test]
    async fn test_unexpected_drop_redials_once() {
        let memory = MemoryNetwork::new();
        let mut a = group_node(&memory, "a@x.com", "10.0.0.1:9000").await;
        let b = group_node(&memory, "b@y.com", "10.0.0.2:9000").await;
        let peer = a.network.make_connection(b.endpoint).await.unwrap().unwrap();
        wait_for(&mut a.events, |e| matches!(e, NetworkEvent::PeerOnline { .. })).await;

        let session = peer.sessions().await.remove(0);
        assert!(session.may_reconnect());
        session.abort();
        a.network
            .session_events
            .send(SessionEvent::Closed {
                session_id: session.id(),
                peer: "b@y.com".into(),
                endpoint: b.endpoint,
                reason: CloseReason::Error("connection reset".into()),
                may_reconnect: true,
            })
            .await
            .unwrap();

        wait_for(&mut a.events, |e| matches!(e, NetworkEvent::PeerOffline { .. })).await;
        wait_for(&mut a.events, |e| matches!(e, NetworkEvent::PeerOnline { .. })).await;
        let sessions = peer.sessions().await;
        assert_eq!(sessions.len(), 1);
        assert!(!sessions[0].may_reconnect());
    }

    #[tokio::test]
    async fn test_read_timeout_redials_exactly_once() {
        let memory = MemoryNetwork::new();
        let mut impatient = NetworkConfig::default();
        impatient.read_timeout_secs = 1;
        impatient.keepalive_interval_secs = 3600;
        let mut quiet = NetworkConfig::default();
        quiet.keepalive_interval_secs = 3600;
        let mut a = group_node_with_config(&memory, "a@x.com", "10.0.0.1:9000", impatient).await;
        let b = group_node_with_config(&memory, "b@y.com", "10.0.0.2:9000", quiet).await;

        let peer = a.network.make_connection(b.endpoint).await.unwrap().unwrap();
        wait_for(&mut a.events, |e| matches!(e, NetworkEvent::PeerOnline { .. })).await;

        // b never speaks, so a's read times out and counts as a transport failure
        wait_for(&mut a.events, |e| matches!(e, NetworkEvent::PeerOffline { .. })).await;
        wait_for(&mut a.events, |e| matches!(e, NetworkEvent::PeerOnline { .. })).await;
        let sessions = peer.sessions().await;
        assert_eq!(sessions.len(), 1);
        assert!(!sessions[0].may_reconnect());

        wait_for(&mut a.events, |e| matches!(e, NetworkEvent::PeerOffline { .. })).await;
        tokio::time::sleep(Duration::from_millis(1500)).await;
        while let Ok(event) = a.events.try_recv() {
            assert!(!matches!(event, NetworkEvent::PeerOnline { .. }), "redialed twice");
        }
        assert!(!peer.is_online().await);
    }

    #[tokio::test]
    async fn test_registry_routes_and_rejects_collisions() {
        let memory = MemoryNetwork::new();
        let a = group_node(&memory, "a@x.com", "10.0.0.1:9000").await;
        let twin = group_node(&memory, "a@x.com", "10.0.0.5:9000").await;
        let registry = NetworkRegistry::new();

        registry.register(&a.network).unwrap();
        registry.register(&a.network).unwrap();
        assert!(matches!(
            registry.register(&twin.network),
            Err(NetworkError::NetworkIdCollision(_))
        ));

        let result = registry
            .route_channel("00ff", Box::new(tokio::io::duplex(64).0), "10.0.0.9:1".parse().unwrap())
            .await;
        assert!(matches!(result, Err(NetworkError::UnknownNetwork(_))));

        let old_id = a.network.network_id();
        registry.change_shared_secret(&a.network, "new secret").unwrap();
        assert_ne!(a.network.network_id(), old_id);
        assert!(registry.get(&old_id).is_none());
        assert!(registry.get(&a.network.network_id()).is_some());

        registry.unregister(&a.network.network_id());
        assert!(registry.is_empty());
    }
}
