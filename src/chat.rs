//! BitChat Network - Chat
//!
//! Glue between one chat's `VirtualPeerNetwork` and the discovery sources:
//! - `BitChatNode`: per-node registry, inbound channel routing, LAN
//!   discovery event routing, chat creation
//! - `BitChat`: tracker polling, relay registration, peer exchange over
//!   port 0, and the status reconciler driving reconnection

use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::channel::{BoxFuture, BoxedStream};
use crate::descriptor::NetworkDescriptor;
use crate::identifier::Identifier;
use crate::local_discovery::{DiscoveryEvent, LocalPeerDiscovery};
use crate::peer_endpoint::PeerEndpointInfo;
use crate::reconciler::{
    ChatMessage, NetworkStatus, NetworkStatusReconciler, PeerConnectivity, ReconcileInput, ReconcileOutcome,
    ReconcileSource,
};
use crate::tcp_relay::TcpRelayClient;
use crate::tracker::{DhtNode, TrackerEvent, TrackerManager, TrackerStatus};
use crate::virtual_network::{
    NetworkError, NetworkEvent, NetworkRegistry, NetworkResult, NodeContext, PeerBinding, SecurityEvent,
    VirtualPeerNetwork,
};
use crate::virtual_session::SessionId;

/// Queue depth of the per-chat event channels
const EVENT_QUEUE: usize = 256;

// =============================================================================
// Events
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChatEvent {
    NetworkStatusChanged(NetworkStatus),
    PeerAdded { peer: String },
    PeerOnline { peer: String },
    PeerOffline { peer: String },
    MessageReceived { peer: String, payload: Bytes },
    StreamOpened {
        peer: String,
        session_id: SessionId,
        port: u16,
    },
    Security(SecurityEvent),
}

/// Discovery sources shared by every chat of a node. All optional.
#[derive(Clone, Default)]
pub struct ChatServices {
    pub local_discovery: Option<Arc<LocalPeerDiscovery>>,
    pub relay: Option<Arc<TcpRelayClient>>,
    pub dht: Option<Arc<dyn DhtNode>>,
}

// =============================================================================
// Node
// =============================================================================

pub struct BitChatNode {
    context: NodeContext,
    services: ChatServices,
    registry: Arc<NetworkRegistry>,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl BitChatNode {
    pub async fn new(context: NodeContext, services: ChatServices) -> Arc<Self> {
        let registry = NetworkRegistry::new();

        let router = match &services.local_discovery {
            Some(discovery) => {
                let (tx, rx) = mpsc::channel(EVENT_QUEUE);
                discovery.set_event_handler(tx).await;
                discovery.start();
                Some(tokio::spawn(Self::route_discoveries(Arc::downgrade(&registry), rx)))
            }
            None => None,
        };

        Arc::new(Self {
            context,
            services,
            registry,
            router: Mutex::new(router),
        })
    }

    pub fn registry(&self) -> &Arc<NetworkRegistry> {
        &self.registry
    }

    pub fn local_email(&self) -> &str {
        self.context.local_email()
    }

    pub async fn create_group_chat(&self, chat_name: &str, shared_secret: &str) -> NetworkResult<Arc<BitChat>> {
        let descriptor = NetworkDescriptor::group(chat_name, shared_secret);
        let binding = PeerBinding::for_descriptor(&descriptor);
        self.create_chat(descriptor, binding).await
    }

    pub async fn create_private_chat(&self, peer_email: &str, shared_secret: &str) -> NetworkResult<Arc<BitChat>> {
        let descriptor = NetworkDescriptor::private(self.local_email(), peer_email, shared_secret);
        let binding = PeerBinding::for_descriptor(&descriptor);
        self.create_chat(descriptor, binding).await
    }

    pub async fn create_chat(&self, descriptor: NetworkDescriptor, binding: PeerBinding) -> NetworkResult<Arc<BitChat>> {
        let network = VirtualPeerNetwork::new(self.context.clone(), descriptor, binding);
        if let Err(e) = self.registry.register(&network) {
            network.dispose();
            return Err(e);
        }
        let chat = BitChat::new(network, self.registry.clone(), self.services.clone()).await;
        chat.start().await;
        Ok(chat)
    }

    /// Hand an inbound channel to the chat it names
    pub async fn accept_channel(&self, name: &str, stream: BoxedStream, remote_endpoint: SocketAddr) -> NetworkResult<()> {
        self.registry
            .route_channel(name, stream, remote_endpoint)
            .await
            .map(|_| ())
    }

    async fn route_discoveries(registry: Weak<NetworkRegistry>, mut events: mpsc::Receiver<DiscoveryEvent>) {
        while let Some(DiscoveryEvent::PeerDiscovered { network_id, endpoint }) = events.recv().await {
            let Some(registry) = registry.upgrade() else {
                return;
            };
            let Some(network) = registry.get(&network_id) else {
                continue;
            };
            log::debug!("LAN peer {} for network {}", endpoint, network_id.short());
            tokio::spawn(async move {
                let _ = network.make_connection(endpoint).await;
            });
        }
    }

    pub async fn shutdown(&self) {
        if let Some(task) = lock(&self.router).take() {
            task.abort();
        }
        if let Some(discovery) = &self.services.local_discovery {
            discovery.stop().await;
        }
        if let Some(relay) = &self.services.relay {
            relay.stop().await;
        }
    }
}

impl Drop for BitChatNode {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.router).take() {
            task.abort();
        }
    }
}

// =============================================================================
// Chat
// =============================================================================

pub struct BitChat {
    me: Weak<BitChat>,
    network: Arc<VirtualPeerNetwork>,
    registry: Arc<NetworkRegistry>,
    services: ChatServices,
    reconciler: Arc<NetworkStatusReconciler>,
    tracker: RwLock<Option<Arc<TrackerManager>>>,
    /// Latest peer-exchange list per connected member
    reported: RwLock<HashMap<String, Vec<PeerEndpointInfo>>>,
    /// Network id currently registered with the discovery sources
    advertised: RwLock<Option<Identifier>>,
    disposed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    event_handler: Arc<RwLock<Option<mpsc::Sender<ChatEvent>>>>,
}

/// Reconciler's view of a chat
struct ChatSource(Weak<BitChat>);

impl ReconcileSource for ChatSource {
    fn snapshot(&self) -> BoxFuture<'_, ReconcileInput> {
        Box::pin(async move {
            match self.0.upgrade() {
                Some(chat) => chat.snapshot().await,
                None => ReconcileInput::default(),
            }
        })
    }

    fn apply<'a>(&'a self, outcome: &'a ReconcileOutcome) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if let Some(chat) = self.0.upgrade() {
                chat.apply(outcome).await;
            }
        })
    }

    fn status_changed(&self, status: NetworkStatus) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Some(chat) = self.0.upgrade() {
                chat.status_changed(status).await;
            }
        })
    }
}

impl BitChat {
    async fn new(network: Arc<VirtualPeerNetwork>, registry: Arc<NetworkRegistry>, services: ChatServices) -> Arc<Self> {
        let debounce = network.config().reconcile_debounce();
        let recheck = network.config().partial_recheck_interval();

        let chat = Arc::new_cyclic(|me: &Weak<BitChat>| Self {
            me: me.clone(),
            reconciler: NetworkStatusReconciler::new(Arc::new(ChatSource(me.clone())), debounce, recheck),
            network,
            registry,
            services,
            tracker: RwLock::new(None),
            reported: RwLock::new(HashMap::new()),
            advertised: RwLock::new(None),
            disposed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            event_handler: Arc::new(RwLock::new(None)),
        });

        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        chat.network.set_event_handler(tx).await;
        let task = tokio::spawn(Self::network_events(chat.me.clone(), rx));
        lock(&chat.tasks).push(task);
        chat
    }

    pub async fn set_event_handler(&self, handler: mpsc::Sender<ChatEvent>) {
        *self.event_handler.write().await = Some(handler);
    }

    /// Never waits on the consumer; a full queue drops the event
    async fn emit(&self, event: ChatEvent) {
        if let Some(ref handler) = *self.event_handler.read().await {
            if let Err(mpsc::error::TrySendError::Full(event)) = handler.try_send(event) {
                log::warn!("Chat event queue full, dropping {:?}", event);
            }
        }
    }

    pub fn network(&self) -> &Arc<VirtualPeerNetwork> {
        &self.network
    }

    pub fn network_id(&self) -> Identifier {
        self.network.network_id()
    }

    pub fn status(&self) -> NetworkStatus {
        self.reconciler.status()
    }

    /// Per-member connectivity from the latest reconciliation
    pub fn connectivity(&self) -> Vec<PeerConnectivity> {
        self.reconciler.last_outcome().connectivity
    }

    pub async fn tracker_status(&self) -> Vec<TrackerStatus> {
        match self.tracker.read().await.as_ref() {
            Some(tracker) => tracker.tracker_status().await,
            None => Vec::new(),
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Register with every discovery source and run a first reconciliation
    pub async fn start(&self) {
        self.advertise().await;
        self.reconciler.trigger();
    }

    async fn advertise(&self) {
        let network_id = self.network.network_id();
        let service_port = self.network.service_port();

        if let Some(discovery) = &self.services.local_discovery {
            discovery.start_tracking(network_id.clone(), service_port).await;
            if self.status() != NetworkStatus::Full {
                discovery.start_announcement(network_id.clone()).await;
            }
        }
        if let Some(relay) = &self.services.relay {
            relay.register_network(network_id.clone()).await;
        }

        let tracker = Arc::new(TrackerManager::new(
            network_id.clone(),
            service_port,
            self.network.config().clone(),
            self.services.dht.clone(),
        ));
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        tracker.set_event_handler(tx).await;
        tracker.start().await;
        lock(&self.tasks).push(tokio::spawn(Self::tracker_events(self.me.clone(), rx)));
        if let Some(old) = self.tracker.write().await.replace(tracker) {
            old.stop().await;
        }

        *self.advertised.write().await = Some(network_id);
    }

    async fn withdraw(&self) {
        let Some(network_id) = self.advertised.write().await.take() else {
            return;
        };
        if let Some(discovery) = &self.services.local_discovery {
            discovery.stop_announcement(&network_id).await;
            discovery.stop_tracking(&network_id).await;
        }
        if let Some(relay) = &self.services.relay {
            relay.unregister_network(&network_id).await;
        }
        if let Some(tracker) = self.tracker.write().await.take() {
            tracker.stop().await;
        }
    }

    /// Disconnect and stop discovery until `go_online`
    pub async fn go_offline(&self) {
        self.withdraw().await;
        self.network.go_offline().await;
        self.reported.write().await.clear();
        self.reconciler.trigger();
    }

    pub async fn go_online(&self) {
        self.network.go_online();
        self.advertise().await;
        self.reconciler.trigger();
    }

    /// Switch to the network derived from a new shared secret
    pub async fn change_shared_secret(&self, shared_secret: &str) -> NetworkResult<()> {
        self.withdraw().await;
        let result = self.registry.change_shared_secret(&self.network, shared_secret);
        if self.network.is_online() {
            self.advertise().await;
        }
        result
    }

    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.reconciler.stop();
        self.withdraw().await;
        self.registry.unregister(&self.network.network_id());
        self.network.dispose();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }

    // -------------------------------------------------------------------------
    // Messaging
    // -------------------------------------------------------------------------

    /// Broadcast a chat message; returns how many members were reached
    pub async fn send_text(&self, text: &str) -> NetworkResult<usize> {
        self.send_data(Bytes::copy_from_slice(text.as_bytes())).await
    }

    pub async fn send_data(&self, payload: Bytes) -> NetworkResult<usize> {
        let message = ChatMessage::Chat(payload)
            .encode()
            .map_err(|e| NetworkError::ProtocolViolation(e.to_string()))?;
        self.network.send_message(&message).await
    }

    /// Dial an endpoint learned out of band
    pub async fn connect_to(&self, endpoint: SocketAddr) -> NetworkResult<()> {
        self.network.make_connection(endpoint).await.map(|_| ())
    }

    async fn broadcast_peer_exchange(&self) {
        let connected = self.network.connected_peers().await;
        let message = match ChatMessage::PeerExchange(connected).encode() {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Peer exchange not sent: {}", e);
                return;
            }
        };
        if let Err(e) = self.network.send_message(&message).await {
            log::debug!("Peer exchange broadcast failed: {}", e);
        }
    }

    // -------------------------------------------------------------------------
    // Event loops
    // -------------------------------------------------------------------------

    async fn network_events(chat: Weak<Self>, mut events: mpsc::Receiver<NetworkEvent>) {
        while let Some(event) = events.recv().await {
            let Some(chat) = chat.upgrade() else {
                return;
            };
            chat.handle_network_event(event).await;
        }
    }

    async fn handle_network_event(&self, event: NetworkEvent) {
        match event {
            NetworkEvent::PeerAdded { peer } => {
                self.emit(ChatEvent::PeerAdded { peer }).await;
                self.reconciler.trigger();
            }
            NetworkEvent::PeerOnline { peer } => {
                self.emit(ChatEvent::PeerOnline { peer }).await;
                self.broadcast_peer_exchange().await;
                self.reconciler.trigger();
            }
            NetworkEvent::PeerOffline { peer } => {
                self.reported.write().await.remove(&peer.to_lowercase());
                self.emit(ChatEvent::PeerOffline { peer }).await;
                self.broadcast_peer_exchange().await;
                self.reconciler.trigger();
            }
            NetworkEvent::MessageReceived { peer, payload } => match ChatMessage::decode(payload) {
                Ok(ChatMessage::PeerExchange(list)) => {
                    log::debug!("{} reports {} connected members", peer, list.len());
                    if let Some(member) = self.network.peer(&peer).await {
                        member.set_connected_with(list.clone()).await;
                    }
                    self.reported.write().await.insert(peer.to_lowercase(), list);
                    self.reconciler.trigger();
                }
                Ok(ChatMessage::Chat(payload)) => {
                    self.emit(ChatEvent::MessageReceived { peer, payload }).await;
                }
                Err(e) => log::warn!("Dropping malformed message from {}: {}", peer, e),
            },
            NetworkEvent::StreamOpened { peer, session_id, port } => {
                self.emit(ChatEvent::StreamOpened { peer, session_id, port }).await;
            }
            NetworkEvent::Security(event) => {
                self.emit(ChatEvent::Security(event)).await;
            }
        }
    }

    async fn tracker_events(chat: Weak<Self>, mut events: mpsc::Receiver<TrackerEvent>) {
        while let Some(TrackerEvent::DiscoveredPeers { network_id, peers }) = events.recv().await {
            let Some(chat) = chat.upgrade() else {
                return;
            };
            if network_id != chat.network.network_id() {
                continue;
            }
            chat.dial_all(peers);
        }
    }

    /// Dial in the background; failures are retried by later passes
    fn dial_all(&self, endpoints: Vec<SocketAddr>) {
        if endpoints.is_empty() || !self.network.is_online() {
            return;
        }
        let network = self.network.clone();
        tokio::spawn(async move {
            let attempts = endpoints.into_iter().map(|endpoint| {
                let network = network.clone();
                async move {
                    if let Err(e) = network.make_connection(endpoint).await {
                        log::debug!("Dial {} failed: {}", endpoint, e);
                    }
                }
            });
            futures::future::join_all(attempts).await;
        });
    }

    // -------------------------------------------------------------------------
    // Reconciliation
    // -------------------------------------------------------------------------

    async fn snapshot(&self) -> ReconcileInput {
        let connected = self.network.connected_peers().await;
        let reported = self.reported.read().await.clone();
        ReconcileInput {
            local_email: self.network.local_email().to_string(),
            members: self.network.members().await,
            connected,
            reported,
        }
    }

    async fn apply(&self, outcome: &ReconcileOutcome) {
        for member in &outcome.new_members {
            if let Some(peer) = self.network.add_member(&member.email).await {
                peer.merge_endpoints(&member.endpoints).await;
            }
        }
        for member in &outcome.not_connected {
            if let Some(peer) = self.network.peer(&member.email).await {
                peer.merge_endpoints(&member.endpoints).await;
            }
        }

        let endpoints: Vec<SocketAddr> = outcome
            .not_connected
            .iter()
            .flat_map(|member| member.endpoints.iter().copied())
            .collect();
        self.dial_all(endpoints);

        if outcome.status != NetworkStatus::Full {
            self.query_relays();
        }
    }

    fn query_relays(&self) {
        let Some(relay) = self.services.relay.clone() else {
            return;
        };
        let Some(chat) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let network_id = chat.network.network_id();
            let peers = relay.query_peers(&network_id).await;
            chat.dial_all(peers);
        });
    }

    async fn status_changed(&self, status: NetworkStatus) {
        if let (Some(discovery), Some(network_id)) =
            (&self.services.local_discovery, self.advertised.read().await.clone())
        {
            if status == NetworkStatus::Full {
                discovery.stop_announcement(&network_id).await;
            } else {
                discovery.start_announcement(network_id).await;
            }
        }
        if status == NetworkStatus::None {
            if let Some(tracker) = self.tracker.read().await.as_ref() {
                tracker.update_now().await;
            }
        }
        self.emit(ChatEvent::NetworkStatusChanged(status)).await;
    }
}

impl Drop for BitChat {
    fn drop(&mut self) {
        self.reconciler.stop();
        self.network.dispose();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for BitChat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitChat")
            .field("network", &self.network)
            .field("status", &self.status())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// =============================================================================
// Tests
// =============================================================================
