//! BitChat Network
//!
//! Virtual peer network layer for serverless encrypted chats:
//! - network ids derived from chat names, secrets and email pairs
//! - peer discovery over the LAN, BitTorrent trackers, a DHT and TCP relays
//! - authenticated sessions multiplexing chat messages and data streams
//! - gossip reconciliation of each chat's connectivity
//!
//! The transport and the secure-channel handshake are supplied by the caller
//! through the traits in [`channel`]; [`memory`] has loopback versions.

pub mod bencode;
pub mod channel;
pub mod chat;
pub mod config;
pub mod descriptor;
pub mod identifier;
pub mod local_discovery;
pub mod memory;
pub mod mux;
pub mod peer_endpoint;
pub mod reconciler;
pub mod tcp_relay;
pub mod tracker;
pub mod virtual_network;
pub mod virtual_peer;
pub mod virtual_session;

pub use channel::{
    AuthenticatedStream, AuthenticationError, BoxFuture, BoxedStream, ChannelRole, Connection, ConnectionManager,
    LocalIdentity, PeerCertificate, Rekey, SecureChannel,
};
pub use chat::{BitChat, BitChatNode, ChatEvent, ChatServices};
pub use config::NetworkConfig;
pub use descriptor::{NetworkDescriptor, NetworkType};
pub use identifier::Identifier;
pub use local_discovery::LocalPeerDiscovery;
pub use peer_endpoint::PeerEndpointInfo;
pub use reconciler::NetworkStatus;
pub use tcp_relay::{TcpRelayClient, TcpRelayService};
pub use tracker::{DhtNode, TrackerManager};
pub use virtual_network::{
    NetworkError, NetworkEvent, NetworkRegistry, NodeContext, PeerBinding, SecurityEvent, VirtualPeerNetwork,
};
