//! BitChat Network - Virtual Peer
//!
//! A chat participant's logical identity. Any number of sessions may carry
//! its traffic at once; the peer is online while at least one is open.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::channel::{ChannelRole, PeerCertificate};
use crate::mux::{DataStream, MuxError};
use crate::peer_endpoint::PeerEndpointInfo;
use crate::virtual_session::{CloseReason, SessionId, VirtualSession};

pub struct VirtualPeer {
    email: String,
    /// Endpoints this peer was seen at (sessions, peer exchange, discovery)
    info: RwLock<PeerEndpointInfo>,
    certificate: RwLock<Option<PeerCertificate>>,
    sessions: RwLock<Vec<Arc<VirtualSession>>>,
    /// Members this peer reports being connected to
    connected_with: RwLock<Vec<PeerEndpointInfo>>,
}

impl VirtualPeer {
    pub fn new(email: impl Into<String>) -> Self {
        let email = email.into();
        Self {
            info: RwLock::new(PeerEndpointInfo::new(email.clone(), Vec::new())),
            email,
            certificate: RwLock::new(None),
            sessions: RwLock::new(Vec::new()),
            connected_with: RwLock::new(Vec::new()),
        }
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn is(&self, email: &str) -> bool {
        self.email.eq_ignore_ascii_case(email)
    }

    pub async fn certificate(&self) -> Option<PeerCertificate> {
        self.certificate.read().await.clone()
    }

    /// Snapshot of identity and known endpoints
    pub async fn endpoint_info(&self) -> PeerEndpointInfo {
        self.info.read().await.clone()
    }

    pub async fn merge_endpoints(&self, endpoints: &[SocketAddr]) {
        self.info.write().await.merge_endpoints(endpoints);
    }

    /// Attach a session; true if this brought the peer online
    pub async fn add_session(&self, session: Arc<VirtualSession>) -> bool {
        *self.certificate.write().await = Some(session.remote_certificate().clone());
        // Inbound sessions come from an ephemeral port nobody can dial back
        if session.role() == ChannelRole::Client {
            self.info.write().await.merge_endpoints(&[session.remote_endpoint()]);
        }

        let mut sessions = self.sessions.write().await;
        let was_online = sessions.iter().any(|s| s.is_open());
        sessions.push(session);
        !was_online
    }

    /// Detach a session; true if this took the peer offline
    pub async fn remove_session(&self, id: SessionId) -> bool {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|s| s.id() != id);
        let removed = sessions.len() != before;
        let online = sessions.iter().any(|s| s.is_open());
        if !online {
            drop(sessions);
            self.connected_with.write().await.clear();
        }
        removed && !online
    }

    pub async fn sessions(&self) -> Vec<Arc<VirtualSession>> {
        self.sessions.read().await.clone()
    }

    pub async fn is_online(&self) -> bool {
        self.sessions.read().await.iter().any(|s| s.is_open())
    }

    /// True if an open session runs over exactly `endpoint`
    pub async fn is_connected_via(&self, endpoint: SocketAddr) -> bool {
        self.sessions
            .read()
            .await
            .iter()
            .any(|s| s.is_open() && s.remote_endpoint() == endpoint)
    }

    /// Send on the first session that accepts the message
    pub async fn send_message(&self, payload: &[u8]) -> Result<(), MuxError> {
        let sessions = self.sessions().await;
        let mut last_error = MuxError::Disposed;
        for session in sessions.iter().filter(|s| s.is_open()) {
            match session.send_message(payload).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::debug!("Send to {} via session {} failed: {}", self.email, session.id(), e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    pub async fn open_stream(&self) -> Result<DataStream, MuxError> {
        let sessions = self.sessions().await;
        let mut last_error = MuxError::Disposed;
        for session in sessions.iter().filter(|s| s.is_open()) {
            match session.open_stream() {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }

    pub async fn accept_stream(&self, session_id: SessionId, port: u16) -> Option<DataStream> {
        self.sessions
            .read()
            .await
            .iter()
            .find(|s| s.id() == session_id)
            .and_then(|s| s.accept_stream(port))
    }

    /// Replace the connectivity list this peer reported
    pub async fn set_connected_with(&self, peers: Vec<PeerEndpointInfo>) {
        *self.connected_with.write().await = peers;
    }

    pub async fn connected_with(&self) -> Vec<PeerEndpointInfo> {
        self.connected_with.read().await.clone()
    }

    pub async fn close_all(&self, reason: CloseReason) {
        for session in self.sessions().await {
            session.close(reason.clone()).await;
        }
    }
}

impl std::fmt::Debug for VirtualPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualPeer").field("email", &self.email).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::AuthenticatedStream;
    use crate::config::NetworkConfig;
    use crate::identifier::Identifier;
    use tokio::sync::mpsc;

    fn session(id: SessionId, endpoint: &str) -> (Arc<VirtualSession>, tokio::io::DuplexStream) {
        let (a, b) = tokio::io::duplex(1024);
        let (tx, _rx) = mpsc::channel(8);
        let (session, read) = VirtualSession::new(
            id,
            AuthenticatedStream {
                stream: Box::new(a),
                remote_certificate: PeerCertificate::new("b@y.com", "B", Identifier::from_array([2; 8])),
                rekey: None,
            },
            endpoint.parse().unwrap(),
            ChannelRole::Client,
            &NetworkConfig::default(),
            true,
            tx,
        );
        session.start(read);
        (session, b)
    }

    #[tokio::test]
    async fn test_online_tracking() {
        let peer = VirtualPeer::new("b@y.com");
        assert!(!peer.is_online().await);

        let (s1, _r1) = session(1, "10.0.0.2:4000");
        let (s2, _r2) = session(2, "10.0.0.3:4000");
        assert!(peer.add_session(s1.clone()).await);
        assert!(!peer.add_session(s2).await);
        assert!(peer.is_online().await);
        assert!(peer.is_connected_via("10.0.0.2:4000".parse().unwrap()).await);
        assert!(!peer.is_connected_via("10.0.0.9:4000".parse().unwrap()).await);
        assert_eq!(peer.endpoint_info().await.endpoints.len(), 2);
        assert_eq!(peer.certificate().await.unwrap().email, "b@y.com");

        assert!(!peer.remove_session(1).await);
        assert!(peer.remove_session(2).await);
        assert!(!peer.is_online().await);
    }

    #[tokio::test]
    async fn test_connected_with_cleared_when_offline() {
        let peer = VirtualPeer::new("b@y.com");
        let (s1, _r1) = session(1, "10.0.0.2:4000");
        peer.add_session(s1).await;
        peer.set_connected_with(vec![PeerEndpointInfo::new("c@z.com", vec![])]).await;
        assert_eq!(peer.connected_with().await.len(), 1);

        peer.remove_session(1).await;
        assert!(peer.connected_with().await.is_empty());
    }

    #[tokio::test]
    async fn test_send_without_sessions_fails() {
        let peer = VirtualPeer::new("b@y.com");
        assert!(matches!(peer.send_message(b"x").await, Err(MuxError::Disposed)));
        assert!(peer.open_stream().await.is_err());
    }
}
