//! BitChat Network - In-Memory Transport
//!
//! Loopback implementations of the collaborator traits for tests and
//! simulations:
//! - `MemoryNetwork`: endpoint registry; `bind` yields a connection manager
//!   and the queue of inbound channels for that endpoint
//! - `PresharedKeyChannel`: handshake that exchanges certificates and proves
//!   knowledge of the pre-shared network secret with HMAC-SHA256
//!
//! Nothing here encrypts. It exists so whole nodes can run in one process.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::channel::{
    AuthenticatedStream, AuthenticationError, BoxFuture, BoxedStream, ChannelRole, Connection,
    ConnectionManager, LocalIdentity, PeerCertificate, Rekey, SecureChannel,
};
use crate::identifier::Identifier;

type HmacSha256 = Hmac<Sha256>;

/// Pipe capacity of an in-memory channel
const CHANNEL_BUFFER: usize = 256 * 1024;

/// Largest handshake record accepted
const MAX_HANDSHAKE: usize = 4096;

// =============================================================================
// Memory Network
// =============================================================================

/// A channel opened towards a bound endpoint
pub struct IncomingChannel {
    pub name: String,
    pub stream: BoxedStream,
    pub remote_endpoint: SocketAddr,
}

impl std::fmt::Debug for IncomingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingChannel")
            .field("name", &self.name)
            .field("remote_endpoint", &self.remote_endpoint)
            .finish()
    }
}

#[derive(Default)]
pub struct MemoryNetwork {
    nodes: DashMap<SocketAddr, mpsc::Sender<IncomingChannel>>,
    next_port: AtomicU64,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: DashMap::new(),
            next_port: AtomicU64::new(50_000),
        })
    }

    /// Listen on `endpoint`
    pub fn bind(self: &Arc<Self>, endpoint: SocketAddr) -> (Arc<MemoryConnectionManager>, mpsc::Receiver<IncomingChannel>) {
        let (tx, rx) = mpsc::channel(64);
        self.nodes.insert(endpoint, tx);
        let manager = Arc::new(MemoryConnectionManager {
            network: self.clone(),
            local: endpoint,
        });
        (manager, rx)
    }

    /// Stop listening on `endpoint`; further dials are refused
    pub fn unbind(&self, endpoint: &SocketAddr) {
        self.nodes.remove(endpoint);
    }

    fn ephemeral_endpoint(&self, local: SocketAddr) -> SocketAddr {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        SocketAddr::new(local.ip(), 50_000 + (port % 15_000) as u16)
    }
}

pub struct MemoryConnectionManager {
    network: Arc<MemoryNetwork>,
    local: SocketAddr,
}

impl MemoryConnectionManager {
    pub fn local_endpoint(&self) -> SocketAddr {
        self.local
    }
}

impl ConnectionManager for MemoryConnectionManager {
    fn make_connection(&self, endpoint: SocketAddr) -> BoxFuture<'_, io::Result<Arc<dyn Connection>>> {
        Box::pin(async move {
            if !self.network.nodes.contains_key(&endpoint) {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("nothing listening on {}", endpoint),
                ));
            }
            let connection: Arc<dyn Connection> = Arc::new(MemoryConnection {
                network: self.network.clone(),
                source: self.network.ephemeral_endpoint(self.local),
                remote: endpoint,
            });
            Ok(connection)
        })
    }

    fn local_service_port(&self) -> u16 {
        self.local.port()
    }
}

struct MemoryConnection {
    network: Arc<MemoryNetwork>,
    source: SocketAddr,
    remote: SocketAddr,
}

impl Connection for MemoryConnection {
    fn remote_endpoint(&self) -> SocketAddr {
        self.remote
    }

    fn request_channel<'a>(&'a self, name: &'a str) -> BoxFuture<'a, io::Result<BoxedStream>> {
        Box::pin(async move {
            let listener = self
                .network
                .nodes
                .get(&self.remote)
                .map(|tx| tx.clone())
                .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionReset, "remote went away"))?;
            let (local, remote) = tokio::io::duplex(CHANNEL_BUFFER);
            listener
                .send(IncomingChannel {
                    name: name.to_string(),
                    stream: Box::new(remote),
                    remote_endpoint: self.source,
                })
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::ConnectionReset, "remote stopped listening"))?;
            let stream: BoxedStream = Box::new(local);
            Ok(stream)
        })
    }
}

// =============================================================================
// Pre-shared Key Channel
// =============================================================================

/// Counts renegotiations; carries no key material
#[derive(Debug, Default)]
pub struct CountingRekey {
    count: AtomicU64,
}

impl CountingRekey {
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Rekey for CountingRekey {
    fn renegotiate(&self) -> BoxFuture<'_, io::Result<()>> {
        self.count.fetch_add(1, Ordering::Relaxed);
        Box::pin(async { Ok(()) })
    }
}

/// Certificate exchange with proof of the pre-shared secret
#[derive(Default)]
pub struct PresharedKeyChannel {
    revoked: DashMap<String, ()>,
}

impl PresharedKeyChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Refuse handshakes from `email` from now on
    pub fn revoke(&self, email: &str) {
        self.revoked.insert(email.to_lowercase(), ());
    }

    fn proof(secret: &[u8], role: ChannelRole, certificate: &PeerCertificate) -> [u8; 32] {
        let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
        mac.update(&[role as u8]);
        mac.update(certificate.email.to_lowercase().as_bytes());
        mac.update(certificate.fingerprint.as_bytes());
        let mut out = [0u8; 32];
        out.copy_from_slice(&mac.finalize().into_bytes());
        out
    }

    fn encode_hello(certificate: &PeerCertificate, proof: &[u8; 32]) -> Bytes {
        let mut body = BytesMut::new();
        for field in [certificate.email.as_bytes(), certificate.name.as_bytes()] {
            body.put_u16_le(field.len() as u16);
            body.put_slice(field);
        }
        certificate.fingerprint.write_to(&mut body);
        body.put_slice(proof);

        let mut out = BytesMut::with_capacity(2 + body.len());
        out.put_u16_le(body.len() as u16);
        out.put_slice(&body);
        out.freeze()
    }

    fn decode_hello(mut body: Bytes) -> Result<(PeerCertificate, [u8; 32]), AuthenticationError> {
        let malformed = || AuthenticationError::Handshake("malformed hello".into());
        let mut fields = Vec::with_capacity(2);
        for _ in 0..2 {
            if body.remaining() < 2 {
                return Err(malformed());
            }
            let len = body.get_u16_le() as usize;
            if body.remaining() < len {
                return Err(malformed());
            }
            let field = String::from_utf8(body.split_to(len).to_vec()).map_err(|_| malformed())?;
            fields.push(field);
        }
        let fingerprint = Identifier::read_from(&mut body).map_err(|_| malformed())?;
        if body.remaining() != 32 {
            return Err(malformed());
        }
        let mut proof = [0u8; 32];
        body.copy_to_slice(&mut proof);
        let name = fields.pop().unwrap_or_default();
        let email = fields.pop().unwrap_or_default();
        Ok((PeerCertificate::new(email, name, fingerprint), proof))
    }
}

impl SecureChannel for PresharedKeyChannel {
    fn wrap<'a>(
        &'a self,
        mut stream: BoxedStream,
        role: ChannelRole,
        identity: &'a LocalIdentity,
        trusted_roots: &'a [PeerCertificate],
        preshared_secret: &'a [u8],
    ) -> BoxFuture<'a, Result<AuthenticatedStream, AuthenticationError>> {
        Box::pin(async move {
            let proof = Self::proof(preshared_secret, role, &identity.certificate);
            stream.write_all(&Self::encode_hello(&identity.certificate, &proof)).await?;
            stream.flush().await?;

            let len = stream.read_u16_le().await? as usize;
            if len > MAX_HANDSHAKE {
                return Err(AuthenticationError::Handshake("hello too large".into()));
            }
            let mut body = vec![0u8; len];
            stream.read_exact(&mut body).await?;
            let (remote, remote_proof) = Self::decode_hello(Bytes::from(body))?;

            let remote_role = match role {
                ChannelRole::Client => ChannelRole::Server,
                ChannelRole::Server => ChannelRole::Client,
            };
            let expected = Self::proof(preshared_secret, remote_role, &remote);
            if expected != remote_proof {
                return Err(AuthenticationError::Handshake("pre-shared secret mismatch".into()));
            }
            if self.revoked.contains_key(&remote.email.to_lowercase()) {
                return Err(AuthenticationError::Revoked(remote.email));
            }
            if !trusted_roots.is_empty() && !trusted_roots.iter().any(|c| c.fingerprint == remote.fingerprint) {
                return Err(AuthenticationError::UntrustedCertificate(remote.email));
            }

            let rekey: Arc<dyn Rekey> = Arc::new(CountingRekey::default());
            Ok(AuthenticatedStream {
                stream,
                remote_certificate: remote,
                rekey: Some(rekey),
            })
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
