//! BitChat Network - Collaborator Interfaces
//!
//! The physical transport and the secure-channel handshake live outside this
//! crate. This module defines the seams they plug into:
//! - `ConnectionManager` / `Connection`: dial an endpoint, open named channels
//! - `SecureChannel`: turn a raw channel into an authenticated stream
//! - `Rekey`: renegotiation handle for long-lived authenticated streams

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::identifier::Identifier;

/// Boxed future type for async trait methods
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// =============================================================================
// Streams
// =============================================================================

/// Ordered, reliable byte stream
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn ByteStream>;

// =============================================================================
// Connection layer
// =============================================================================

/// One physical connection to a remote node
pub trait Connection: Send + Sync {
    /// Endpoint of the remote node
    fn remote_endpoint(&self) -> SocketAddr;

    /// Open a named logical channel over this connection
    fn request_channel<'a>(&'a self, name: &'a str) -> BoxFuture<'a, io::Result<BoxedStream>>;
}

/// Dials physical connections (TCP, UPnP, proxy traversal are its concern)
pub trait ConnectionManager: Send + Sync {
    fn make_connection(&self, endpoint: SocketAddr) -> BoxFuture<'_, io::Result<Arc<dyn Connection>>>;

    /// Port other nodes should dial to reach us
    fn local_service_port(&self) -> u16;
}

// =============================================================================
// Certificates
// =============================================================================

/// Remote peer certificate as reported by the secure channel
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerCertificate {
    /// Email identity the certificate is issued to
    pub email: String,
    /// Display name
    pub name: String,
    /// Certificate fingerprint (issuer-defined hash)
    pub fingerprint: Identifier,
}

impl PeerCertificate {
    pub fn new(email: impl Into<String>, name: impl Into<String>, fingerprint: Identifier) -> Self {
        Self {
            email: email.into(),
            name: name.into(),
            fingerprint,
        }
    }
}

/// Our own identity handed to the secure channel
#[derive(Clone, Debug)]
pub struct LocalIdentity {
    pub certificate: PeerCertificate,
    /// Opaque key material understood by the secure channel implementation
    pub private_key: Arc<Vec<u8>>,
}

/// Which side of the physical connection we are
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelRole {
    /// We dialed
    Client,
    /// We accepted
    Server,
}

// =============================================================================
// Secure Channel
// =============================================================================

#[derive(Debug, Error)]
pub enum AuthenticationError {
    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Untrusted certificate: {0}")]
    UntrustedCertificate(String),

    #[error("Certificate revoked: {0}")]
    Revoked(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Renegotiation handle for an authenticated stream
pub trait Rekey: Send + Sync {
    /// Run a re-handshake; the stream is paused until it completes
    fn renegotiate(&self) -> BoxFuture<'_, io::Result<()>>;
}

/// Authenticated, encrypted, ordered stream
pub struct AuthenticatedStream {
    pub stream: BoxedStream,
    pub remote_certificate: PeerCertificate,
    pub rekey: Option<Arc<dyn Rekey>>,
}

impl std::fmt::Debug for AuthenticatedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticatedStream")
            .field("remote", &self.remote_certificate.email)
            .field("rekey", &self.rekey.is_some())
            .finish()
    }
}

pub trait SecureChannel: Send + Sync {
    fn wrap<'a>(
        &'a self,
        stream: BoxedStream,
        role: ChannelRole,
        identity: &'a LocalIdentity,
        trusted_roots: &'a [PeerCertificate],
        preshared_secret: &'a [u8],
    ) -> BoxFuture<'a, Result<AuthenticatedStream, AuthenticationError>>;
}
