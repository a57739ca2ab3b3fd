//! BitChat Network - Virtual Session
//!
//! One authenticated physical stream backing a virtual peer. Owns:
//! - a dedicated read loop demultiplexing frames
//! - a keep-alive task
//! - the [`Multiplexer`] (writer lock + sub-stream table)
//!
//! State machine: `Connecting -> Authenticated -> Reading -> Closing -> Closed`.
//! Teardown runs exactly once whichever path gets there first.

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

use crate::channel::{AuthenticatedStream, BoxedStream, ChannelRole, PeerCertificate};
use crate::config::NetworkConfig;
use crate::mux::{DataStream, Dispatch, Frame, FrameWriter, MuxError, MuxResult, Multiplexer, RekeyPolicy};

pub type SessionId = u64;

// =============================================================================
// State
// =============================================================================

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connecting = 0,
    Authenticated = 1,
    Reading = 2,
    Closing = 3,
    Closed = 4,
}

impl SessionState {
    fn from_u8(val: u8) -> Self {
        match val {
            0 => Self::Connecting,
            1 => Self::Authenticated,
            2 => Self::Reading,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Why a session closed
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Remote ended the stream cleanly
    Graceful,
    /// Closed locally on request
    Explicit,
    /// Network went offline
    Offline,
    /// Network disposed
    Disposed,
    /// Remote certificate was revoked
    Revoked,
    /// Remote broke the framing protocol
    ProtocolViolation(String),
    /// Transport failure or read timeout
    Error(String),
}

impl CloseReason {
    /// Only unexpected transport failures are worth one reconnect
    pub fn is_unexpected(&self) -> bool {
        matches!(self, CloseReason::Error(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    Message {
        session_id: SessionId,
        peer: String,
        payload: Bytes,
    },
    StreamOpened {
        session_id: SessionId,
        peer: String,
        port: u16,
    },
    Closed {
        session_id: SessionId,
        peer: String,
        endpoint: SocketAddr,
        reason: CloseReason,
        may_reconnect: bool,
    },
}

// =============================================================================
// Virtual Session
// =============================================================================

pub struct VirtualSession {
    id: SessionId,
    remote_endpoint: SocketAddr,
    role: ChannelRole,
    remote_certificate: PeerCertificate,
    mux: Arc<Multiplexer>,
    state: AtomicU8,
    torn_down: AtomicBool,
    /// Whether an unexpected close of this session may trigger a reconnect
    may_reconnect: bool,
    established_at: Instant,
    read_timeout: Duration,
    keepalive_interval: Duration,
    reader: Mutex<Option<JoinHandle<()>>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    events: mpsc::Sender<SessionEvent>,
}

impl VirtualSession {
    /// Wrap an authenticated stream. Call [`VirtualSession::start`] to begin reading.
    pub fn new(
        id: SessionId,
        stream: AuthenticatedStream,
        remote_endpoint: SocketAddr,
        role: ChannelRole,
        config: &NetworkConfig,
        may_reconnect: bool,
        events: mpsc::Sender<SessionEvent>,
    ) -> (Arc<Self>, ReadHalf<BoxedStream>) {
        let AuthenticatedStream {
            stream,
            remote_certificate,
            rekey,
        } = stream;
        let (read_half, write_half) = tokio::io::split(stream);
        let writer = Arc::new(FrameWriter::new(
            Box::new(write_half),
            rekey,
            RekeyPolicy::from_config(config),
            config.stream_write_timeout(),
        ));
        let mux = Arc::new(Multiplexer::new(writer, role, config.read_timeout()));

        let session = Arc::new(Self {
            id,
            remote_endpoint,
            role,
            remote_certificate,
            mux,
            state: AtomicU8::new(SessionState::Connecting as u8),
            torn_down: AtomicBool::new(false),
            may_reconnect,
            established_at: Instant::now(),
            read_timeout: config.read_timeout(),
            keepalive_interval: config.keepalive_interval(),
            reader: Mutex::new(None),
            keepalive: Mutex::new(None),
            events,
        });
        session.set_state(SessionState::Authenticated);
        (session, read_half)
    }

    /// Spawn the read loop and keep-alive task
    pub fn start<R>(self: &Arc<Self>, reader: R)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.set_state(SessionState::Reading);
        let read_task = tokio::spawn(Self::read_loop(self.clone(), reader));
        let keepalive_task = tokio::spawn(Self::keepalive_loop(
            Arc::downgrade(self),
            self.mux.clone(),
            self.keepalive_interval,
        ));
        *lock(&self.reader) = Some(read_task);
        *lock(&self.keepalive) = Some(keepalive_task);
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn remote_endpoint(&self) -> SocketAddr {
        self.remote_endpoint
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn remote_certificate(&self) -> &PeerCertificate {
        &self.remote_certificate
    }

    pub fn peer_email(&self) -> &str {
        &self.remote_certificate.email
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state(), SessionState::Authenticated | SessionState::Reading)
    }

    pub fn may_reconnect(&self) -> bool {
        self.may_reconnect
    }

    pub fn age(&self) -> Duration {
        self.established_at.elapsed()
    }

    /// Number of secure-channel renegotiations so far
    pub fn rekeys(&self) -> u64 {
        self.mux.writer().rekeys()
    }

    pub async fn send_message(&self, payload: &[u8]) -> MuxResult<()> {
        if !self.is_open() {
            return Err(MuxError::Disposed);
        }
        self.mux.send_message(payload).await
    }

    pub fn open_stream(&self) -> MuxResult<DataStream> {
        if !self.is_open() {
            return Err(MuxError::Disposed);
        }
        self.mux.open_stream()
    }

    pub fn accept_stream(&self, port: u16) -> Option<DataStream> {
        self.mux.accept_stream(port)
    }

    /// Close the session locally
    pub async fn close(&self, reason: CloseReason) {
        if !self.begin_teardown() {
            return;
        }
        if let Some(task) = lock(&self.reader).take() {
            task.abort();
        }
        self.finish_teardown(reason).await;
    }

    /// Tear down without waiting or reporting; wakes every blocked stream
    pub fn abort(&self) {
        if self.begin_teardown() {
            if let Some(task) = lock(&self.reader).take() {
                task.abort();
            }
            self.set_state(SessionState::Closed);
        }
    }

    /// Synchronous part of teardown; true for the caller that won the race
    fn begin_teardown(&self) -> bool {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.set_state(SessionState::Closing);
        self.mux.dispose();
        if let Some(task) = lock(&self.keepalive).take() {
            task.abort();
        }
        true
    }

    async fn finish_teardown(&self, reason: CloseReason) {
        self.mux.writer().shutdown().await;
        self.set_state(SessionState::Closed);
        log::debug!(
            "Session {} with {} at {} closed: {:?}",
            self.id,
            self.remote_certificate.email,
            self.remote_endpoint,
            reason
        );
        let _ = self
            .events
            .send(SessionEvent::Closed {
                session_id: self.id,
                peer: self.remote_certificate.email.clone(),
                endpoint: self.remote_endpoint,
                may_reconnect: self.may_reconnect && reason.is_unexpected(),
                reason,
            })
            .await;
    }

    async fn read_loop<R: AsyncRead + Unpin>(session: Arc<Self>, mut reader: R) {
        let reason = loop {
            let frame = match timeout(session.read_timeout, Frame::read_from(&mut reader)).await {
                Err(_) => break CloseReason::Error("read timeout".into()),
                Ok(Err(e)) => break CloseReason::Error(e.to_string()),
                Ok(Ok(None)) => break CloseReason::Graceful,
                Ok(Ok(Some(frame))) => frame,
            };

            let event = match session.mux.dispatch(frame).await {
                Ok(Dispatch::Message(payload)) => SessionEvent::Message {
                    session_id: session.id,
                    peer: session.remote_certificate.email.clone(),
                    payload,
                },
                Ok(Dispatch::StreamOpened(port)) => SessionEvent::StreamOpened {
                    session_id: session.id,
                    peer: session.remote_certificate.email.clone(),
                    port,
                },
                Ok(Dispatch::StreamReset(port)) => {
                    log::debug!("Session {}: stream {} reset", session.id, port);
                    continue;
                }
                Ok(_) => continue,
                Err(MuxError::UnknownPort(port)) => {
                    break CloseReason::ProtocolViolation(format!("data for unknown stream port {}", port))
                }
                Err(e) => break CloseReason::Error(e.to_string()),
            };
            if session.events.send(event).await.is_err() {
                break CloseReason::Disposed;
            }
        };

        // The reader task stays alive until teardown has been reported
        if session.begin_teardown() {
            lock(&session.reader).take();
            session.finish_teardown(reason).await;
        }
    }

    async fn keepalive_loop(session: std::sync::Weak<Self>, mux: Arc<Multiplexer>, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            if session.upgrade().is_none() {
                return;
            }
            mux.sweep();
            if let Err(e) = mux.send_keepalive().await {
                log::debug!("Keep-alive failed: {}", e);
                return;
            }
        }
    }
}

impl Drop for VirtualSession {
    fn drop(&mut self) {
        self.abort();
    }
}

impl std::fmt::Debug for VirtualSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualSession")
            .field("id", &self.id)
            .field("peer", &self.remote_certificate.email)
            .field("endpoint", &self.remote_endpoint)
            .field("state", &self.state())
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
