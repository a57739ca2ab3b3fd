//! BitChat Network - Stream Multiplexer
//!
//! Frames carried inside one authenticated stream:
//! `port(2, LE) | length(2, LE) | payload`
//!
//! - Port 0 carries chat messages; an empty port-0 frame is a keep-alive
//! - Any other port is a [`DataStream`]; an empty frame closes it
//! - The server side allocates even ports, the client side odd ports
//!
//! Every frame goes through one [`FrameWriter`] so frames from different
//! streams never interleave.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{timeout, Instant};

use crate::channel::{ChannelRole, Rekey};
use crate::config::NetworkConfig;

// =============================================================================
// Error Types
// =============================================================================

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Session disposed")]
    Disposed,

    #[error("Stream {0} is closed")]
    Closed(u16),

    #[error("Timed out")]
    Timeout,

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Frame for unknown local port {0}")]
    UnknownPort(u16),

    #[error("No free stream port")]
    NoFreePort,

    #[error("Re-key failed: {0}")]
    Rekey(io::Error),
}

pub type MuxResult<T> = Result<T, MuxError>;

// =============================================================================
// Constants
// =============================================================================

/// Port of the chat message channel
pub const MESSAGE_PORT: u16 = 0;

/// Largest payload of a single frame
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Frames buffered per data stream; a stream whose buffer overflows is reset
const STREAM_BUFFER_FRAMES: usize = 64;

/// Remote-opened streams waiting for `accept_stream`
pub const MAX_PENDING_ACCEPTS: usize = 16;

/// Unclaimed remote streams are reset by [`Multiplexer::sweep`] after this long
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Late frames for a closed port are dropped for this long
const CLOSED_PORT_LINGER: Duration = Duration::from_secs(30);

/// A closed port is not handed out again before this unless every other port is taken
const PORT_REUSE_DELAY: Duration = Duration::from_secs(60);

const HEADER_LEN: usize = 4;

// =============================================================================
// Frame
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub port: u16,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(port: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            port,
            payload: payload.into(),
        }
    }

    /// Empty frame: keep-alive on port 0, close on any other port
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn encode(port: u16, payload: &[u8]) -> MuxResult<Bytes> {
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(MuxError::PayloadTooLarge(payload.len()));
        }
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u16_le(port);
        buf.put_u16_le(payload.len() as u16);
        buf.put_slice(payload);
        Ok(buf.freeze())
    }

    /// Read one frame. `None` on a clean end of stream between frames.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Self>> {
        let mut header = [0u8; HEADER_LEN];
        let mut filled = 0;
        while filled < HEADER_LEN {
            let n = reader.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            filled += n;
        }
        let mut header = &header[..];
        let port = header.get_u16_le();
        let len = header.get_u16_le() as usize;
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        Ok(Some(Self::new(port, payload)))
    }
}

// =============================================================================
// Frame Writer
// =============================================================================

/// When to renegotiate the secure channel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RekeyPolicy {
    pub max_bytes: u64,
    pub max_age: Duration,
}

impl RekeyPolicy {
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self {
            max_bytes: config.rekey_after_bytes,
            max_age: config.rekey_after(),
        }
    }
}

impl Default for RekeyPolicy {
    fn default() -> Self {
        Self::from_config(&NetworkConfig::default())
    }
}

struct WriterState {
    stream: Box<dyn AsyncWrite + Send + Unpin>,
    rekey: Option<Arc<dyn Rekey>>,
    policy: RekeyPolicy,
    bytes_since_rekey: u64,
    last_rekey: Instant,
}

impl WriterState {
    async fn maybe_rekey(&mut self) -> MuxResult<bool> {
        let Some(rekey) = self.rekey.clone() else {
            return Ok(false);
        };
        if self.bytes_since_rekey < self.policy.max_bytes && self.last_rekey.elapsed() < self.policy.max_age {
            return Ok(false);
        }
        rekey.renegotiate().await.map_err(MuxError::Rekey)?;
        self.bytes_since_rekey = 0;
        self.last_rekey = Instant::now();
        Ok(true)
    }
}

/// Single writer for one physical stream
pub struct FrameWriter {
    state: Mutex<WriterState>,
    write_timeout: Duration,
    disposed: watch::Sender<bool>,
    rekeys: AtomicU64,
}

impl FrameWriter {
    pub fn new(
        stream: Box<dyn AsyncWrite + Send + Unpin>,
        rekey: Option<Arc<dyn Rekey>>,
        policy: RekeyPolicy,
        write_timeout: Duration,
    ) -> Self {
        let (disposed, _) = watch::channel(false);
        Self {
            state: Mutex::new(WriterState {
                stream,
                rekey,
                policy,
                bytes_since_rekey: 0,
                last_rekey: Instant::now(),
            }),
            write_timeout,
            disposed,
            rekeys: AtomicU64::new(0),
        }
    }

    /// Write one frame atomically
    pub async fn write_frame(&self, port: u16, payload: &[u8]) -> MuxResult<()> {
        let frame = Frame::encode(port, payload)?;
        if self.is_disposed() {
            return Err(MuxError::Disposed);
        }

        let mut disposed = self.disposed.subscribe();
        let write = async {
            let mut state = timeout(self.write_timeout, self.state.lock())
                .await
                .map_err(|_| MuxError::Timeout)?;
            if state.maybe_rekey().await? {
                self.rekeys.fetch_add(1, Ordering::Relaxed);
                log::debug!("Secure channel renegotiated");
            }
            state.stream.write_all(&frame).await?;
            state.stream.flush().await?;
            state.bytes_since_rekey += frame.len() as u64;
            Ok(())
        };

        tokio::select! {
            result = write => result,
            _ = disposed.wait_for(|d| *d) => Err(MuxError::Disposed),
        }
    }

    /// Fail every pending and future write
    pub fn dispose(&self) {
        self.disposed.send_replace(true);
    }

    pub fn is_disposed(&self) -> bool {
        *self.disposed.borrow()
    }

    /// Number of completed renegotiations
    pub fn rekeys(&self) -> u64 {
        self.rekeys.load(Ordering::Relaxed)
    }

    /// Shut the write side down (best effort)
    pub async fn shutdown(&self) {
        if let Ok(mut state) = timeout(self.write_timeout, self.state.lock()).await {
            let _ = state.stream.shutdown().await;
        }
    }
}

// =============================================================================
// Data Stream
// =============================================================================

struct Slot {
    id: u64,
    tx: mpsc::Sender<Bytes>,
}

/// Open ports of one session, plus the ports closed recently
#[derive(Default)]
struct StreamTable {
    open: DashMap<u16, Slot>,
    closed: DashMap<u16, Instant>,
    next_id: AtomicU64,
}

impl StreamTable {
    /// Register `port` unless it is already open
    fn claim(&self, port: u16) -> Option<(u64, mpsc::Receiver<Bytes>)> {
        match self.open.entry(port) {
            Entry::Occupied(_) => None,
            Entry::Vacant(entry) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = mpsc::channel(STREAM_BUFFER_FRAMES);
                entry.insert(Slot { id, tx });
                self.closed.remove(&port);
                Some((id, rx))
            }
        }
    }

    fn is_open(&self, port: u16, id: u64) -> bool {
        self.open.get(&port).is_some_and(|slot| slot.id == id)
    }

    /// Drop the slot `id` holds on `port`; false if it was already gone
    fn release(&self, port: u16, id: u64) -> bool {
        let released = self.open.remove_if(&port, |_, slot| slot.id == id).is_some();
        if released {
            self.closed.insert(port, Instant::now());
        }
        released
    }

    /// Remote closed `port`
    fn remove(&self, port: u16) -> bool {
        let removed = self.open.remove(&port).is_some();
        if removed {
            self.closed.insert(port, Instant::now());
        }
        removed
    }

    fn closed_within(&self, port: u16, window: Duration) -> bool {
        let closed_at = self.closed.get(&port).map(|at| *at);
        closed_at.is_some_and(|at| at.elapsed() < window)
    }

    fn clear(&self) {
        self.open.clear();
        self.closed.clear();
    }
}

struct Inbound {
    rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
}

/// Bidirectional byte stream multiplexed over a session
pub struct DataStream {
    port: u16,
    id: u64,
    writer: Arc<FrameWriter>,
    table: Arc<StreamTable>,
    inbound: Mutex<Inbound>,
    read_timeout: Duration,
    closed: AtomicBool,
}

impl DataStream {
    fn new(
        port: u16,
        id: u64,
        writer: Arc<FrameWriter>,
        table: Arc<StreamTable>,
        rx: mpsc::Receiver<Bytes>,
        read_timeout: Duration,
    ) -> Self {
        Self {
            port,
            id,
            writer,
            table,
            inbound: Mutex::new(Inbound {
                rx,
                pending: Bytes::new(),
            }),
            read_timeout,
            closed: AtomicBool::new(false),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Read into `buf`. `Ok(0)` means the stream ended (remote close,
    /// local close or session teardown).
    pub async fn read(&self, buf: &mut [u8]) -> MuxResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut inbound = self.inbound.lock().await;
        if inbound.pending.is_empty() {
            match timeout(self.read_timeout, inbound.rx.recv()).await {
                Ok(Some(data)) => inbound.pending = data,
                Ok(None) => return Ok(0),
                Err(_) => return Err(MuxError::Timeout),
            }
        }
        let n = buf.len().min(inbound.pending.len());
        buf[..n].copy_from_slice(&inbound.pending[..n]);
        inbound.pending.advance(n);
        Ok(n)
    }

    /// Read until the stream ends
    pub async fn read_to_end(&self) -> MuxResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// Write all of `data`, split into frames
    pub async fn write_all(&self, data: &[u8]) -> MuxResult<()> {
        if self.writer.is_disposed() {
            return Err(MuxError::Disposed);
        }
        if self.closed.load(Ordering::Acquire) || !self.table.is_open(self.port, self.id) {
            return Err(MuxError::Closed(self.port));
        }
        for chunk in data.chunks(MAX_FRAME_PAYLOAD) {
            self.writer.write_frame(self.port, chunk).await?;
        }
        Ok(())
    }

    /// Close both directions and tell the remote
    pub async fn close(&self) -> MuxResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if !self.table.release(self.port, self.id) {
            return Ok(());
        }
        match self.writer.write_frame(self.port, &[]).await {
            Ok(()) | Err(MuxError::Disposed) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for DataStream {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.table.release(self.port, self.id) {
            send_close(&self.writer, self.port);
        }
    }
}

/// Queue a close frame for `port` without waiting on the writer
fn send_close(writer: &Arc<FrameWriter>, port: u16) {
    if writer.is_disposed() {
        return;
    }
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        let writer = writer.clone();
        handle.spawn(async move {
            let _ = writer.write_frame(port, &[]).await;
        });
    }
}

impl std::fmt::Debug for DataStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStream")
            .field("port", &self.port)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

// =============================================================================
// Multiplexer
// =============================================================================

/// What an inbound frame turned out to be
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Dispatch {
    Message(Bytes),
    KeepAlive,
    StreamData(u16),
    /// The remote opened a stream; claim it with [`Multiplexer::accept_stream`]
    StreamOpened(u16),
    StreamClosed(u16),
    /// The stream could not take the frame and was closed on both ends
    StreamReset(u16),
    Ignored,
}

/// Port table and writer of one session
pub struct Multiplexer {
    writer: Arc<FrameWriter>,
    streams: Arc<StreamTable>,
    accept_queue: DashMap<u16, (DataStream, Instant)>,
    role: ChannelRole,
    /// Allocation cursor, an index into this side's port range
    next_port: AtomicU32,
    read_timeout: Duration,
}

impl Multiplexer {
    pub fn new(writer: Arc<FrameWriter>, role: ChannelRole, read_timeout: Duration) -> Self {
        Self {
            writer,
            streams: Arc::new(StreamTable::default()),
            accept_queue: DashMap::new(),
            role,
            next_port: AtomicU32::new(0),
            read_timeout,
        }
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn writer(&self) -> &Arc<FrameWriter> {
        &self.writer
    }

    /// Ports we allocate: even on the server side, odd on the client side
    pub fn is_local_port(&self, port: u16) -> bool {
        port != MESSAGE_PORT && ((port % 2 == 0) == (self.role == ChannelRole::Server))
    }

    pub async fn send_message(&self, payload: &[u8]) -> MuxResult<()> {
        if payload.is_empty() {
            return Ok(());
        }
        self.writer.write_frame(MESSAGE_PORT, payload).await
    }

    pub async fn send_keepalive(&self) -> MuxResult<()> {
        self.writer.write_frame(MESSAGE_PORT, &[]).await
    }

    /// Open a new outbound stream. Ports wrap around; a recently closed
    /// port is only reused when nothing else is free.
    pub fn open_stream(&self) -> MuxResult<DataStream> {
        if self.writer.is_disposed() {
            return Err(MuxError::Disposed);
        }
        let (first, count) = match self.role {
            ChannelRole::Server => (2u32, 32_767u32),
            ChannelRole::Client => (1u32, 32_768u32),
        };

        let mut fallback = None;
        for _ in 0..count {
            let index = self.next_port.fetch_add(1, Ordering::Relaxed) % count;
            let port = (first + 2 * index) as u16;
            if self.streams.open.contains_key(&port) {
                continue;
            }
            if self.streams.closed_within(port, PORT_REUSE_DELAY) {
                if fallback.is_none() {
                    fallback = Some(port);
                }
                continue;
            }
            if let Some(stream) = self.register_stream(port) {
                return Ok(stream);
            }
        }
        fallback
            .and_then(|port| self.register_stream(port))
            .ok_or(MuxError::NoFreePort)
    }

    /// Claim a stream the remote opened
    pub fn accept_stream(&self, port: u16) -> Option<DataStream> {
        self.accept_queue.remove(&port).map(|(_, (stream, _))| stream)
    }

    pub fn open_stream_count(&self) -> usize {
        self.streams.open.len()
    }

    pub fn pending_accept_count(&self) -> usize {
        self.accept_queue.len()
    }

    fn register_stream(&self, port: u16) -> Option<DataStream> {
        let (id, rx) = self.streams.claim(port)?;
        Some(DataStream::new(
            port,
            id,
            self.writer.clone(),
            self.streams.clone(),
            rx,
            self.read_timeout,
        ))
    }

    /// Close `port` on both ends after it failed to take a frame
    fn reset_stream(&self, port: u16, id: u64) {
        if self.streams.release(port, id) {
            // The queued handle no longer owns the slot, dropping it sends nothing
            self.accept_queue.remove(&port);
            send_close(&self.writer, port);
        }
    }

    /// Route one inbound frame. Never waits on a stream's reader.
    pub async fn dispatch(&self, frame: Frame) -> MuxResult<Dispatch> {
        let port = frame.port;
        if port == MESSAGE_PORT {
            return Ok(if frame.is_empty() {
                Dispatch::KeepAlive
            } else {
                Dispatch::Message(frame.payload)
            });
        }

        if frame.is_empty() {
            let existed = self.streams.remove(port);
            self.accept_queue.remove(&port);
            return Ok(if existed {
                Dispatch::StreamClosed(port)
            } else {
                Dispatch::Ignored
            });
        }

        let slot = self.streams.open.get(&port).map(|slot| (slot.id, slot.tx.clone()));
        if let Some((id, tx)) = slot {
            return Ok(match tx.try_send(frame.payload) {
                Ok(()) => Dispatch::StreamData(port),
                Err(TrySendError::Full(_)) => {
                    log::warn!("Stream {} is not being read, resetting it", port);
                    self.reset_stream(port, id);
                    Dispatch::StreamReset(port)
                }
                Err(TrySendError::Closed(_)) => {
                    self.reset_stream(port, id);
                    Dispatch::StreamReset(port)
                }
            });
        }

        if self.streams.closed_within(port, CLOSED_PORT_LINGER) {
            return Ok(Dispatch::Ignored);
        }
        if self.is_local_port(port) || self.writer.is_disposed() {
            return Err(MuxError::UnknownPort(port));
        }

        if self.accept_queue.len() >= MAX_PENDING_ACCEPTS {
            log::warn!("{} streams waiting to be accepted, refusing port {}", MAX_PENDING_ACCEPTS, port);
            self.streams.closed.insert(port, Instant::now());
            send_close(&self.writer, port);
            return Ok(Dispatch::StreamReset(port));
        }
        let Some(stream) = self.register_stream(port) else {
            return Ok(Dispatch::Ignored);
        };
        if let Some(slot) = self.streams.open.get(&port) {
            let _ = slot.tx.try_send(frame.payload);
        }
        self.accept_queue.insert(port, (stream, Instant::now()));
        Ok(Dispatch::StreamOpened(port))
    }

    /// Reset remote streams nobody accepted in time and forget old closed ports
    pub fn sweep(&self) {
        let now = Instant::now();
        let stale: Vec<u16> = self
            .accept_queue
            .iter()
            .filter(|entry| now.duration_since(entry.value().1) >= ACCEPT_TIMEOUT)
            .map(|entry| *entry.key())
            .collect();
        for port in stale {
            // Dropping the handle releases the port and sends the close frame
            if self.accept_queue.remove(&port).is_some() {
                log::debug!("Stream {} was never accepted, resetting it", port);
            }
        }
        self.streams
            .closed
            .retain(|_, closed_at| now.duration_since(*closed_at) < PORT_REUSE_DELAY);
    }

    /// Tear down every stream and fail pending writes
    pub fn dispose(&self) {
        self.writer.dispose();
        self.streams.clear();
        self.accept_queue.clear();
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.dispose();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::BoxFuture;
    use tokio::io::{split, DuplexStream, ReadHalf};

    fn mux_over(stream: DuplexStream, role: ChannelRole) -> (Arc<Multiplexer>, ReadHalf<DuplexStream>) {
        let (read, write) = split(stream);
        let writer = Arc::new(FrameWriter::new(
            Box::new(write),
            None,
            RekeyPolicy::default(),
            Duration::from_secs(5),
        ));
        (
            Arc::new(Multiplexer::new(writer, role, Duration::from_secs(5))),
            read,
        )
    }

    /// Drive `mux` from `read`, forwarding dispatch results
    fn pump(mux: Arc<Multiplexer>, mut read: ReadHalf<DuplexStream>) -> mpsc::Receiver<MuxResult<Dispatch>> {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Ok(Some(frame)) = Frame::read_from(&mut read).await {
                let result = mux.dispatch(frame).await;
                let failed = result.is_err();
                if tx.send(result).await.is_err() || failed {
                    break;
                }
            }
        });
        rx
    }

    fn pair() -> (Arc<Multiplexer>, ReadHalf<DuplexStream>, Arc<Multiplexer>, ReadHalf<DuplexStream>) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let (client, client_read) = mux_over(a, ChannelRole::Client);
        let (server, server_read) = mux_over(b, ChannelRole::Server);
        (client, client_read, server, server_read)
    }

    #[tokio::test]
    async fn test_frame_encoding() {
        let bytes = Frame::encode(7, b"abc").unwrap();
        assert_eq!(bytes.as_ref(), &[7, 0, 3, 0, b'a', b'b', b'c']);
        let mut reader = &bytes[..];
        assert_eq!(Frame::read_from(&mut reader).await.unwrap(), Some(Frame::new(7, &b"abc"[..])));
        assert_eq!(Frame::read_from(&mut reader).await.unwrap(), None);

        let mut truncated = &bytes[..2];
        assert!(Frame::read_from(&mut truncated).await.is_err());
        assert!(matches!(
            Frame::encode(1, &vec![0u8; MAX_FRAME_PAYLOAD + 1]),
            Err(MuxError::PayloadTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_port_parity() {
        let (client, _, server, _) = pair();
        assert!(client.is_local_port(1));
        assert!(!client.is_local_port(2));
        assert!(server.is_local_port(2));
        assert!(!server.is_local_port(0));

        let a = client.open_stream().unwrap();
        let b = client.open_stream().unwrap();
        assert_eq!((a.port(), b.port()), (1, 3));
        assert_eq!(server.open_stream().unwrap().port(), 2);
    }

    #[tokio::test]
    async fn test_messages_and_keepalive() {
        let (client, _client_read, server, server_read) = pair();
        let mut events = pump(server, server_read);

        client.send_message(b"hello").await.unwrap();
        client.send_keepalive().await.unwrap();
        assert_eq!(
            events.recv().await.unwrap().unwrap(),
            Dispatch::Message(Bytes::from_static(b"hello"))
        );
        assert_eq!(events.recv().await.unwrap().unwrap(), Dispatch::KeepAlive);
    }

    #[tokio::test]
    async fn test_substream_roundtrip_and_close() {
        let (client, _client_read, server, server_read) = pair();
        let mut events = pump(server.clone(), server_read);

        let data: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
        let outbound = client.open_stream().unwrap();
        let writer_data = data.clone();
        let sender = tokio::spawn(async move {
            outbound.write_all(&writer_data).await.unwrap();
            outbound.close().await.unwrap();
        });

        let port = match events.recv().await.unwrap().unwrap() {
            Dispatch::StreamOpened(port) => port,
            other => panic!("expected stream open, got {:?}", other),
        };
        assert_eq!(port, 1);
        let inbound = server.accept_stream(port).unwrap();
        assert!(server.accept_stream(port).is_none());

        let received = inbound.read_to_end().await.unwrap();
        sender.await.unwrap();
        assert_eq!(received, data);
        assert!(matches!(inbound.write_all(b"late").await, Err(MuxError::Closed(1))));
    }

    #[tokio::test]
    async fn test_unknown_local_port_is_desync() {
        let (client, _client_read, server, server_read) = pair();
        let mut events = pump(server, server_read);

        // Even port is the server's own parity
        client.writer().write_frame(4, b"bogus").await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), Err(MuxError::UnknownPort(4))));
    }

    #[tokio::test]
    async fn test_close_for_unknown_port_ignored() {
        let (client, _client_read, server, server_read) = pair();
        let mut events = pump(server, server_read);
        client.writer().write_frame(9, &[]).await.unwrap();
        assert_eq!(events.recv().await.unwrap().unwrap(), Dispatch::Ignored);
    }

    #[tokio::test]
    async fn test_unread_stream_is_reset_not_blocking() {
        let (client, client_read, server, server_read) = pair();
        let mut events = pump(server.clone(), server_read);
        let mut client_events = pump(client.clone(), client_read);

        let outbound = client.open_stream().unwrap();
        for _ in 0..STREAM_BUFFER_FRAMES + 6 {
            outbound.write_all(b"x").await.unwrap();
        }
        client.send_message(b"hello").await.unwrap();

        let mut seen = Vec::new();
        loop {
            let dispatch = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("session reader is stuck")
                .unwrap()
                .unwrap();
            if dispatch == Dispatch::Message(Bytes::from_static(b"hello")) {
                break;
            }
            seen.push(dispatch);
        }
        assert_eq!(seen[0], Dispatch::StreamOpened(1));
        assert!(seen.contains(&Dispatch::StreamReset(1)));
        assert!(server.accept_stream(1).is_none());

        // The reset reaches the opener
        let closed = tokio::time::timeout(Duration::from_secs(2), client_events.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(closed, Dispatch::StreamClosed(1));
        assert!(matches!(outbound.write_all(b"more").await, Err(MuxError::Closed(1))));
    }

    #[tokio::test]
    async fn test_accept_queue_is_bounded() {
        let (client, _client_read, server, server_read) = pair();
        let mut events = pump(server.clone(), server_read);

        let mut streams = Vec::new();
        for _ in 0..MAX_PENDING_ACCEPTS + 1 {
            let stream = client.open_stream().unwrap();
            stream.write_all(b"open").await.unwrap();
            streams.push(stream);
        }
        let mut opened = 0;
        let mut refused = 0;
        for _ in 0..MAX_PENDING_ACCEPTS + 1 {
            match events.recv().await.unwrap().unwrap() {
                Dispatch::StreamOpened(_) => opened += 1,
                Dispatch::StreamReset(_) => refused += 1,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!((opened, refused), (MAX_PENDING_ACCEPTS, 1));
        assert_eq!(server.pending_accept_count(), MAX_PENDING_ACCEPTS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_resets_unaccepted_streams() {
        let (client, client_read, server, server_read) = pair();
        let mut events = pump(server.clone(), server_read);
        let mut client_events = pump(client.clone(), client_read);

        let outbound = client.open_stream().unwrap();
        outbound.write_all(b"anyone?").await.unwrap();
        assert_eq!(events.recv().await.unwrap().unwrap(), Dispatch::StreamOpened(1));

        server.sweep();
        assert_eq!(server.pending_accept_count(), 1);

        tokio::time::advance(ACCEPT_TIMEOUT).await;
        server.sweep();
        assert_eq!(server.pending_accept_count(), 0);
        assert!(server.accept_stream(1).is_none());
        assert_eq!(client_events.recv().await.unwrap().unwrap(), Dispatch::StreamClosed(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ports_wrap_around() {
        let (client, _client_read, _server, _server_read) = pair();
        let kept = client.open_stream().unwrap();
        assert_eq!(kept.port(), 1);
        for _ in 0..32_767 {
            let stream = client.open_stream().unwrap();
            assert_ne!(stream.port(), 1);
        }

        // Every other odd port was closed a moment ago: one of them is reused
        let reused = client.open_stream().unwrap();
        assert_eq!(reused.port(), 3);
        drop(reused);

        tokio::time::advance(PORT_REUSE_DELAY).await;
        for _ in 0..10 {
            let stream = client.open_stream().unwrap();
            assert_ne!(stream.port(), 1);
            assert_eq!(stream.port() % 2, 1);
        }
        assert_eq!(client.open_stream_count(), 1);
    }

    #[tokio::test]
    async fn test_late_data_after_local_close_is_dropped() {
        let (client, _client_read, server, server_read) = pair();
        let mut events = pump(server.clone(), server_read);

        // Server-opened stream, closed locally while the client is still sending
        let local = server.open_stream().unwrap();
        let port = local.port();
        local.close().await.unwrap();
        client.writer().write_frame(port, b"in flight").await.unwrap();
        client.send_message(b"still in sync").await.unwrap();
        assert_eq!(events.recv().await.unwrap().unwrap(), Dispatch::Ignored);
        assert_eq!(
            events.recv().await.unwrap().unwrap(),
            Dispatch::Message(Bytes::from_static(b"still in sync"))
        );

        // Remote-opened stream dropped locally: late data must not reopen it
        let outbound = client.open_stream().unwrap();
        outbound.write_all(b"one").await.unwrap();
        assert_eq!(events.recv().await.unwrap().unwrap(), Dispatch::StreamOpened(1));
        drop(server.accept_stream(1).unwrap());
        client.writer().write_frame(1, b"two").await.unwrap();
        assert_eq!(events.recv().await.unwrap().unwrap(), Dispatch::Ignored);
        assert!(server.accept_stream(1).is_none());
    }

    #[tokio::test]
    async fn test_dispose_unblocks_reader_and_writer() {
        let (client, _client_read, _server, _server_read) = pair();
        let stream = Arc::new(client.open_stream().unwrap());

        let reader = {
            let stream = stream.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                stream.read(&mut buf).await
            })
        };
        tokio::task::yield_now().await;
        client.dispose();

        let read = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("read must wake after dispose")
            .unwrap();
        assert_eq!(read.unwrap(), 0);
        assert!(matches!(stream.write_all(b"x").await, Err(MuxError::Disposed)));
        assert!(matches!(client.open_stream(), Err(MuxError::Disposed)));
    }

    #[tokio::test]
    async fn test_dispose_fails_blocked_write() {
        // Tiny pipe nobody reads: the second write blocks on backpressure
        let (a, _b) = tokio::io::duplex(8);
        let (client, _read) = mux_over(a, ChannelRole::Client);
        let stream = Arc::new(client.open_stream().unwrap());

        let writer = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.write_all(&[1u8; 1024]).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.dispose();

        let result = tokio::time::timeout(Duration::from_secs(1), writer).await.unwrap().unwrap();
        assert!(matches!(result, Err(MuxError::Disposed)));
    }

    struct CountingRekey(AtomicU64);

    impl Rekey for CountingRekey {
        fn renegotiate(&self) -> BoxFuture<'_, io::Result<()>> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn test_rekey_after_byte_threshold() {
        let (a, mut b) = tokio::io::duplex(64 * 1024);
        let rekey = Arc::new(CountingRekey(AtomicU64::new(0)));
        let writer = FrameWriter::new(
            Box::new(a),
            Some(rekey.clone()),
            RekeyPolicy {
                max_bytes: 100,
                max_age: Duration::from_secs(3600),
            },
            Duration::from_secs(5),
        );

        writer.write_frame(0, &[0u8; 60]).await.unwrap();
        writer.write_frame(0, &[0u8; 60]).await.unwrap();
        assert_eq!(rekey.0.load(Ordering::Relaxed), 0);
        // 128 bytes written so far, the next frame renegotiates first
        writer.write_frame(0, &[0u8; 10]).await.unwrap();
        assert_eq!(rekey.0.load(Ordering::Relaxed), 1);
        assert_eq!(writer.rekeys(), 1);

        // No frame lost across the renegotiation
        for len in [60usize, 60, 10] {
            let frame = Frame::read_from(&mut b).await.unwrap().unwrap();
            assert_eq!(frame.payload.len(), len);
        }
    }
}
