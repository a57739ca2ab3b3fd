//! BitChat Network - Network Status Reconciler
//!
//! Gossip-style classification of a chat's connectivity:
//! - port-0 message codec (peer exchange and chat payloads)
//! - `reconcile`: pure pass over one snapshot of members and peer reports
//! - `NetworkStatusReconciler`: debounced driver, at most one pass at a time
//!   per chat, plus a slow re-check while the network is partial
//!
//! Best effort and eventually consistent. Briefly reporting `Partial` for a
//! network that is in fact fully connected is acceptable.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::channel::BoxFuture;
use crate::peer_endpoint::{EndpointError, PeerEndpointInfo};

// =============================================================================
// Error Types
// =============================================================================

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("Empty message")]
    Empty,

    #[error("Unknown message kind: {0:#04x}")]
    UnknownKind(u8),

    #[error("Malformed peer list: {0}")]
    Endpoint(#[from] EndpointError),

    #[error("Trailing bytes after peer list")]
    TrailingData,
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;

// =============================================================================
// Port-0 messages
// =============================================================================

pub const KIND_PEER_EXCHANGE: u8 = 0x01;
pub const KIND_CHAT: u8 = 0x02;

/// Payload of a port-0 frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChatMessage {
    /// Members the sender currently holds a session with
    PeerExchange(Vec<PeerEndpointInfo>),
    /// Opaque chat content
    Chat(Bytes),
}

impl ChatMessage {
    pub fn encode(&self) -> ReconcileResult<Bytes> {
        let mut buf = BytesMut::new();
        match self {
            ChatMessage::PeerExchange(peers) => {
                if peers.len() > u8::MAX as usize {
                    return Err(EndpointError::TooMany(peers.len()).into());
                }
                buf.put_u8(KIND_PEER_EXCHANGE);
                buf.put_u8(peers.len() as u8);
                for peer in peers {
                    peer.write_to(&mut buf)?;
                }
            }
            ChatMessage::Chat(payload) => {
                buf.reserve(1 + payload.len());
                buf.put_u8(KIND_CHAT);
                buf.put_slice(payload);
            }
        }
        Ok(buf.freeze())
    }

    pub fn decode(mut data: Bytes) -> ReconcileResult<Self> {
        if data.is_empty() {
            return Err(ReconcileError::Empty);
        }
        match data.get_u8() {
            KIND_PEER_EXCHANGE => {
                if data.remaining() < 1 {
                    return Err(EndpointError::Truncated.into());
                }
                let count = data.get_u8() as usize;
                let mut peers = Vec::with_capacity(count);
                for _ in 0..count {
                    peers.push(PeerEndpointInfo::read_from(&mut data)?);
                }
                if data.has_remaining() {
                    return Err(ReconcileError::TrailingData);
                }
                Ok(ChatMessage::PeerExchange(peers))
            }
            KIND_CHAT => Ok(ChatMessage::Chat(data)),
            other => Err(ReconcileError::UnknownKind(other)),
        }
    }
}

// =============================================================================
// Status
// =============================================================================

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NetworkStatus {
    /// Nobody reachable
    None = 0,
    /// Some members have no path from us
    Partial = 1,
    /// Every member reachable, directly or through a peer
    Full = 2,
}

impl NetworkStatus {
    fn from_u8(val: u8) -> Self {
        match val {
            1 => Self::Partial,
            2 => Self::Full,
            _ => Self::None,
        }
    }
}

// =============================================================================
// Reconciliation pass
// =============================================================================

/// Snapshot a pass works on
#[derive(Clone, Debug, Default)]
pub struct ReconcileInput {
    pub local_email: String,
    /// Every known member except ourselves, with last known endpoints
    pub members: Vec<PeerEndpointInfo>,
    /// Members we hold an open session with
    pub connected: Vec<PeerEndpointInfo>,
    /// Latest peer-exchange list of each connected member, keyed by its email
    pub reported: HashMap<String, Vec<PeerEndpointInfo>>,
}

/// Who one connected member reports being connected with
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerConnectivity {
    pub email: String,
    pub connected_with: Vec<String>,
    pub not_connected_with: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub status: NetworkStatus,
    /// Members with no path from us at all
    pub disconnected: Vec<PeerEndpointInfo>,
    /// Members without a direct session; dial candidates
    pub not_connected: Vec<PeerEndpointInfo>,
    /// Members first heard of through peer exchange
    pub new_members: Vec<PeerEndpointInfo>,
    pub connectivity: Vec<PeerConnectivity>,
}

impl Default for ReconcileOutcome {
    fn default() -> Self {
        Self {
            status: NetworkStatus::None,
            disconnected: Vec::new(),
            not_connected: Vec::new(),
            new_members: Vec::new(),
            connectivity: Vec::new(),
        }
    }
}

/// Classify connectivity from one snapshot
pub fn reconcile(input: &ReconcileInput) -> ReconcileOutcome {
    let me = input.local_email.to_lowercase();

    // Membership with every endpoint heard of so far
    let mut members: BTreeMap<String, PeerEndpointInfo> = BTreeMap::new();
    for member in &input.members {
        let key = member.key();
        if key != me {
            members.entry(key).or_insert_with(|| member.clone());
        }
    }
    let known: BTreeSet<String> = members.keys().cloned().collect();

    let connected: BTreeSet<String> = input
        .connected
        .iter()
        .map(|p| p.key())
        .filter(|k| *k != me)
        .collect();

    // Union of direct sessions and what every connected member reports
    let mut reachable = connected.clone();
    for (reporter, peers) in &input.reported {
        if !connected.contains(&reporter.to_lowercase()) {
            continue;
        }
        for peer in peers {
            let key = peer.key();
            if key == me {
                continue;
            }
            members
                .entry(key.clone())
                .or_insert_with(|| PeerEndpointInfo::new(peer.email.clone(), Vec::new()))
                .merge_endpoints(&peer.endpoints);
            reachable.insert(key);
        }
    }
    for peer in &input.connected {
        if let Some(member) = members.get_mut(&peer.key()) {
            member.merge_endpoints(&peer.endpoints);
        }
    }

    let new_members = members
        .iter()
        .filter(|(key, _)| !known.contains(*key) && !connected.contains(*key))
        .map(|(_, info)| info.clone())
        .collect();

    let disconnected: Vec<PeerEndpointInfo> = members
        .iter()
        .filter(|(key, _)| !reachable.contains(*key))
        .map(|(_, info)| info.clone())
        .collect();

    let not_connected = members
        .iter()
        .filter(|(key, _)| !connected.contains(*key))
        .map(|(_, info)| info.clone())
        .collect();

    let everyone: BTreeSet<String> = members.keys().cloned().chain(std::iter::once(me.clone())).collect();
    let connectivity = connected
        .iter()
        .map(|email| {
            let reported: BTreeSet<String> = input
                .reported
                .iter()
                .find(|(reporter, _)| reporter.eq_ignore_ascii_case(email))
                .map(|(_, peers)| peers.iter().map(|p| p.key()).collect())
                .unwrap_or_default();
            let mut with: BTreeSet<String> = reported.intersection(&everyone).cloned().collect();
            // A connected member is always connected with us
            with.insert(me.clone());
            with.remove(email);
            let without = everyone
                .iter()
                .filter(|k| *k != email && !with.contains(*k))
                .cloned()
                .collect();
            PeerConnectivity {
                email: email.clone(),
                connected_with: with.into_iter().collect(),
                not_connected_with: without,
            }
        })
        .collect();

    let status = if members.is_empty() || connected.is_empty() {
        NetworkStatus::None
    } else if disconnected.is_empty() {
        NetworkStatus::Full
    } else {
        NetworkStatus::Partial
    };

    ReconcileOutcome {
        status,
        disconnected,
        not_connected,
        new_members,
        connectivity,
    }
}

// =============================================================================
// Driver
// =============================================================================

/// What the reconciler needs from its chat
pub trait ReconcileSource: Send + Sync {
    fn snapshot(&self) -> BoxFuture<'_, ReconcileInput>;

    /// Act on a pass result (dial candidates, learn members)
    fn apply<'a>(&'a self, outcome: &'a ReconcileOutcome) -> BoxFuture<'a, ()>;

    fn status_changed(&self, status: NetworkStatus) -> BoxFuture<'_, ()>;
}

pub struct NetworkStatusReconciler {
    me: Weak<NetworkStatusReconciler>,
    source: Arc<dyn ReconcileSource>,
    debounce: Duration,
    partial_recheck: Duration,
    status: AtomicU8,
    /// A debounced pass is waiting to fire
    scheduled: AtomicBool,
    running: AtomicBool,
    triggered_again: AtomicBool,
    stopped: AtomicBool,
    last: Mutex<ReconcileOutcome>,
    debounce_task: Mutex<Option<JoinHandle<()>>>,
    recheck_task: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkStatusReconciler {
    pub fn new(source: Arc<dyn ReconcileSource>, debounce: Duration, partial_recheck: Duration) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            source,
            debounce,
            partial_recheck,
            status: AtomicU8::new(NetworkStatus::None as u8),
            scheduled: AtomicBool::new(false),
            running: AtomicBool::new(false),
            triggered_again: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            last: Mutex::new(ReconcileOutcome::default()),
            debounce_task: Mutex::new(None),
            recheck_task: Mutex::new(None),
        })
    }

    pub fn status(&self) -> NetworkStatus {
        NetworkStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Copy of the latest pass result
    pub fn last_outcome(&self) -> ReconcileOutcome {
        lock(&self.last).clone()
    }

    /// Request a pass; bursts within the debounce window coalesce into one
    pub fn trigger(&self) {
        if self.stopped.load(Ordering::Acquire) || self.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(reconciler) = self.me.upgrade() else {
            return;
        };
        let debounce = self.debounce;
        let task = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            reconciler.scheduled.store(false, Ordering::Release);
            reconciler.run().await;
        });
        *lock(&self.debounce_task) = Some(task);
    }

    /// Run a pass now, or queue one behind the pass in progress
    pub async fn run(&self) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        if self.running.swap(true, Ordering::AcqRel) {
            self.triggered_again.store(true, Ordering::Release);
            return;
        }
        loop {
            self.triggered_again.store(false, Ordering::Release);
            self.pass().await;
            if !self.triggered_again.swap(false, Ordering::AcqRel) {
                break;
            }
        }
        self.running.store(false, Ordering::Release);
        if self.triggered_again.swap(false, Ordering::AcqRel) {
            self.trigger();
        }
    }

    async fn pass(&self) {
        let input = self.source.snapshot().await;
        let outcome = reconcile(&input);
        log::debug!(
            "Reconciled {}: {:?}, {} unreachable, {} without session",
            input.local_email,
            outcome.status,
            outcome.disconnected.len(),
            outcome.not_connected.len()
        );

        self.source.apply(&outcome).await;

        let status = outcome.status;
        *lock(&self.last) = outcome;
        let previous = NetworkStatus::from_u8(self.status.swap(status as u8, Ordering::AcqRel));
        if previous != status {
            log::info!("Network status of {}: {:?} -> {:?}", input.local_email, previous, status);
            self.source.status_changed(status).await;
        }

        if status == NetworkStatus::Partial {
            self.start_recheck();
        } else if let Some(task) = lock(&self.recheck_task).take() {
            task.abort();
        }
    }

    fn start_recheck(&self) {
        let mut slot = lock(&self.recheck_task);
        if slot.as_ref().map_or(false, |task| !task.is_finished()) {
            return;
        }
        let me = self.me.clone();
        let interval = self.partial_recheck;
        *slot = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(reconciler) = me.upgrade() else {
                    return;
                };
                if reconciler.status() != NetworkStatus::Partial {
                    return;
                }
                reconciler.trigger();
            }
        }));
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(task) = lock(&self.debounce_task).take() {
            task.abort();
        }
        if let Some(task) = lock(&self.recheck_task).take() {
            task.abort();
        }
    }
}

impl Drop for NetworkStatusReconciler {
    fn drop(&mut self) {
        self.stop();
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
