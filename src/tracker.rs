//! BitChat Network - Tracker Manager
//!
//! Internet-wide peer discovery for one network:
//! - BitTorrent trackers (`udp://` BEP 15, `http(s)://` compact announce)
//! - A Kademlia DHT behind the [`DhtNode`] trait
//!
//! The network ID doubles as the info-hash. Each tracker runs its own poll
//! loop with retry back-off; discovered peers are surfaced through
//! [`TrackerEvent::DiscoveredPeers`].

use bytes::{Buf, BufMut, BytesMut};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

use crate::bencode::{self, Value};
use crate::channel::BoxFuture;
use crate::config::NetworkConfig;
use crate::identifier::Identifier;
use crate::peer_endpoint::normalize_endpoint;

// =============================================================================
// Error Types
// =============================================================================

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Invalid tracker URI: {0}")]
    InvalidUri(String),

    #[error("Tracker request timed out")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Malformed tracker response: {0}")]
    Protocol(String),

    #[error("Tracker refused announce: {0}")]
    Refused(String),
}

pub type TrackerResult<T> = Result<T, TrackerError>;

// =============================================================================
// Constants
// =============================================================================

/// BEP 15 magic connection ID
const UDP_PROTOCOL_ID: u64 = 0x41727101980;
const UDP_ACTION_CONNECT: u32 = 0;
const UDP_ACTION_ANNOUNCE: u32 = 1;
const UDP_ACTION_ERROR: u32 = 3;
const UDP_EVENT_STARTED: u32 = 2;

/// Lower bound on a tracker-advertised interval
pub const MIN_TRACKER_INTERVAL: Duration = Duration::from_secs(60);

/// Peers requested per announce
const NUM_WANT: i32 = 50;

/// Peer ID prefix (client "BC", version 01.00)
const PEER_ID_PREFIX: &[u8; 8] = b"-BC0100-";

// =============================================================================
// DHT collaborator
// =============================================================================

/// Kademlia DHT node. Implementations own routing and duplicate suppression.
pub trait DhtNode: Send + Sync {
    /// Announce ourselves for `network_id` and return the peers found
    fn announce<'a>(
        &'a self,
        network_id: &'a Identifier,
        service_port: u16,
    ) -> BoxFuture<'a, io::Result<Vec<SocketAddr>>>;

    /// Look up peers for `network_id` without announcing
    fn find_peers<'a>(&'a self, network_id: &'a Identifier) -> BoxFuture<'a, io::Result<Vec<SocketAddr>>>;

    /// Add a routing contact
    fn add_node(&self, node: SocketAddr);
}

// =============================================================================
// Tracker Clients
// =============================================================================

/// Result of one successful announce
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub interval: Option<Duration>,
    pub peers: Vec<SocketAddr>,
}

/// Parameters of an announce
#[derive(Clone, Debug)]
pub struct AnnounceRequest {
    pub info_hash: Identifier,
    pub peer_id: [u8; 20],
    pub port: u16,
}

impl AnnounceRequest {
    pub fn new(info_hash: Identifier, port: u16) -> Self {
        let mut peer_id = [0u8; 20];
        peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
        OsRng.fill_bytes(&mut peer_id[8..]);
        Self {
            info_hash,
            peer_id,
            port,
        }
    }

    fn info_hash_bytes(&self) -> [u8; 20] {
        let mut out = [0u8; 20];
        let src = self.info_hash.as_bytes();
        let n = src.len().min(20);
        out[..n].copy_from_slice(&src[..n]);
        out
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrackerClient {
    Udp { host: String },
    Http { url: String },
}

impl TrackerClient {
    pub fn parse(uri: &str) -> TrackerResult<Self> {
        let uri = uri.trim();
        if let Some(rest) = uri.strip_prefix("udp://") {
            let host = rest.split('/').next().unwrap_or_default();
            if host.is_empty() || !host.contains(':') {
                return Err(TrackerError::InvalidUri(uri.to_string()));
            }
            Ok(TrackerClient::Udp {
                host: host.to_string(),
            })
        } else if uri.starts_with("http://") || uri.starts_with("https://") {
            Ok(TrackerClient::Http {
                url: uri.to_string(),
            })
        } else {
            Err(TrackerError::InvalidUri(uri.to_string()))
        }
    }

    pub async fn announce(
        &self,
        request: &AnnounceRequest,
        http: &reqwest::Client,
        request_timeout: Duration,
    ) -> TrackerResult<AnnounceResponse> {
        match self {
            TrackerClient::Udp { host } => {
                match timeout(request_timeout, udp_announce(host, request)).await {
                    Ok(result) => result,
                    Err(_) => Err(TrackerError::Timeout),
                }
            }
            TrackerClient::Http { url } => http_announce(http, url, request, request_timeout).await,
        }
    }
}

async fn udp_announce(host: &str, request: &AnnounceRequest) -> TrackerResult<AnnounceResponse> {
    let target = tokio::net::lookup_host(host)
        .await?
        .next()
        .ok_or_else(|| TrackerError::InvalidUri(format!("cannot resolve {}", host)))?;
    let bind: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(target).await?;

    // Connect
    let txn = OsRng.next_u32();
    let mut buf = BytesMut::with_capacity(16);
    buf.put_u64(UDP_PROTOCOL_ID);
    buf.put_u32(UDP_ACTION_CONNECT);
    buf.put_u32(txn);
    socket.send(&buf).await?;

    let mut resp = [0u8; 2048];
    let len = socket.recv(&mut resp).await?;
    let connection_id = parse_udp_connect(&resp[..len], txn)?;

    // Announce
    let txn = OsRng.next_u32();
    socket.send(&build_udp_announce(connection_id, txn, request)).await?;
    let len = socket.recv(&mut resp).await?;
    parse_udp_announce(&resp[..len], txn, target.is_ipv6())
}

fn udp_error(data: &[u8]) -> TrackerError {
    let message = String::from_utf8_lossy(data.get(8..).unwrap_or_default()).to_string();
    TrackerError::Refused(message)
}

fn parse_udp_connect(data: &[u8], txn: u32) -> TrackerResult<u64> {
    if data.len() < 8 {
        return Err(TrackerError::Protocol("short connect response".into()));
    }
    let mut buf = data;
    let action = buf.get_u32();
    let got_txn = buf.get_u32();
    if got_txn != txn {
        return Err(TrackerError::Protocol("transaction id mismatch".into()));
    }
    match action {
        UDP_ACTION_CONNECT if buf.remaining() >= 8 => Ok(buf.get_u64()),
        UDP_ACTION_ERROR => Err(udp_error(data)),
        _ => Err(TrackerError::Protocol(format!("unexpected connect action {}", action))),
    }
}

fn build_udp_announce(connection_id: u64, txn: u32, request: &AnnounceRequest) -> BytesMut {
    let mut buf = BytesMut::with_capacity(98);
    buf.put_u64(connection_id);
    buf.put_u32(UDP_ACTION_ANNOUNCE);
    buf.put_u32(txn);
    buf.put_slice(&request.info_hash_bytes());
    buf.put_slice(&request.peer_id);
    buf.put_u64(0); // downloaded
    buf.put_u64(0); // left
    buf.put_u64(0); // uploaded
    buf.put_u32(UDP_EVENT_STARTED);
    buf.put_u32(0); // ip: use sender address
    buf.put_u32(OsRng.next_u32()); // key
    buf.put_i32(NUM_WANT);
    buf.put_u16(request.port);
    buf
}

fn parse_udp_announce(data: &[u8], txn: u32, ipv6: bool) -> TrackerResult<AnnounceResponse> {
    if data.len() < 8 {
        return Err(TrackerError::Protocol("short announce response".into()));
    }
    let mut buf = data;
    let action = buf.get_u32();
    let got_txn = buf.get_u32();
    if got_txn != txn {
        return Err(TrackerError::Protocol("transaction id mismatch".into()));
    }
    match action {
        UDP_ACTION_ANNOUNCE if buf.remaining() >= 12 => {
            let interval = buf.get_u32();
            let _leechers = buf.get_u32();
            let _seeders = buf.get_u32();
            let peers = if ipv6 {
                parse_compact_v6(buf)
            } else {
                parse_compact_v4(buf)
            };
            Ok(AnnounceResponse {
                interval: Some(Duration::from_secs(interval as u64)),
                peers,
            })
        }
        UDP_ACTION_ERROR => Err(udp_error(data)),
        _ => Err(TrackerError::Protocol(format!("unexpected announce action {}", action))),
    }
}

fn parse_compact_v4(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(6)
        .map(|c| {
            let ip = Ipv4Addr::new(c[0], c[1], c[2], c[3]);
            SocketAddr::new(IpAddr::V4(ip), u16::from_be_bytes([c[4], c[5]]))
        })
        .filter(|a| a.port() != 0)
        .collect()
}

fn parse_compact_v6(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(18)
        .map(|c| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&c[..16]);
            let addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), u16::from_be_bytes([c[16], c[17]]));
            normalize_endpoint(addr)
        })
        .filter(|a| a.port() != 0)
        .collect()
}

/// Percent-encode raw bytes for a query string
fn url_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for &b in bytes {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

fn http_announce_url(base: &str, request: &AnnounceRequest) -> String {
    let sep = if base.contains('?') { '&' } else { '?' };
    format!(
        "{}{}info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left=0&compact=1&event=started&numwant={}",
        base,
        sep,
        url_encode(&request.info_hash_bytes()),
        url_encode(&request.peer_id),
        request.port,
        NUM_WANT
    )
}

async fn http_announce(
    client: &reqwest::Client,
    base: &str,
    request: &AnnounceRequest,
    request_timeout: Duration,
) -> TrackerResult<AnnounceResponse> {
    let url = http_announce_url(base, request);
    let response = client
        .get(&url)
        .timeout(request_timeout)
        .send()
        .await
        .map_err(|e| if e.is_timeout() { TrackerError::Timeout } else { e.into() })?
        .error_for_status()?;
    let body = response.bytes().await?;
    parse_http_response(&body)
}

/// Parse a bencoded announce response
pub fn parse_http_response(body: &[u8]) -> TrackerResult<AnnounceResponse> {
    let value = bencode::decode(body).map_err(|e| TrackerError::Protocol(e.to_string()))?;
    if let Some(reason) = value.get("failure reason") {
        return Err(TrackerError::Refused(reason.as_str().unwrap_or("unknown").to_string()));
    }

    let interval = value
        .get("interval")
        .and_then(Value::as_int)
        .filter(|i| *i > 0)
        .map(|i| Duration::from_secs(i as u64));

    let mut peers = Vec::new();
    match value.get("peers") {
        Some(Value::Bytes(compact)) => peers.extend(parse_compact_v4(compact)),
        Some(Value::List(list)) => {
            for entry in list {
                let ip = entry.get("ip").and_then(Value::as_str).and_then(|s| s.parse::<IpAddr>().ok());
                let port = entry
                    .get("port")
                    .and_then(Value::as_int)
                    .and_then(|p| u16::try_from(p).ok());
                if let (Some(ip), Some(port)) = (ip, port) {
                    if port != 0 {
                        peers.push(normalize_endpoint(SocketAddr::new(ip, port)));
                    }
                }
            }
        }
        _ => {}
    }
    if let Some(compact6) = value.get("peers6").and_then(Value::as_bytes) {
        peers.extend(parse_compact_v6(compact6));
    }

    Ok(AnnounceResponse { interval, peers })
}

// =============================================================================
// Schedule
// =============================================================================

/// Poll schedule and last result of one tracker
#[derive(Clone, Debug)]
pub struct TrackerSchedule {
    pub consecutive_failures: u32,
    pub next_update: Instant,
    pub last_error: Option<String>,
    pub peer_count: usize,
}

impl TrackerSchedule {
    pub fn new(now: Instant) -> Self {
        Self {
            consecutive_failures: 0,
            next_update: now,
            last_error: None,
            peer_count: 0,
        }
    }

    pub fn on_success(&mut self, response: &AnnounceResponse, now: Instant, config: &NetworkConfig) {
        self.consecutive_failures = 0;
        self.last_error = None;
        self.peer_count = response.peers.len();
        let interval = match response.interval {
            Some(advertised) => advertised.max(MIN_TRACKER_INTERVAL),
            None => config.tracker_default_interval(),
        };
        self.next_update = now + interval;
    }

    pub fn on_failure(&mut self, error: &TrackerError, now: Instant, config: &NetworkConfig) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_error = Some(error.to_string());
        let interval = if self.consecutive_failures <= config.tracker_retry_count {
            config.tracker_retry_interval()
        } else {
            config.tracker_failed_interval()
        };
        self.next_update = now + interval;
    }
}

/// Snapshot of a tracker for display
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackerStatus {
    pub uri: String,
    pub last_error: Option<String>,
    pub next_update_in: Duration,
    pub peer_count: usize,
}

// =============================================================================
// Tracker Manager
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrackerEvent {
    DiscoveredPeers {
        network_id: Identifier,
        peers: Vec<SocketAddr>,
    },
}

struct TrackerEntry {
    client: TrackerClient,
    schedule: TrackerSchedule,
}

/// State shared with the poll tasks
struct Shared {
    config: NetworkConfig,
    request: AnnounceRequest,
    http: reqwest::Client,
    trackers: RwLock<HashMap<String, TrackerEntry>>,
    /// Bumped by `update_now`; each poll task keeps its own receiver
    wake: watch::Sender<u64>,
    event_handler: RwLock<Option<mpsc::Sender<TrackerEvent>>>,
}

impl Shared {
    async fn emit(&self, peers: Vec<SocketAddr>) {
        if peers.is_empty() {
            return;
        }
        if let Some(ref h) = *self.event_handler.read().await {
            let event = TrackerEvent::DiscoveredPeers {
                network_id: self.request.info_hash.clone(),
                peers,
            };
            if let Err(mpsc::error::TrySendError::Full(_)) = h.try_send(event) {
                log::warn!("Tracker event queue full, dropping discovered peers");
            }
        }
    }
}

/// Polls every tracker and the DHT for one network
pub struct TrackerManager {
    shared: Arc<Shared>,
    dht: Option<Arc<dyn DhtNode>>,
    tasks: RwLock<HashMap<String, JoinHandle<()>>>,
    dht_task: RwLock<Option<JoinHandle<()>>>,
    running: RwLock<bool>,
}

impl TrackerManager {
    pub fn new(
        network_id: Identifier,
        service_port: u16,
        config: NetworkConfig,
        dht: Option<Arc<dyn DhtNode>>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(concat!("bitchat-net/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        let trackers = config
            .trackers
            .iter()
            .filter_map(|uri| match TrackerClient::parse(uri) {
                Ok(client) => Some((
                    uri.clone(),
                    TrackerEntry {
                        client,
                        schedule: TrackerSchedule::new(Instant::now()),
                    },
                )),
                Err(e) => {
                    log::warn!("Ignoring tracker {}: {}", uri, e);
                    None
                }
            })
            .collect();

        Self {
            shared: Arc::new(Shared {
                request: AnnounceRequest::new(network_id, service_port),
                config,
                http,
                trackers: RwLock::new(trackers),
                wake: watch::channel(0).0,
                event_handler: RwLock::new(None),
            }),
            dht,
            tasks: RwLock::new(HashMap::new()),
            dht_task: RwLock::new(None),
            running: RwLock::new(false),
        }
    }

    pub fn network_id(&self) -> &Identifier {
        &self.shared.request.info_hash
    }

    pub async fn set_event_handler(&self, handler: mpsc::Sender<TrackerEvent>) {
        *self.shared.event_handler.write().await = Some(handler);
    }

    pub async fn add_tracker(&self, uri: &str) -> TrackerResult<()> {
        let client = TrackerClient::parse(uri)?;
        {
            let mut trackers = self.shared.trackers.write().await;
            if trackers.contains_key(uri) {
                return Ok(());
            }
            trackers.insert(
                uri.to_string(),
                TrackerEntry {
                    client,
                    schedule: TrackerSchedule::new(Instant::now()),
                },
            );
        }
        if *self.running.read().await {
            self.spawn_tracker(uri.to_string()).await;
        }
        Ok(())
    }

    pub async fn remove_tracker(&self, uri: &str) {
        self.shared.trackers.write().await.remove(uri);
        if let Some(task) = self.tasks.write().await.remove(uri) {
            task.abort();
        }
    }

    pub async fn start(&self) {
        {
            let mut running = self.running.write().await;
            if *running {
                return;
            }
            *running = true;
        }

        let uris: Vec<String> = self.shared.trackers.read().await.keys().cloned().collect();
        for uri in uris {
            self.spawn_tracker(uri).await;
        }

        if let Some(dht) = &self.dht {
            let task = tokio::spawn(Self::dht_loop(self.shared.clone(), dht.clone()));
            *self.dht_task.write().await = Some(task);
        }
        log::info!("Tracker manager started for network {}", self.network_id().short());
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
        for (_, task) in self.tasks.write().await.drain() {
            task.abort();
        }
        if let Some(task) = self.dht_task.write().await.take() {
            task.abort();
        }
    }

    /// Poll every tracker and the DHT now
    pub async fn update_now(&self) {
        let now = Instant::now();
        for entry in self.shared.trackers.write().await.values_mut() {
            entry.schedule.next_update = now;
        }
        self.shared.wake.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    pub async fn tracker_status(&self) -> Vec<TrackerStatus> {
        let now = Instant::now();
        let mut status: Vec<TrackerStatus> = self
            .shared
            .trackers
            .read()
            .await
            .iter()
            .map(|(uri, entry)| TrackerStatus {
                uri: uri.clone(),
                last_error: entry.schedule.last_error.clone(),
                next_update_in: entry.schedule.next_update.saturating_duration_since(now),
                peer_count: entry.schedule.peer_count,
            })
            .collect();
        status.sort_by(|a, b| a.uri.cmp(&b.uri));
        status
    }

    async fn spawn_tracker(&self, uri: String) {
        let task = tokio::spawn(Self::tracker_loop(self.shared.clone(), uri.clone()));
        if let Some(old) = self.tasks.write().await.insert(uri, task) {
            old.abort();
        }
    }

    async fn tracker_loop(shared: Arc<Shared>, uri: String) {
        let mut wake = shared.wake.subscribe();
        loop {
            let (client, next_update) = match shared.trackers.read().await.get(&uri) {
                Some(entry) => (entry.client.clone(), entry.schedule.next_update),
                None => return,
            };

            if next_update > Instant::now() {
                tokio::select! {
                    _ = tokio::time::sleep_until(next_update) => {}
                    _ = wake.changed() => {}
                }
                continue;
            }

            // A wake-up arriving while the announce is in flight schedules another poll
            wake.borrow_and_update();
            let result = client
                .announce(&shared.request, &shared.http, shared.config.tracker_timeout())
                .await;

            let peers = {
                let mut trackers = shared.trackers.write().await;
                let Some(entry) = trackers.get_mut(&uri) else {
                    return;
                };
                let peers = match result {
                    Ok(response) => {
                        entry.schedule.on_success(&response, Instant::now(), &shared.config);
                        log::debug!("Tracker {} returned {} peers", uri, response.peers.len());
                        response.peers
                    }
                    Err(e) => {
                        entry.schedule.on_failure(&e, Instant::now(), &shared.config);
                        log::debug!(
                            "Tracker {} failed ({} in a row): {}",
                            uri,
                            entry.schedule.consecutive_failures,
                            e
                        );
                        Vec::new()
                    }
                };
                if wake.has_changed().unwrap_or(false) {
                    entry.schedule.next_update = Instant::now();
                }
                peers
            };
            shared.emit(peers).await;
        }
    }

    async fn dht_loop(shared: Arc<Shared>, dht: Arc<dyn DhtNode>) {
        let network_id = shared.request.info_hash.clone();
        let port = shared.request.port;
        let mut wake = shared.wake.subscribe();
        loop {
            wake.borrow_and_update();
            let result = if shared.config.dht_lookup_only {
                dht.find_peers(&network_id).await
            } else {
                dht.announce(&network_id, port).await
            };

            match result {
                Ok(peers) => {
                    log::debug!("DHT returned {} peers for {}", peers.len(), network_id.short());
                    for peer in &peers {
                        dht.add_node(*peer);
                    }
                    shared.emit(peers).await;
                }
                Err(e) => log::debug!("DHT poll for {} failed: {}", network_id.short(), e),
            }

            if wake.has_changed().unwrap_or(false) {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(shared.config.dht_interval()) => {}
                _ = wake.changed() => {}
            }
        }
    }
}

impl Drop for TrackerManager {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.try_write() {
            for (_, task) in tasks.drain() {
                task.abort();
            }
        }
        if let Ok(mut task) = self.dht_task.try_write() {
            if let Some(task) = task.take() {
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
    use std::sync::Mutex;

    #[test]
    fn test_parse_uris() {
        assert_eq!(
            TrackerClient::parse("udp://tracker.example.org:1337/announce").unwrap(),
            TrackerClient::Udp {
                host: "tracker.example.org:1337".into()
            }
        );
        assert!(matches!(
            TrackerClient::parse("https://t.example/announce").unwrap(),
            TrackerClient::Http { .. }
        ));
        assert!(TrackerClient::parse("udp://noport").is_err());
        assert!(TrackerClient::parse("wss://t.example").is_err());
    }

    #[test]
    fn test_compact_http_response() {
        let body = b"d8:intervali900e5:peers12:\x0a\x00\x00\x01\x1a\xe1\xc0\xa8\x01\x02\x00\x50e";
        let response = parse_http_response(body).unwrap();
        assert_eq!(response.interval, Some(Duration::from_secs(900)));
        assert_eq!(
            response.peers,
            vec![
                "10.0.0.1:6881".parse::<SocketAddr>().unwrap(),
                "192.168.1.2:80".parse().unwrap()
            ]
        );
    }

    #[test]
    fn test_dict_and_v6_peers() {
        let mut body = b"d5:peersld2:ip8:10.0.0.74:porti7000eee6:peers618:".to_vec();
        body.extend_from_slice(&Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1).octets());
        body.extend_from_slice(&9000u16.to_be_bytes());
        body.push(b'e');
        let response = parse_http_response(&body).unwrap();
        assert_eq!(response.interval, None);
        assert_eq!(response.peers.len(), 2);
        assert_eq!(response.peers[0], "10.0.0.7:7000".parse::<SocketAddr>().unwrap());
        assert_eq!(response.peers[1], "[2001:db8::1]:9000".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_failure_reason() {
        let err = parse_http_response(b"d14:failure reason9:not founde").unwrap_err();
        assert!(matches!(err, TrackerError::Refused(ref r) if r == "not found"));
    }

    #[test]
    fn test_url_encoding() {
        assert_eq!(url_encode(&[0x12, b'a', b' ', 0xff, b'~']), "%12a%20%FF~");
        let request = AnnounceRequest::new(Identifier::from_array([0xab; 20]), 4000);
        let url = http_announce_url("http://t.example/announce?key=1", &request);
        assert!(url.starts_with("http://t.example/announce?key=1&info_hash=%AB%AB"));
        assert!(url.contains("&port=4000&"));
        assert_eq!(&request.peer_id[..8], PEER_ID_PREFIX);
    }

    #[test]
    fn test_udp_packets() {
        let request = AnnounceRequest::new(Identifier::from_array([7; 20]), 5555);
        let packet = build_udp_announce(42, 9, &request);
        assert_eq!(packet.len(), 98);
        assert_eq!(&packet[16..36], &[7u8; 20]);
        assert_eq!(u16::from_be_bytes([packet[96], packet[97]]), 5555);

        let mut connect = BytesMut::new();
        connect.put_u32(UDP_ACTION_CONNECT);
        connect.put_u32(77);
        connect.put_u64(0xdead_beef);
        assert_eq!(parse_udp_connect(&connect, 77).unwrap(), 0xdead_beef);
        assert!(parse_udp_connect(&connect, 78).is_err());

        let mut announce = BytesMut::new();
        announce.put_u32(UDP_ACTION_ANNOUNCE);
        announce.put_u32(5);
        announce.put_u32(1200);
        announce.put_u32(0);
        announce.put_u32(1);
        announce.put_slice(&[10, 0, 0, 9, 0x1f, 0x90]);
        let response = parse_udp_announce(&announce, 5, false).unwrap();
        assert_eq!(response.interval, Some(Duration::from_secs(1200)));
        assert_eq!(response.peers, vec!["10.0.0.9:8080".parse::<SocketAddr>().unwrap()]);

        let mut error = BytesMut::new();
        error.put_u32(UDP_ACTION_ERROR);
        error.put_u32(5);
        error.put_slice(b"banned");
        assert!(matches!(parse_udp_announce(&error, 5, false), Err(TrackerError::Refused(ref m)) if m == "banned"));
    }

    #[test]
    fn test_schedule_backoff() {
        let config = NetworkConfig::default();
        let now = Instant::now();
        let mut schedule = TrackerSchedule::new(now);
        let err = TrackerError::Timeout;

        for _ in 0..3 {
            schedule.on_failure(&err, now, &config);
            assert_eq!(schedule.next_update - now, config.tracker_retry_interval());
        }
        schedule.on_failure(&err, now, &config);
        assert_eq!(schedule.next_update - now, config.tracker_failed_interval());
        assert_eq!(schedule.last_error.as_deref(), Some("Tracker request timed out"));

        let response = AnnounceResponse {
            interval: Some(Duration::from_secs(5)),
            peers: vec!["1.2.3.4:5".parse().unwrap()],
        };
        schedule.on_success(&response, now, &config);
        assert_eq!(schedule.consecutive_failures, 0);
        assert_eq!(schedule.next_update - now, MIN_TRACKER_INTERVAL);
        assert_eq!(schedule.peer_count, 1);

        schedule.on_success(&AnnounceResponse::default(), now, &config);
        assert_eq!(schedule.next_update - now, config.tracker_default_interval());
    }

    struct MockDht {
        peers: Vec<SocketAddr>,
        added: Mutex<Vec<SocketAddr>>,
        announced: Mutex<u32>,
    }

    impl DhtNode for MockDht {
        fn announce<'a>(&'a self, _: &'a Identifier, _: u16) -> BoxFuture<'a, io::Result<Vec<SocketAddr>>> {
            *self.announced.lock().unwrap() += 1;
            let peers = self.peers.clone();
            Box::pin(async move { Ok(peers) })
        }

        fn find_peers<'a>(&'a self, _: &'a Identifier) -> BoxFuture<'a, io::Result<Vec<SocketAddr>>> {
            let peers = self.peers.clone();
            Box::pin(async move { Ok(peers) })
        }

        fn add_node(&self, node: SocketAddr) {
            self.added.lock().unwrap().push(node);
        }
    }

    #[tokio::test]
    async fn test_dht_peers_surface_as_event() {
        let peer: SocketAddr = "203.0.113.5:7000".parse().unwrap();
        let dht = Arc::new(MockDht {
            peers: vec![peer],
            added: Mutex::new(Vec::new()),
            announced: Mutex::new(0),
        });
        let network_id = Identifier::from_array([1; 20]);
        let manager = TrackerManager::new(network_id.clone(), 4000, NetworkConfig::default(), Some(dht.clone()));
        let (tx, mut rx) = mpsc::channel(8);
        manager.set_event_handler(tx).await;
        manager.start().await;

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            TrackerEvent::DiscoveredPeers {
                network_id,
                peers: vec![peer]
            }
        );
        assert_eq!(*dht.announced.lock().unwrap(), 1);
        assert_eq!(dht.added.lock().unwrap().as_slice(), &[peer]);
        manager.stop().await;
    }

    struct GatedDht {
        calls: std::sync::atomic::AtomicU32,
        gate: tokio::sync::Semaphore,
    }

    impl DhtNode for GatedDht {
        fn announce<'a>(&'a self, _: &'a Identifier, _: u16) -> BoxFuture<'a, io::Result<Vec<SocketAddr>>> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Box::pin(async move {
                if let Ok(permit) = self.gate.acquire().await {
                    permit.forget();
                }
                Ok(Vec::new())
            })
        }

        fn find_peers<'a>(&'a self, id: &'a Identifier) -> BoxFuture<'a, io::Result<Vec<SocketAddr>>> {
            self.announce(id, 0)
        }

        fn add_node(&self, _: SocketAddr) {}
    }

    async fn wait_for_calls(dht: &GatedDht, count: u32) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while dht.calls.load(std::sync::atomic::Ordering::SeqCst) < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_update_now_during_poll_is_not_lost() {
        let dht = Arc::new(GatedDht {
            calls: std::sync::atomic::AtomicU32::new(0),
            gate: tokio::sync::Semaphore::new(0),
        });
        let manager = TrackerManager::new(Identifier::from_array([3; 20]), 4000, NetworkConfig::default(), Some(dht.clone()));
        manager.start().await;

        wait_for_calls(&dht, 1).await;
        // first announce is still blocked on the gate
        manager.update_now().await;
        dht.gate.add_permits(1);
        wait_for_calls(&dht, 2).await;

        dht.gate.add_permits(8);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_add_remove_tracker_status() {
        let manager = TrackerManager::new(Identifier::from_array([2; 20]), 4000, NetworkConfig::default(), None);
        manager.add_tracker("udp://127.0.0.1:1/announce").await.unwrap();
        assert!(manager.add_tracker("ftp://nope").await.is_err());
        let status = manager.tracker_status().await;
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].uri, "udp://127.0.0.1:1/announce");
        manager.remove_tracker("udp://127.0.0.1:1/announce").await;
        assert!(manager.tracker_status().await.is_empty());
    }
}
