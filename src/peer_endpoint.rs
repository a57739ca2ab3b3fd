//! BitChat Network - Peer Endpoint Info
//!
//! A peer's identity plus the transport endpoints it is reachable at.
//! Equality and hashing use the (case-insensitive) identity only.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("Truncated record")]
    Truncated,

    #[error("Unknown address family: {0}")]
    UnknownFamily(u8),

    #[error("Invalid UTF-8 in email")]
    InvalidEmail,

    #[error("Too many entries: {0} (max 255)")]
    TooMany(usize),
}

pub type EndpointResult<T> = Result<T, EndpointError>;

const FAMILY_V4: u8 = 0;
const FAMILY_V6: u8 = 1;

// =============================================================================
// Endpoint helpers
// =============================================================================

/// Collapse v4-mapped v6 addresses to plain v4
pub fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

pub fn normalize_endpoint(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(normalize_ip(addr.ip()), addr.port())
}

/// Write `family(1) | address(4 or 16) | port(2, LE)`
pub fn write_endpoint(buf: &mut BytesMut, addr: &SocketAddr) {
    match normalize_ip(addr.ip()) {
        IpAddr::V4(v4) => {
            buf.put_u8(FAMILY_V4);
            buf.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.put_u8(FAMILY_V6);
            buf.put_slice(&v6.octets());
        }
    }
    buf.put_u16_le(addr.port());
}

pub fn read_endpoint(buf: &mut Bytes) -> EndpointResult<SocketAddr> {
    if buf.remaining() < 1 {
        return Err(EndpointError::Truncated);
    }
    let ip = match buf.get_u8() {
        FAMILY_V4 => {
            if buf.remaining() < 4 + 2 {
                return Err(EndpointError::Truncated);
            }
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        FAMILY_V6 => {
            if buf.remaining() < 16 + 2 {
                return Err(EndpointError::Truncated);
            }
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        other => return Err(EndpointError::UnknownFamily(other)),
    };
    let port = buf.get_u16_le();
    Ok(SocketAddr::new(ip, port))
}

/// Write `count(1)` followed by that many endpoint records
pub fn write_endpoint_list(buf: &mut BytesMut, endpoints: &[SocketAddr]) -> EndpointResult<()> {
    if endpoints.len() > u8::MAX as usize {
        return Err(EndpointError::TooMany(endpoints.len()));
    }
    buf.put_u8(endpoints.len() as u8);
    for ep in endpoints {
        write_endpoint(buf, ep);
    }
    Ok(())
}

pub fn read_endpoint_list(buf: &mut Bytes) -> EndpointResult<Vec<SocketAddr>> {
    if buf.remaining() < 1 {
        return Err(EndpointError::Truncated);
    }
    let count = buf.get_u8() as usize;
    let mut endpoints = Vec::with_capacity(count);
    for _ in 0..count {
        endpoints.push(read_endpoint(buf)?);
    }
    Ok(endpoints)
}

// =============================================================================
// PeerEndpointInfo
// =============================================================================

/// Identity of a peer and where it is currently reachable
#[derive(Clone, Debug)]
pub struct PeerEndpointInfo {
    pub email: String,
    pub endpoints: Vec<SocketAddr>,
}

impl PeerEndpointInfo {
    pub fn new(email: impl Into<String>, endpoints: Vec<SocketAddr>) -> Self {
        let mut info = Self {
            email: email.into(),
            endpoints: Vec::with_capacity(endpoints.len()),
        };
        info.merge_endpoints(&endpoints);
        info
    }

    /// Case-insensitive identity key
    pub fn key(&self) -> String {
        self.email.to_lowercase()
    }

    pub fn is(&self, email: &str) -> bool {
        self.email.eq_ignore_ascii_case(email)
    }

    /// Add endpoints not already present
    pub fn merge_endpoints(&mut self, endpoints: &[SocketAddr]) {
        for ep in endpoints {
            let ep = normalize_endpoint(*ep);
            if !self.endpoints.contains(&ep) {
                self.endpoints.push(ep);
            }
        }
    }

    /// `len(1) | email | count(1) | endpoints`
    pub fn write_to(&self, buf: &mut BytesMut) -> EndpointResult<()> {
        let email = self.email.as_bytes();
        if email.len() > u8::MAX as usize {
            return Err(EndpointError::TooMany(email.len()));
        }
        buf.put_u8(email.len() as u8);
        buf.put_slice(email);
        write_endpoint_list(buf, &self.endpoints)
    }

    pub fn read_from(buf: &mut Bytes) -> EndpointResult<Self> {
        if buf.remaining() < 1 {
            return Err(EndpointError::Truncated);
        }
        let len = buf.get_u8() as usize;
        if buf.remaining() < len {
            return Err(EndpointError::Truncated);
        }
        let email = String::from_utf8(buf.split_to(len).to_vec())
            .map_err(|_| EndpointError::InvalidEmail)?;
        let endpoints = read_endpoint_list(buf)?;
        Ok(Self { email, endpoints })
    }
}

impl PartialEq for PeerEndpointInfo {
    fn eq(&self, other: &Self) -> bool {
        self.email.eq_ignore_ascii_case(&other.email)
    }
}

impl Eq for PeerEndpointInfo {}

impl Hash for PeerEndpointInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl std::fmt::Display for PeerEndpointInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} endpoints)", self.email, self.endpoints.len())
    }
}

// =============================================================================
// Tests
// =============================================================================
