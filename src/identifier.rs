//! BitChat Network - Identifiers
//!
//! Fixed-length binary values used as network IDs, peer IDs and salts:
//! - Bitwise operators (XOR, AND, OR, NOT, shifts) between equal-length values
//! - Lexicographic ordering
//! - Length-prefixed wire serialization

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::rngs::OsRng;
use rand::RngCore;
use std::cmp::Ordering;
use std::ops::{BitAnd, BitOr, BitXor, Not, Shl, Shr};
use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("Identifier too long: {0} bytes (max 255)")]
    TooLong(usize),

    #[error("Truncated identifier: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Invalid hex: {0}")]
    InvalidHex(String),
}

pub type IdentifierResult<T> = Result<T, IdentifierError>;

// =============================================================================
// Constants
// =============================================================================

/// Maximum identifier length (fits the 1-byte length prefix)
pub const MAX_IDENTIFIER_LEN: usize = 255;

/// Length of a network ID (doubles as tracker info-hash and DHT key)
pub const NETWORK_ID_LEN: usize = 20;

/// Length of a network secret
pub const NETWORK_SECRET_LEN: usize = 32;

/// Length of a discovery challenge
pub const CHALLENGE_LEN: usize = 32;

// =============================================================================
// Identifier
// =============================================================================

/// Immutable binary identifier. Equality is value equality; bitwise
/// operators and ordering require operands of equal length.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Identifier(Box<[u8]>);

impl Identifier {
    /// Create from raw bytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> IdentifierResult<Self> {
        let bytes = bytes.into();
        if bytes.len() > MAX_IDENTIFIER_LEN {
            return Err(IdentifierError::TooLong(bytes.len()));
        }
        Ok(Self(bytes.into_boxed_slice()))
    }

    /// Create from a fixed-size array (always within bounds)
    pub fn from_array<const N: usize>(bytes: [u8; N]) -> Self {
        assert!(N <= MAX_IDENTIFIER_LEN, "identifier arrays are at most 255 bytes");
        Self(Box::new(bytes))
    }

    /// Random identifier of `len` bytes from the OS RNG
    pub fn random(len: usize) -> Self {
        assert!(len <= MAX_IDENTIFIER_LEN, "identifier length {} exceeds 255", len);
        let mut bytes = vec![0u8; len];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes.into_boxed_slice())
    }

    /// All-zero identifier of `len` bytes
    pub fn zero(len: usize) -> Self {
        assert!(len <= MAX_IDENTIFIER_LEN, "identifier length {} exceeds 255", len);
        Self(vec![0u8; len].into_boxed_slice())
    }

    pub fn from_hex(s: &str) -> IdentifierResult<Self> {
        let bytes = hex::decode(s).map_err(|e| IdentifierError::InvalidHex(e.to_string()))?;
        Self::new(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Short form for logs
    pub fn short(&self) -> String {
        hex::encode(&self.0[..self.0.len().min(4)])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Lexicographic comparison. Panics when lengths differ.
    pub fn compare(&self, other: &Identifier) -> Ordering {
        self.assert_same_len(other, "compare");
        self.0.cmp(&other.0)
    }

    /// Serialize as `len(1) | bytes`
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.0.len() as u8);
        buf.put_slice(&self.0);
    }

    /// Parse a length-prefixed identifier, advancing `buf`
    pub fn read_from(buf: &mut Bytes) -> IdentifierResult<Self> {
        if buf.remaining() < 1 {
            return Err(IdentifierError::Truncated { needed: 1, available: 0 });
        }
        let len = buf.get_u8() as usize;
        if buf.remaining() < len {
            return Err(IdentifierError::Truncated {
                needed: len,
                available: buf.remaining(),
            });
        }
        let bytes = buf.split_to(len);
        Ok(Self(bytes.to_vec().into_boxed_slice()))
    }

    fn assert_same_len(&self, other: &Identifier, op: &str) {
        assert_eq!(
            self.0.len(),
            other.0.len(),
            "identifier length mismatch in {}: {} vs {} bytes",
            op,
            self.0.len(),
            other.0.len()
        );
    }

    fn zip_with(&self, other: &Identifier, op: &str, f: impl Fn(u8, u8) -> u8) -> Identifier {
        self.assert_same_len(other, op);
        let bytes: Vec<u8> = self.0.iter().zip(other.0.iter()).map(|(a, b)| f(*a, *b)).collect();
        Identifier(bytes.into_boxed_slice())
    }

    fn shift_left(&self, bits: usize) -> Identifier {
        let len = self.0.len();
        let mut out = vec![0u8; len];
        let byte_shift = bits / 8;
        let bit_shift = bits % 8;
        for i in 0..len {
            let src = i + byte_shift;
            if src >= len {
                break;
            }
            let mut v = self.0[src] << bit_shift;
            if bit_shift > 0 && src + 1 < len {
                v |= self.0[src + 1] >> (8 - bit_shift);
            }
            out[i] = v;
        }
        Identifier(out.into_boxed_slice())
    }

    fn shift_right(&self, bits: usize) -> Identifier {
        let len = self.0.len();
        let mut out = vec![0u8; len];
        let byte_shift = bits / 8;
        let bit_shift = bits % 8;
        for i in (0..len).rev() {
            if i < byte_shift {
                break;
            }
            let src = i - byte_shift;
            let mut v = self.0[src] >> bit_shift;
            if bit_shift > 0 && src >= 1 {
                v |= self.0[src - 1] << (8 - bit_shift);
            }
            out[i] = v;
        }
        Identifier(out.into_boxed_slice())
    }
}

impl PartialOrd for Identifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Identifier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl AsRef<[u8]> for Identifier {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::fmt::Debug for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identifier({})", self.to_hex())
    }
}

// =============================================================================
// Operators
// =============================================================================

impl BitXor for &Identifier {
    type Output = Identifier;

    fn bitxor(self, rhs: &Identifier) -> Identifier {
        self.zip_with(rhs, "xor", |a, b| a ^ b)
    }
}

impl BitXor for Identifier {
    type Output = Identifier;

    fn bitxor(self, rhs: Identifier) -> Identifier {
        &self ^ &rhs
    }
}

impl BitAnd for &Identifier {
    type Output = Identifier;

    fn bitand(self, rhs: &Identifier) -> Identifier {
        self.zip_with(rhs, "and", |a, b| a & b)
    }
}

impl BitAnd for Identifier {
    type Output = Identifier;

    fn bitand(self, rhs: Identifier) -> Identifier {
        &self & &rhs
    }
}

impl BitOr for &Identifier {
    type Output = Identifier;

    fn bitor(self, rhs: &Identifier) -> Identifier {
        self.zip_with(rhs, "or", |a, b| a | b)
    }
}

impl BitOr for Identifier {
    type Output = Identifier;

    fn bitor(self, rhs: Identifier) -> Identifier {
        &self | &rhs
    }
}

impl Not for &Identifier {
    type Output = Identifier;

    fn not(self) -> Identifier {
        let bytes: Vec<u8> = self.0.iter().map(|b| !b).collect();
        Identifier(bytes.into_boxed_slice())
    }
}

impl Not for Identifier {
    type Output = Identifier;

    fn not(self) -> Identifier {
        !&self
    }
}

impl Shl<usize> for &Identifier {
    type Output = Identifier;

    fn shl(self, bits: usize) -> Identifier {
        self.shift_left(bits)
    }
}

impl Shr<usize> for &Identifier {
    type Output = Identifier;

    fn shr(self, bits: usize) -> Identifier {
        self.shift_right(bits)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_pair() -> impl Strategy<Value = (Vec<u8>, Vec<u8>)> {
        (1usize..=32).prop_flat_map(|len| {
            (
                proptest::collection::vec(any::<u8>(), len),
                proptest::collection::vec(any::<u8>(), len),
            )
        })
    }

    proptest! {
        #[test]
        fn xor_with_self_is_zero(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            let a = Identifier::new(bytes).unwrap();
            prop_assert!((&a ^ &a).is_zero());
        }

        #[test]
        fn and_or_idempotent(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            let a = Identifier::new(bytes).unwrap();
            prop_assert_eq!(&a & &a, a.clone());
            prop_assert_eq!(&a | &a, a.clone());
        }

        #[test]
        fn double_not_is_identity(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            let a = Identifier::new(bytes).unwrap();
            prop_assert_eq!(!!a.clone(), a);
        }

        #[test]
        fn xor_commutes_and_inverts((x, y) in arb_pair()) {
            let a = Identifier::new(x).unwrap();
            let b = Identifier::new(y).unwrap();
            prop_assert_eq!(&a ^ &b, &b ^ &a);
            prop_assert_eq!(&(&a ^ &b) ^ &b, a);
        }

        #[test]
        fn compare_matches_byte_order((x, y) in arb_pair()) {
            let a = Identifier::new(x.clone()).unwrap();
            let b = Identifier::new(y.clone()).unwrap();
            prop_assert_eq!(a.compare(&b), x.cmp(&y));
        }
    }

    #[test]
    #[should_panic(expected = "identifier length mismatch")]
    fn test_xor_length_mismatch_panics() {
        let a = Identifier::zero(20);
        let b = Identifier::zero(32);
        let _ = &a ^ &b;
    }

    #[test]
    #[should_panic(expected = "identifier length mismatch")]
    fn test_compare_length_mismatch_panics() {
        let a = Identifier::zero(16);
        let b = Identifier::zero(20);
        let _ = a.compare(&b);
    }

    #[test]
    fn test_shifts() {
        let a = Identifier::from_array([0x00, 0x01, 0x80]);
        assert_eq!((&a << 1).as_bytes(), &[0x00, 0x03, 0x00]);
        assert_eq!((&a >> 1).as_bytes(), &[0x00, 0x00, 0xC0]);
        assert_eq!((&a << 8).as_bytes(), &[0x01, 0x80, 0x00]);
        assert_eq!((&a >> 12).as_bytes(), &[0x00, 0x00, 0x00]);
        assert!((&a << 24).is_zero());
    }

    #[test]
    fn test_wire_format() {
        let a = Identifier::from_array([7u8; 20]);
        let mut buf = BytesMut::new();
        a.write_to(&mut buf);
        assert_eq!(buf.len(), 21);
        assert_eq!(buf[0], 20);

        let mut bytes = buf.freeze();
        let parsed = Identifier::read_from(&mut bytes).unwrap();
        assert_eq!(parsed, a);
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_truncated_read() {
        let mut bytes = Bytes::from_static(&[5, 1, 2]);
        assert_eq!(
            Identifier::read_from(&mut bytes),
            Err(IdentifierError::Truncated { needed: 5, available: 2 })
        );
    }

    #[test]
    fn test_too_long() {
        assert!(matches!(Identifier::new(vec![0u8; 256]), Err(IdentifierError::TooLong(256))));
    }

    #[test]
    fn test_hex_roundtrip() {
        let a = Identifier::random(16);
        assert_eq!(Identifier::from_hex(&a.to_hex()).unwrap(), a);
        assert_eq!(a.short().len(), 8);
        assert!(Identifier::from_hex("zz").is_err());
    }
}
