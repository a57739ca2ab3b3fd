//! Minimal bencode decoder for tracker responses.

use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("Unexpected end of input")]
    UnexpectedEnd,

    #[error("Invalid byte {0:#04x} at offset {1}")]
    InvalidByte(u8, usize),

    #[error("Invalid integer")]
    InvalidInteger,

    #[error("Nesting too deep")]
    TooDeep,

    #[error("Trailing data after value")]
    TrailingData,
}

const MAX_DEPTH: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Dict(map) => map.get(key.as_bytes()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }
}

/// Decode exactly one value spanning all of `data`
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let mut pos = 0;
    let value = parse(data, &mut pos, 0)?;
    if pos != data.len() {
        return Err(BencodeError::TrailingData);
    }
    Ok(value)
}

fn parse(data: &[u8], pos: &mut usize, depth: usize) -> Result<Value, BencodeError> {
    if depth > MAX_DEPTH {
        return Err(BencodeError::TooDeep);
    }
    let b = *data.get(*pos).ok_or(BencodeError::UnexpectedEnd)?;
    match b {
        b'i' => {
            *pos += 1;
            let n = read_until(data, pos, b'e')?;
            Ok(Value::Int(parse_int(n)?))
        }
        b'l' => {
            *pos += 1;
            let mut list = Vec::new();
            loop {
                match data.get(*pos) {
                    Some(b'e') => {
                        *pos += 1;
                        return Ok(Value::List(list));
                    }
                    Some(_) => list.push(parse(data, pos, depth + 1)?),
                    None => return Err(BencodeError::UnexpectedEnd),
                }
            }
        }
        b'd' => {
            *pos += 1;
            let mut dict = BTreeMap::new();
            loop {
                match data.get(*pos) {
                    Some(b'e') => {
                        *pos += 1;
                        return Ok(Value::Dict(dict));
                    }
                    Some(_) => {
                        let key = parse_bytes(data, pos)?;
                        let value = parse(data, pos, depth + 1)?;
                        dict.insert(key, value);
                    }
                    None => return Err(BencodeError::UnexpectedEnd),
                }
            }
        }
        b'0'..=b'9' => Ok(Value::Bytes(parse_bytes(data, pos)?)),
        other => Err(BencodeError::InvalidByte(other, *pos)),
    }
}

fn parse_bytes(data: &[u8], pos: &mut usize) -> Result<Vec<u8>, BencodeError> {
    let start = *pos;
    let len = read_until(data, pos, b':')?;
    let len = parse_int(len)?;
    if len < 0 {
        return Err(BencodeError::InvalidByte(b'-', start));
    }
    let len = len as usize;
    let end = pos.checked_add(len).ok_or(BencodeError::UnexpectedEnd)?;
    if end > data.len() {
        return Err(BencodeError::UnexpectedEnd);
    }
    let bytes = data[*pos..end].to_vec();
    *pos = end;
    Ok(bytes)
}

fn read_until<'a>(data: &'a [u8], pos: &mut usize, delim: u8) -> Result<&'a [u8], BencodeError> {
    let rest = &data[*pos..];
    let idx = rest
        .iter()
        .position(|b| *b == delim)
        .ok_or(BencodeError::UnexpectedEnd)?;
    *pos += idx + 1;
    Ok(&rest[..idx])
}

fn parse_int(digits: &[u8]) -> Result<i64, BencodeError> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(BencodeError::InvalidInteger)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_response() {
        let data = b"d8:intervali1800e5:peers6:\x0a\x00\x00\x01\x1a\xe1e";
        let value = decode(data).unwrap();
        assert_eq!(value.get("interval").and_then(Value::as_int), Some(1800));
        assert_eq!(value.get("peers").and_then(Value::as_bytes).map(|p| p.len()), Some(6));
    }

    #[test]
    fn test_nested() {
        let value = decode(b"d5:peersld2:ip8:10.0.0.14:porti6881eeee").unwrap();
        let peers = value.get("peers").and_then(Value::as_list).unwrap();
        assert_eq!(peers[0].get("ip").and_then(Value::as_str), Some("10.0.0.1"));
        assert_eq!(peers[0].get("port").and_then(Value::as_int), Some(6881));
    }

    #[test]
    fn test_errors() {
        assert_eq!(decode(b"i12"), Err(BencodeError::UnexpectedEnd));
        assert_eq!(decode(b"5:abc"), Err(BencodeError::UnexpectedEnd));
        assert_eq!(decode(b"ixe"), Err(BencodeError::InvalidInteger));
        assert_eq!(decode(b"i1ei2e"), Err(BencodeError::TrailingData));
        assert_eq!(decode(b"x"), Err(BencodeError::InvalidByte(b'x', 0)));
        let deep = "l".repeat(40) + &"e".repeat(40);
        assert_eq!(decode(deep.as_bytes()), Err(BencodeError::TooDeep));
    }
}
