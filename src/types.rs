use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const ADDRESS_LEN: usize = 20;

/// 20-byte account identifier. The all-zero address stands for "no user".
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserAddress([u8; ADDRESS_LEN]);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("invalid address length: expected {expected} hex chars, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("invalid hex character {0:?} in address")]
    Hex(char),
}

impl UserAddress {
    pub const ZERO: UserAddress = UserAddress([0u8; ADDRESS_LEN]);

    pub const fn new(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; ADDRESS_LEN]
    }
}

impl fmt::Display for UserAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("0x")?;
        f.write_str(&hex_encode(&self.0))
    }
}

impl fmt::Debug for UserAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserAddress({self})")
    }
}

impl FromStr for UserAddress {
    type Err = AddressParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        let hex = raw
            .strip_prefix("0x")
            .or_else(|| raw.strip_prefix("0X"))
            .unwrap_or(raw);
        if hex.len() != ADDRESS_LEN * 2 {
            return Err(AddressParseError::Length {
                expected: ADDRESS_LEN * 2,
                actual: hex.len(),
            });
        }

        let mut bytes = [0u8; ADDRESS_LEN];
        for (idx, pair) in hex.as_bytes().chunks(2).enumerate() {
            let hi = hex_value(char::from(pair[0]))?;
            let lo = hex_value(char::from(pair[1]))?;
            bytes[idx] = (hi << 4) | lo;
        }
        Ok(Self(bytes))
    }
}

impl Serialize for UserAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for UserAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

fn hex_value(c: char) -> Result<u8, AddressParseError> {
    c.to_digit(16)
        .map(|value| value as u8)
        .ok_or(AddressParseError::Hex(c))
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}

/// Random hex identifier used for allocation ids and generated trace ids.
pub(crate) fn random_id(prefix: &str) -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static ID_SEQ: AtomicU64 = AtomicU64::new(0);

    let mut bytes = [0u8; 16];
    if getrandom::fill(&mut bytes).is_err() {
        let ts_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|duration| duration.as_millis())
            .unwrap_or(0);
        let seq = ID_SEQ.fetch_add(1, Ordering::Relaxed);
        return format!("{prefix}{ts_ms:x}{seq:x}");
    }
    format!("{prefix}{}", hex_encode(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_with_and_without_prefix() {
        let raw = "0123456789abcdef0123456789abcdef01234567";
        let plain: UserAddress = raw.parse().expect("plain");
        let prefixed: UserAddress = format!("0x{raw}").parse().expect("prefixed");
        assert_eq!(plain, prefixed);
        assert_eq!(plain.to_string(), format!("0x{raw}"));
        assert!(!plain.is_zero());
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(
            "abc".parse::<UserAddress>(),
            Err(AddressParseError::Length {
                expected: 40,
                actual: 3
            })
        );
        let bad = "zz23456789abcdef0123456789abcdef01234567";
        assert_eq!(bad.parse::<UserAddress>(), Err(AddressParseError::Hex('z')));
    }

    #[test]
    fn serializes_as_hex_string() {
        let addr = UserAddress::new([0xab; ADDRESS_LEN]);
        let json = serde_json::to_string(&addr).expect("serialize");
        assert_eq!(json, format!("\"0x{}\"", "ab".repeat(ADDRESS_LEN)));
        let back: UserAddress = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, addr);
    }

    #[test]
    fn random_ids_are_distinct() {
        assert_ne!(random_id("t-"), random_id("t-"));
        assert!(random_id("alloc-").starts_with("alloc-"));
    }
}
