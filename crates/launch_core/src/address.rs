use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error_handler::LaunchError;

const ADDRESS_BYTES: usize = 20;

/// A 20-byte EVM account or contract address, stored lowercase with `0x`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(String);

impl Address {
    pub fn parse(raw: &str) -> Result<Self, LaunchError> {
        let trimmed = raw.trim();
        let hex_part = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| LaunchError::Config(format!("address '{raw}' must start with 0x")))?;
        let bytes = hex::decode(hex_part)
            .map_err(|e| LaunchError::Config(format!("address '{raw}' is not hex: {e}")))?;
        if bytes.len() != ADDRESS_BYTES {
            return Err(LaunchError::Config(format!(
                "address '{raw}' has {} bytes, expected {ADDRESS_BYTES}",
                bytes.len()
            )));
        }
        Ok(Self::from_bytes(&bytes))
    }

    /// Build an address from the trailing 20 bytes of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let start = bytes.len().saturating_sub(ADDRESS_BYTES);
        Self(format!("0x{}", hex::encode(&bytes[start..])))
    }

    pub fn zero() -> Self {
        Self::from_bytes(&[0u8; ADDRESS_BYTES])
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::zero()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = LaunchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_normalizes_case() {
        let addr = Address::parse("0x742D35CC6634C0532925A3B844BC9E7595F2BD18").unwrap();
        assert_eq!(addr.as_str(), "0x742d35cc6634c0532925a3b844bc9e7595f2bd18");
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(Address::parse("742d35cc6634c0532925a3b844bc9e7595f2bd18").is_err());
        assert!(Address::parse("0x1234").is_err());
        assert!(Address::parse("0xzz2d35cc6634c0532925a3b844bc9e7595f2bd18").is_err());
        assert!(Address::parse("").is_err());
    }

    #[test]
    fn zero_address_is_detected() {
        assert!(Address::zero().is_zero());
        assert_eq!(
            Address::zero().as_str(),
            "0x0000000000000000000000000000000000000000"
        );
    }

    #[test]
    fn from_bytes_keeps_trailing_twenty() {
        let bytes: Vec<u8> = (0u8..32).collect();
        let addr = Address::from_bytes(&bytes);
        assert_eq!(addr.as_str(), format!("0x{}", hex::encode(&bytes[12..])));
    }

    #[test]
    fn deserialize_validates() {
        let ok: Result<Address, _> =
            serde_json::from_str("\"0x0000000000000000000000000000000000000001\"");
        assert!(ok.is_ok());
        let bad: Result<Address, _> = serde_json::from_str("\"not-an-address\"");
        assert!(bad.is_err());
    }
}
