//! MAC address type
//!
//! Accepts six hex byte pairs, each separated by `:` or `-`, in any letter
//! case. Always formats as uppercase `XX:XX:XX:XX:XX:XX`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid MAC address: {0:?}")]
pub struct MacParseError(pub String);

/// Six-byte hardware address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Parse a textual MAC address
    pub fn parse(input: &str) -> Result<Self, MacParseError> {
        let err = || MacParseError(input.to_string());

        // 6 pairs + 5 separators
        let bytes = input.as_bytes();
        if bytes.len() != 17 {
            return Err(err());
        }

        let mut octets = [0u8; 6];
        for (i, octet) in octets.iter_mut().enumerate() {
            let start = i * 3;
            if i > 0 && !matches!(bytes[start - 1], b':' | b'-') {
                return Err(err());
            }
            let pair = &bytes[start..start + 2];
            if !pair.iter().all(u8::is_ascii_hexdigit) {
                return Err(err());
            }
            *octet = (hex_value(pair[0]) << 4) | hex_value(pair[1]);
        }

        Ok(Self(octets))
    }
}

fn hex_value(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        _ => digit - b'A' + 10,
    }
}

impl FromStr for MacAddress {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl Serialize for MacAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_colon_and_hyphen() {
        let colon: MacAddress = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        let hyphen: MacAddress = "AA-BB-CC-DD-EE-FF".parse().unwrap();
        let mixed_case: MacAddress = "Aa:bB:cc:DD:eE:Ff".parse().unwrap();

        assert_eq!(colon, hyphen);
        assert_eq!(colon, mixed_case);

        let mixed_separators: MacAddress = "aa:bb-cc:dd-ee:ff".parse().unwrap();
        assert_eq!(colon, mixed_separators);
        assert_eq!(colon.octets(), [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
    }

    #[test]
    fn test_canonical_display() {
        let mac = MacAddress::parse("0a-1b-2c-3d-4e-5f").unwrap();
        assert_eq!(mac.to_string(), "0A:1B:2C:3D:4E:5F");
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in [
            "",
            "AA:BB:CC:DD:EE",
            "AA:BB:CC:DD:EE:FF:00",
            "AA:BB:CC:DD:EE:GG",
            "AABBCCDDEEFF",
            "AA.BB.CC.DD.EE.FF",
            " AA:BB:CC:DD:EE:F",
            "AA:BB:CC:DD:EE:FF; reboot",
            "+A:BB:CC:DD:EE:FF",
        ] {
            assert!(MacAddress::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_serde_uses_canonical_string() {
        let mac = MacAddress::parse("de:ad:be:ef:00:01").unwrap();
        let json = serde_json::to_string(&mac).unwrap();
        assert_eq!(json, "\"DE:AD:BE:EF:00:01\"");

        let parsed: MacAddress = serde_json::from_str("\"de-ad-be-ef-00-01\"").unwrap();
        assert_eq!(parsed, mac);

        assert!(serde_json::from_str::<MacAddress>("\"nope\"").is_err());
    }
}
