//! Bluetooth hardware addresses.

use core::fmt;
use core::str::FromStr;

use crate::error::{ParseError, ParseResult};

/// A 48-bit Bluetooth hardware address.
///
/// Addresses are displayed as six colon-separated upper-case hex octets,
/// most significant first (`AA:BB:CC:DD:EE:FF`). Parsing also accepts `-`
/// as a separator and the bare 12-digit form.
///
/// # Examples
///
/// ```
/// use btlink_types::PeerAddress;
///
/// let addr: PeerAddress = "aa:bb:cc:dd:ee:01".parse().unwrap();
/// assert_eq!(addr.to_string(), "AA:BB:CC:DD:EE:01");
/// assert_eq!(addr, "AABBCCDDEE01".parse().unwrap());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerAddress([u8; 6]);

impl PeerAddress {
    /// Number of octets in an address.
    pub const LEN: usize = 6;

    /// Build an address from its octets, most significant first.
    ///
    /// Returns an error for the all-zero address, which no radio uses.
    pub fn new(octets: [u8; 6]) -> ParseResult<Self> {
        if octets == [0; 6] {
            return Err(ParseError::address("00:00:00:00:00:00", "all-zero address"));
        }
        Ok(Self(octets))
    }

    /// The address octets, most significant first.
    #[must_use]
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// The address packed into the low 48 bits of a `u64`.
    #[must_use]
    pub fn to_u64(&self) -> u64 {
        self.0.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
    }
}

impl FromStr for PeerAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> ParseResult<Self> {
        let trimmed = s.trim();
        let digits: Vec<u8> = if trimmed.len() == 12 {
            trimmed.bytes().collect()
        } else if trimmed.len() == 17 {
            let sep = trimmed.as_bytes()[2];
            if sep != b':' && sep != b'-' {
                return Err(ParseError::address(s, "expected ':' or '-' separators"));
            }
            let mut out = Vec::with_capacity(12);
            for (i, b) in trimmed.bytes().enumerate() {
                if i % 3 == 2 {
                    if b != sep {
                        return Err(ParseError::address(s, "inconsistent separators"));
                    }
                } else {
                    out.push(b);
                }
            }
            out
        } else {
            return Err(ParseError::address(s, "expected six octets"));
        };

        let mut octets = [0u8; 6];
        for (i, pair) in digits.chunks(2).enumerate() {
            let hi = hex_value(pair[0]).ok_or_else(|| ParseError::address(s, "non-hex digit"))?;
            let lo = hex_value(pair[1]).ok_or_else(|| ParseError::address(s, "non-hex digit"))?;
            octets[i] = (hi << 4) | lo;
        }

        if octets == [0; 6] {
            return Err(ParseError::address(s, "all-zero address"));
        }
        Ok(Self(octets))
    }
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

impl TryFrom<[u8; 6]> for PeerAddress {
    type Error = ParseError;

    fn try_from(octets: [u8; 6]) -> ParseResult<Self> {
        Self::new(octets)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a, b, c, d, e, g
        )
    }
}

impl fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerAddress({})", self)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for PeerAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for PeerAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_colon_form() {
        let addr: PeerAddress = "01:23:45:67:89:AB".parse().unwrap();
        assert_eq!(addr.octets(), [0x01, 0x23, 0x45, 0x67, 0x89, 0xAB]);
        assert_eq!(addr.to_u64(), 0x0123_4567_89AB);
    }

    #[test]
    fn test_parse_dash_and_bare_forms() {
        let a: PeerAddress = "01-23-45-67-89-ab".parse().unwrap();
        let b: PeerAddress = "0123456789ab".parse().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_rejects_malformed() {
        assert!("".parse::<PeerAddress>().is_err());
        assert!("01:23:45:67:89".parse::<PeerAddress>().is_err());
        assert!("01:23-45:67:89:AB".parse::<PeerAddress>().is_err());
        assert!("01:23:45:67:89:XY".parse::<PeerAddress>().is_err());
        assert!("01.23.45.67.89.AB".parse::<PeerAddress>().is_err());
    }

    #[test]
    fn test_rejects_zero_address() {
        let err = "00:00:00:00:00:00".parse::<PeerAddress>().unwrap_err();
        assert!(err.to_string().contains("all-zero"));
        assert!(PeerAddress::new([0; 6]).is_err());
    }

    #[test]
    fn test_display_is_upper_case() {
        let addr = PeerAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x0f]).unwrap();
        assert_eq!(addr.to_string(), "AA:BB:CC:DD:EE:0F");
        assert_eq!(format!("{:?}", addr), "PeerAddress(AA:BB:CC:DD:EE:0F)");
    }

    #[test]
    fn test_ordering_follows_octets() {
        let low = PeerAddress::new([0, 0, 0, 0, 0, 1]).unwrap();
        let high = PeerAddress::new([1, 0, 0, 0, 0, 0]).unwrap();
        assert!(low < high);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_serde_as_string() {
        let addr: PeerAddress = "AA:BB:CC:DD:EE:01".parse().unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"AA:BB:CC:DD:EE:01\"");
        let back: PeerAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
        assert!(serde_json::from_str::<PeerAddress>("\"nope\"").is_err());
    }
}
