//! Log sequence numbers
//!
//! A 64-bit monotonic position in the PostgreSQL write-ahead log. Zero is
//! the distinguished invalid value; the textual form is the server's
//! `X/Y` hex notation (high word / low word).

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A WAL position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The invalid position. Never produced by a healthy server.
    pub const INVALID: Lsn = Lsn(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// The position one byte before this one, clamped at zero.
    ///
    /// Used exactly once: a freshly created slot reports the *next* LSN it
    /// will deliver, while the engine tracks the *last* LSN it has flushed.
    pub fn saturating_prev(self) -> Lsn {
        Lsn(self.0.saturating_sub(1))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 as u32)
    }
}

/// Error parsing an `X/Y` LSN string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseLsnError(String);

impl fmt::Display for ParseLsnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid LSN {:?}", self.0)
    }
}

impl std::error::Error for ParseLsnError {}

impl FromStr for Lsn {
    type Err = ParseLsnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s.split_once('/').ok_or_else(|| ParseLsnError(s.into()))?;
        let hi = u64::from_str_radix(hi, 16).map_err(|_| ParseLsnError(s.into()))?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| ParseLsnError(s.into()))?;
        if hi > u32::MAX as u64 {
            return Err(ParseLsnError(s.into()));
        }
        Ok(Lsn((hi << 32) | lo as u64))
    }
}

impl From<u64> for Lsn {
    fn from(v: u64) -> Self {
        Lsn(v)
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_server_notation() {
        assert_eq!(Lsn(0).to_string(), "0/0");
        assert_eq!(Lsn(0x100).to_string(), "0/100");
        assert_eq!(Lsn(0x0000_0001_0000_0000).to_string(), "1/0");
        assert_eq!(Lsn(0x0000_00AB_DEAD_BEEF).to_string(), "AB/DEADBEEF");
    }

    #[test]
    fn parse_round_trips() {
        for lsn in [Lsn(0), Lsn(1), Lsn(0x100), Lsn(0xAB_DEAD_BEEF)] {
            assert_eq!(lsn.to_string().parse::<Lsn>().unwrap(), lsn);
        }
        assert_eq!("0/100".parse::<Lsn>().unwrap(), Lsn(0x100));
        assert_eq!("ab/deadbeef".parse::<Lsn>().unwrap(), Lsn(0xAB_DEAD_BEEF));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("".parse::<Lsn>().is_err());
        assert!("100".parse::<Lsn>().is_err());
        assert!("x/y".parse::<Lsn>().is_err());
        assert!("1/2/3".parse::<Lsn>().is_err());
        assert!("100000000/0".parse::<Lsn>().is_err());
    }

    #[test]
    fn saturating_prev_clamps_at_zero() {
        assert_eq!(Lsn(0x101).saturating_prev(), Lsn(0x100));
        assert_eq!(Lsn(0).saturating_prev(), Lsn(0));
    }

    #[test]
    fn ordering_is_numeric() {
        assert!(Lsn(0x100) < Lsn(0x200));
        assert!(!Lsn::INVALID.is_valid());
        assert!(Lsn(1).is_valid());
    }

    #[test]
    fn serde_uses_text_form() {
        let yaml = serde_yaml::to_string(&Lsn(0x100)).unwrap();
        assert_eq!(yaml.trim(), "0/100");
        let back: Lsn = serde_yaml::from_str("0/100").unwrap();
        assert_eq!(back, Lsn(0x100));
    }
}
