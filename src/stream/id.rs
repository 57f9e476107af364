//! `<ms>-<seq>` stream identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Monotonic entry id: milliseconds of the append plus a sequence within that millisecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StreamId {
    /// Epoch milliseconds component.
    pub ms: u64,
    /// Sequence within the millisecond.
    pub seq: u64,
}

impl StreamId {
    /// The id before every possible entry.
    pub const ZERO: StreamId = StreamId { ms: 0, seq: 0 };

    /// Builds an id from its parts.
    pub const fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Smallest id strictly greater than `last` for an append at `now_ms`.
    pub fn next_after(last: StreamId, now_ms: u64) -> Self {
        if now_ms > last.ms {
            Self::new(now_ms, 0)
        } else {
            Self::new(last.ms, last.seq + 1)
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

/// Error returned when parsing a malformed stream id.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid stream id {0:?}, expected <ms>-<seq>")]
pub struct InvalidStreamId(pub String);

impl FromStr for StreamId {
    type Err = InvalidStreamId;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidStreamId(input.to_string());
        let trimmed = input.trim();
        let (ms, seq) = match trimmed.split_once('-') {
            Some((ms, seq)) => (ms, seq),
            None => (trimmed, "0"),
        };
        let ms = ms.parse().map_err(|_| invalid())?;
        let seq = seq.parse().map_err(|_| invalid())?;
        Ok(Self { ms, seq })
    }
}

impl TryFrom<String> for StreamId {
    type Error = InvalidStreamId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StreamId> for String {
    fn from(id: StreamId) -> Self {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_formats() {
        let id: StreamId = "1700000000000-7".parse().expect("valid id");
        assert_eq!(id, StreamId::new(1_700_000_000_000, 7));
        assert_eq!(id.to_string(), "1700000000000-7");
        assert_eq!("42".parse::<StreamId>().unwrap(), StreamId::new(42, 0));
        assert!("abc-1".parse::<StreamId>().is_err());
        assert!("1-".parse::<StreamId>().is_err());
    }

    #[test]
    fn next_after_never_goes_backwards() {
        let last = StreamId::new(100, 4);
        assert_eq!(StreamId::next_after(last, 101), StreamId::new(101, 0));
        assert_eq!(StreamId::next_after(last, 100), StreamId::new(100, 5));
        // clock stepped backwards
        assert_eq!(StreamId::next_after(last, 90), StreamId::new(100, 5));
    }

    #[test]
    fn orders_by_ms_then_seq() {
        assert!(StreamId::new(1, 9) < StreamId::new(2, 0));
        assert!(StreamId::new(2, 0) < StreamId::new(2, 1));
    }
}
