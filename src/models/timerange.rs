//! Media timeranges.
//!
//! Grammar: `[open][start]['_' [end]][close]`, where each timestamp is
//! `-?<seconds>:<nanoseconds>`. `open` defaults to `[` and `close` to `)`.
//! A missing bound is unbounded and always exclusive, whatever bracket was
//! written next to it. A lone timestamp (`10:0`, `[10:0]`) is a closed
//! single-instant range.
//!
//! Examples: `[0:0_10:0)`, `(_5:500000000]`, `_`, `10:0`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};
use thiserror::Error;

const NANOS_PER_SEC: i128 = 1_000_000_000;
const MAX_NANOS_DIGITS: usize = 9;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeRangeError {
    #[error("timerange `{0}` does not match the timerange grammar")]
    Grammar(String),
    #[error("timerange `{0}` starts after it ends")]
    Inverted(String),
    #[error("timerange `{0}` has zero width but is not closed on both sides")]
    OpenInstant(String),
}

/// A point on the media timeline, held as signed nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i128);

impl Timestamp {
    pub fn from_nanos(nanos: i128) -> Self {
        Self(nanos)
    }

    pub fn as_nanos(self) -> i128 {
        self.0
    }

    /// Whole seconds, rounded towards negative infinity.
    pub fn seconds(self) -> i128 {
        self.0.div_euclid(NANOS_PER_SEC)
    }

    /// Nanoseconds past [`Timestamp::seconds`], always in `0..1e9`.
    pub fn subsec_nanos(self) -> u32 {
        self.0.rem_euclid(NANOS_PER_SEC) as u32
    }

    fn parse(raw: &str) -> Option<Self> {
        let (negative, body) = match raw.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        let (secs, nanos) = body.split_once(':')?;
        if !is_plain_number(secs, usize::MAX) || !is_plain_number(nanos, MAX_NANOS_DIGITS) {
            return None;
        }

        let secs: i128 = secs.parse().ok()?;
        let nanos: i128 = nanos.parse().ok()?;
        let total = secs.checked_mul(NANOS_PER_SEC)?.checked_add(nanos)?;
        Some(Self(if negative { -total } else { total }))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let per_sec = NANOS_PER_SEC as u128;
        write!(f, "{}{}:{}", sign, abs / per_sec, abs % per_sec)
    }
}

/// `0` or a digit run without leading zeros, at most `max_len` long.
fn is_plain_number(s: &str, max_len: usize) -> bool {
    !s.is_empty()
        && s.len() <= max_len
        && s.bytes().all(|b| b.is_ascii_digit())
        && (s == "0" || !s.starts_with('0'))
}

/// A parsed timerange. Immutable; build one with [`TimeRange::parse`].
///
/// Both bounds present implies `start <= end`, and a zero-width range is
/// always closed, so no value of this type is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeRange {
    start: Option<Timestamp>,
    end: Option<Timestamp>,
    start_inclusive: bool,
    end_inclusive: bool,
}

impl TimeRange {
    /// The range covering the whole timeline (`_`).
    pub fn eternity() -> Self {
        Self {
            start: None,
            end: None,
            start_inclusive: false,
            end_inclusive: false,
        }
    }

    /// The closed single-instant range `[ts]`.
    pub fn instant(ts: Timestamp) -> Self {
        Self {
            start: Some(ts),
            end: Some(ts),
            start_inclusive: true,
            end_inclusive: true,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, TimeRangeError> {
        let grammar = || TimeRangeError::Grammar(raw.to_string());

        let (open, body) = match raw.as_bytes().first() {
            Some(b'[') => (Some(true), &raw[1..]),
            Some(b'(') => (Some(false), &raw[1..]),
            _ => (None, raw),
        };
        let (close, body) = match body.as_bytes().last() {
            Some(b']') => (Some(true), &body[..body.len() - 1]),
            Some(b')') => (Some(false), &body[..body.len() - 1]),
            _ => (None, body),
        };

        let Some((start, end)) = body.split_once('_') else {
            let ts = Timestamp::parse(body).ok_or_else(grammar)?;
            if open == Some(false) || close == Some(false) {
                return Err(TimeRangeError::OpenInstant(raw.to_string()));
            }
            return Ok(Self::instant(ts));
        };

        let start = match start {
            "" => None,
            s => Some(Timestamp::parse(s).ok_or_else(grammar)?),
        };
        let end = match end {
            "" => None,
            s => Some(Timestamp::parse(s).ok_or_else(grammar)?),
        };

        let range = Self {
            start,
            end,
            start_inclusive: start.is_some() && open.unwrap_or(true),
            end_inclusive: end.is_some() && close.unwrap_or(false),
        };

        if let (Some(s), Some(e)) = (range.start, range.end) {
            if s > e {
                return Err(TimeRangeError::Inverted(raw.to_string()));
            }
            if s == e && !(range.start_inclusive && range.end_inclusive) {
                return Err(TimeRangeError::OpenInstant(raw.to_string()));
            }
        }

        Ok(range)
    }

    pub fn start(&self) -> Option<Timestamp> {
        self.start
    }

    pub fn end(&self) -> Option<Timestamp> {
        self.end
    }

    pub fn start_inclusive(&self) -> bool {
        self.start_inclusive
    }

    pub fn end_inclusive(&self) -> bool {
        self.end_inclusive
    }

    pub fn is_instant(&self) -> bool {
        self.start.is_some() && self.start == self.end
    }

    /// True when the two ranges share at least one instant.
    ///
    /// Touching bounds only overlap when both touching sides are inclusive,
    /// so `[0:0_10:0)` and `[10:0_20:0)` are disjoint.
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        !(ends_before(self.end, self.end_inclusive, other.start, other.start_inclusive)
            || ends_before(other.end, other.end_inclusive, self.start, self.start_inclusive))
    }

    /// Length in seconds, or `None` when either side is unbounded.
    pub fn duration_secs(&self) -> Option<f64> {
        let (start, end) = (self.start?, self.end?);
        Some((end.as_nanos() - start.as_nanos()) as f64 / NANOS_PER_SEC as f64)
    }
}

/// Does a range ending at `end` finish strictly before one starting at `start`?
/// A missing end is +infinity and a missing start is -infinity.
fn ends_before(
    end: Option<Timestamp>,
    end_inclusive: bool,
    start: Option<Timestamp>,
    start_inclusive: bool,
) -> bool {
    match (end, start) {
        (Some(end), Some(start)) => {
            end < start || (end == start && !(end_inclusive && start_inclusive))
        }
        _ => false,
    }
}

impl FromStr for TimeRange {
    type Err = TimeRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Canonical form: instants as `[s]`, everything else fully bracketed.
impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let (true, Some(ts)) = (self.is_instant(), self.start) {
            return write!(f, "[{}]", ts);
        }

        f.write_str(if self.start_inclusive { "[" } else { "(" })?;
        if let Some(start) = self.start {
            write!(f, "{}", start)?;
        }
        f.write_str("_")?;
        if let Some(end) = self.end {
            write!(f, "{}", end)?;
        }
        f.write_str(if self.end_inclusive { "]" } else { ")" })
    }
}

impl Serialize for TimeRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeRange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        TimeRange::parse(&raw).map_err(serde::de::Error::custom)
    }
}
