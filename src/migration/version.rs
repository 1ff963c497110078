//! Migration versions (`YYYYMMDDHHMMSS`)

use chrono::{Datelike, NaiveDateTime, Timelike, Utc};
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

const FORMAT: &str = "%Y%m%d%H%M%S";

/// Width of a formatted version
pub const VERSION_LEN: usize = 14;

/// A migration version: a UTC timestamp with second granularity
///
/// Versions order by the time they encode and render as a fixed-width
/// 14-digit string, so lexical and chronological order agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(NaiveDateTime);

fn truncate(at: NaiveDateTime) -> NaiveDateTime {
    at.with_nanosecond(0).unwrap_or(at)
}

impl Version {
    /// Version for a moment in time, truncated to the second
    ///
    /// # Errors
    ///
    /// Fails for years outside `0..=9999`, which do not fit in 14 digits.
    pub fn from_datetime(at: NaiveDateTime) -> Result<Self, VersionError> {
        if !(0..=9999).contains(&at.year()) {
            return Err(VersionError(at.to_string()));
        }
        Ok(Self(truncate(at)))
    }

    /// Version for the current UTC time
    pub fn now() -> Self {
        Self(truncate(Utc::now().naive_utc()))
    }

    pub fn datetime(&self) -> NaiveDateTime {
        self.0
    }

    /// Numeric form used in the versioning table (`20240120120000`)
    pub fn as_i64(&self) -> i64 {
        let (date, time) = (self.0.date(), self.0.time());
        i64::from(date.year()) * 10_000_000_000
            + i64::from(date.month()) * 100_000_000
            + i64::from(date.day()) * 1_000_000
            + i64::from(time.hour()) * 10_000
            + i64::from(time.minute()) * 100
            + i64::from(time.second())
    }

    /// Decode the numeric form stored in the versioning table
    pub fn from_i64(value: i64) -> Result<Self, VersionError> {
        format!("{value:014}").parse()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(FORMAT))
    }
}

/// A string that is not a valid `YYYYMMDDHHMMSS` version
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid migration version '{0}': expected 14 digits YYYYMMDDHHMMSS")]
pub struct VersionError(pub String);

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != VERSION_LEN || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(VersionError(s.to_string()));
        }
        NaiveDateTime::parse_from_str(s, FORMAT)
            .map(Self)
            .map_err(|_| VersionError(s.to_string()))
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
