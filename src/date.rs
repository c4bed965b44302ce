use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

/// Calendar month bucket ("YYYY-MM"). Ordering is chronological.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct YearMonth {
    pub year: u16,
    pub month: u8, // 1..=12
}

impl YearMonth {
    pub fn new(year: u16, month: u8) -> Self {
        assert!((1..=12).contains(&month), "Month must be 1..=12");
        Self { year, month }
    }

    /// Bucket of a unix timestamp (UTC); `None` outside years 0..=9999.
    pub fn from_epoch(ts: i64) -> Option<Self> {
        let date = OffsetDateTime::from_unix_timestamp(ts).ok()?.date();
        let year = u16::try_from(date.year()).ok()?;
        Some(Self { year, month: date.month() as u8 })
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for YearMonth {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<_> = s.split('-').collect();
        if parts.len() != 2 {
            return Err("expected YYYY-MM".into());
        }
        let year: u16 = parts[0].parse().map_err(|_| "invalid year")?;
        let month: u8 = parts[1].parse().map_err(|_| "invalid month")?;
        if !(1..=12).contains(&month) {
            return Err("month must be 01..12".into());
        }
        Ok(Self { year, month })
    }
}

impl Serialize for YearMonth {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for YearMonth {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// `ts` if it falls in a month bucket, otherwise `None`. Epoch milliseconds
/// land far past year 9999 and are refused here.
pub fn checked_epoch(ts: i64) -> Option<i64> {
    YearMonth::from_epoch(ts).map(|_| ts)
}

/// Epoch seconds given as a float; fractions are truncated.
pub fn epoch_from_f64(secs: f64) -> Option<i64> {
    if !secs.is_finite() || secs < i64::MIN as f64 || secs >= i64::MAX as f64 {
        return None;
    }
    checked_epoch(secs.trunc() as i64)
}

/// Parse an event time into unix seconds (UTC).
///
/// Accepts RFC 3339, `YYYY-MM-DDTHH:MM:SS`, `YYYY-MM-DD HH:MM:SS` (naive times
/// are read as UTC) and integer epoch seconds. Returns `None` for anything else,
/// including times outside years 0..=9999.
pub fn parse_event_time(raw: &str) -> Option<i64> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(secs) = s.parse::<i64>() {
        return checked_epoch(secs);
    }
    if let Ok(dt) = OffsetDateTime::parse(s, &Rfc3339) {
        return checked_epoch(dt.unix_timestamp());
    }
    let t_sep = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
    let space_sep = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    // Fractional seconds are not needed for month bucketing.
    let trimmed = s.split('.').next().unwrap_or(s);
    PrimitiveDateTime::parse(trimmed, &t_sep)
        .or_else(|_| PrimitiveDateTime::parse(trimmed, &space_sep))
        .ok()
        .and_then(|dt| checked_epoch(dt.assume_utc().unix_timestamp()))
}

/// Render unix seconds as `YYYY-MM-DD HH:MM:SS` (UTC).
pub fn format_timestamp(ts: i64) -> String {
    let fmt = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    OffsetDateTime::from_unix_timestamp(ts)
        .ok()
        .and_then(|dt| dt.format(&fmt).ok())
        .unwrap_or_else(|| ts.to_string())
}

/// Whole days between two unix timestamps (`later - earlier`, truncated).
pub fn days_between(earlier: i64, later: i64) -> i64 {
    (later - earlier).div_euclid(86_400)
}
