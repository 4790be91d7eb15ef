//! Quantized UTC timestamps.
//!
//! Every timestamp is bound to a sampling [`Granularity`] and truncated to its
//! bucket boundary on construction:
//! - day: hour, minute and second are zeroed
//! - hour: minute and second are zeroed
//! - minute: second is zeroed
//!
//! Equality, ordering and hashing only look at the truncated epoch value.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

const NAIVE_DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Day,
    Hour,
    Minute,
}

impl Granularity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Hour => "hour",
            Self::Minute => "minute",
        }
    }

    pub fn step_seconds(self) -> i64 {
        match self {
            Self::Day => 86_400,
            Self::Hour => 3_600,
            Self::Minute => 60,
        }
    }

    pub fn step(self) -> ChronoDuration {
        ChronoDuration::seconds(self.step_seconds())
    }

    fn display_format(self) -> &'static str {
        match self {
            Self::Day => "%Y-%m-%d",
            Self::Hour => "%Y-%m-%d %Hh",
            Self::Minute => "%Y-%m-%d %H:%M",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = TimestampError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_granularity(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimestampError {
    #[error("unrecognized time format: {0}")]
    InvalidFormat(String),
    #[error("timestamp out of representable range: {0}")]
    OutOfRange(i64),
    #[error("unknown sampling granularity: {0}")]
    UnknownGranularity(String),
}

pub fn parse_granularity(input: &str) -> Result<Granularity, TimestampError> {
    match input.trim().to_ascii_lowercase().as_str() {
        "day" | "1d" => Ok(Granularity::Day),
        "hour" | "1h" => Ok(Granularity::Hour),
        "minute" | "1m" => Ok(Granularity::Minute),
        other => Err(TimestampError::UnknownGranularity(other.to_string())),
    }
}

/// Anything a [`Timestamp`] can be built from.
#[derive(Debug, Clone, PartialEq)]
pub enum TimeValue {
    Epoch(i64),
    EpochFloat(f64),
    Text(String),
    DateTime(DateTime<Utc>),
    Naive(NaiveDateTime),
    Timestamp(Timestamp),
}

impl From<i64> for TimeValue {
    fn from(value: i64) -> Self {
        Self::Epoch(value)
    }
}

impl From<f64> for TimeValue {
    fn from(value: f64) -> Self {
        Self::EpochFloat(value)
    }
}

impl From<&str> for TimeValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for TimeValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<DateTime<Utc>> for TimeValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::DateTime(value)
    }
}

impl From<NaiveDateTime> for TimeValue {
    fn from(value: NaiveDateTime) -> Self {
        Self::Naive(value)
    }
}

impl From<Timestamp> for TimeValue {
    fn from(value: Timestamp) -> Self {
        Self::Timestamp(value)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Timestamp {
    epoch: i64,
    granularity: Granularity,
}

impl Timestamp {
    pub fn new(
        value: impl Into<TimeValue>,
        granularity: Granularity,
    ) -> Result<Self, TimestampError> {
        let epoch = match value.into() {
            TimeValue::Epoch(secs) => secs,
            TimeValue::EpochFloat(secs) => {
                if !secs.is_finite() || secs.abs() > i64::MAX as f64 {
                    return Err(TimestampError::InvalidFormat(secs.to_string()));
                }
                secs.round() as i64
            }
            TimeValue::Text(raw) => parse_text(&raw)
                .ok_or(TimestampError::InvalidFormat(raw))?
                .timestamp(),
            TimeValue::DateTime(dt) => dt.timestamp(),
            TimeValue::Naive(naive) => Utc.from_utc_datetime(&naive).timestamp(),
            TimeValue::Timestamp(other) => other.epoch,
        };

        Self::from_epoch(epoch, granularity)
    }

    pub fn from_epoch(epoch: i64, granularity: Granularity) -> Result<Self, TimestampError> {
        let truncated = quantize(epoch, granularity)?;
        utc_from_epoch(truncated)?;
        Ok(Self {
            epoch: truncated,
            granularity,
        })
    }

    pub fn now(granularity: Granularity) -> Self {
        let wall = Utc::now().timestamp();
        Self {
            epoch: wall - wall.rem_euclid(granularity.step_seconds()),
            granularity,
        }
    }

    pub fn epoch(&self) -> i64 {
        self.epoch
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// Moves the timestamp by a signed duration and re-quantizes it (floor).
    pub fn advance(&mut self, step: ChronoDuration) -> Result<(), TimestampError> {
        let moved = self
            .epoch
            .checked_add(step.num_seconds())
            .ok_or(TimestampError::OutOfRange(self.epoch))?;
        *self = Self::from_epoch(moved, self.granularity)?;
        Ok(())
    }

    pub fn advance_steps(&mut self, steps: i64) -> Result<(), TimestampError> {
        let delta = steps
            .checked_mul(self.granularity.step_seconds())
            .ok_or(TimestampError::OutOfRange(self.epoch))?;
        self.advance(ChronoDuration::seconds(delta))
    }

    /// Copying variant of [`Timestamp::advance_steps`].
    pub fn offset_steps(self, steps: i64) -> Result<Self, TimestampError> {
        let mut out = self;
        out.advance_steps(steps)?;
        Ok(out)
    }

    /// Number of granularity steps from `self` to `later` (negative if `later` is earlier).
    pub fn steps_until(&self, later: &Timestamp) -> i64 {
        (later.epoch - self.epoch) / self.granularity.step_seconds()
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        // The epoch was range-checked on construction.
        Utc.timestamp_opt(self.epoch, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn format(&self, fmt: &str) -> String {
        self.to_datetime().format(fmt).to_string()
    }
}

impl PartialEq for Timestamp {
    fn eq(&self, other: &Self) -> bool {
        self.epoch == other.epoch
    }
}

impl Eq for Timestamp {}

impl Hash for Timestamp {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.epoch.hash(state);
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch.cmp(&other.epoch)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format(self.granularity.display_format()))
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.epoch)
    }
}

fn quantize(epoch: i64, granularity: Granularity) -> Result<i64, TimestampError> {
    epoch
        .checked_sub(epoch.rem_euclid(granularity.step_seconds()))
        .ok_or(TimestampError::OutOfRange(epoch))
}

fn utc_from_epoch(epoch: i64) -> Result<DateTime<Utc>, TimestampError> {
    Utc.timestamp_opt(epoch, 0)
        .single()
        .ok_or(TimestampError::OutOfRange(epoch))
}

fn parse_text(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }

    for fmt in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|n| Utc.from_utc_datetime(&n));
    }

    // "2017-04-21 14" and "2017-04-21 14h"
    let (date_part, hour_part) = trimmed.split_once(|c: char| c == ' ' || c == 'T')?;
    let hour_digits = hour_part.trim().trim_end_matches('h');
    if hour_digits.is_empty()
        || hour_digits.len() > 2
        || !hour_digits.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }
    let hour: u32 = hour_digits.parse().ok()?;
    let date = NaiveDate::parse_from_str(date_part.trim(), "%Y-%m-%d").ok()?;
    date.and_hms_opt(hour, 0, 0)
        .map(|n| Utc.from_utc_datetime(&n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn hour(raw: &str) -> Timestamp {
        Timestamp::new(raw, Granularity::Hour).unwrap()
    }

    #[test]
    fn hour_granularity_truncates_minutes() {
        let s1 = hour("2017-04-21 14:00");
        let s2 = hour("2017-04-21 14:30");
        let s3 = hour("2017-04-21 14:59");
        let s4 = hour("2017-04-21 15:00");
        let s5 = hour("2017-04-22 14:30");

        assert_eq!(s1, s2);
        assert_eq!(s1, s3);
        assert_ne!(s1, s4);
        assert_ne!(s1, s5);
        assert_eq!(s3.format("%H:%M"), "14:00");
        assert_eq!(s5.format("%H"), "14");
    }

    #[test]
    fn day_and_minute_granularity_truncate_their_buckets() {
        let d1 = Timestamp::new("2017-04-21 23:59:59", Granularity::Day).unwrap();
        let d2 = Timestamp::new("2017-04-21", Granularity::Day).unwrap();
        assert_eq!(d1, d2);

        let m1 = Timestamp::new("2017-04-21 10:15:42", Granularity::Minute).unwrap();
        let m2 = Timestamp::new("2017-04-21 10:15", Granularity::Minute).unwrap();
        let m3 = Timestamp::new("2017-04-21 10:16", Granularity::Minute).unwrap();
        assert_eq!(m1, m2);
        assert_ne!(m1, m3);
    }

    #[test]
    fn accepts_every_input_kind() {
        let base = hour("2017-04-21 14:00");
        let epoch = base.epoch();

        assert_eq!(Timestamp::new(epoch + 1_799, Granularity::Hour).unwrap(), base);
        assert_eq!(Timestamp::new(epoch as f64 + 0.4, Granularity::Hour).unwrap(), base);
        assert_eq!(Timestamp::new(base.to_datetime(), Granularity::Hour).unwrap(), base);
        assert_eq!(
            Timestamp::new(base.to_datetime().naive_utc(), Granularity::Hour).unwrap(),
            base
        );
        assert_eq!(Timestamp::new(base, Granularity::Hour).unwrap(), base);
        assert_eq!(hour("2017-04-21 14h"), base);
        assert_eq!(hour("2017-04-21 14"), base);
        assert_eq!(hour("2017-04-21T14:12:00"), base);
        assert_eq!(hour("2017-04-21T16:12:00+02:00"), base);
        assert_eq!(
            Timestamp::new("2012-1-1", Granularity::Day).unwrap(),
            Timestamp::new("2012-01-01", Granularity::Day).unwrap()
        );
    }

    #[test]
    fn rejects_unrecognized_input() {
        for raw in ["", "yesterday", "2017-13-40", "2017-04-21 99h"] {
            assert!(matches!(
                Timestamp::new(raw, Granularity::Hour),
                Err(TimestampError::InvalidFormat(_))
            ));
        }
        assert!(matches!(
            Timestamp::new(f64::NAN, Granularity::Hour),
            Err(TimestampError::InvalidFormat(_))
        ));
        assert!(matches!(
            Timestamp::new(i64::MAX, Granularity::Hour),
            Err(TimestampError::OutOfRange(_))
        ));
    }

    #[test]
    fn advance_moves_across_day_boundaries() {
        let mut s = hour("2017-02-17 01:00");
        s.advance_steps(-2).unwrap();
        assert_eq!(s, hour("2017-02-16 23:00"));

        let mut s = hour("2017-02-17 23:00");
        s.advance(ChronoDuration::days(3) + ChronoDuration::hours(2))
            .unwrap();
        assert_eq!(s, hour("2017-02-21 01:00"));

        let mut s = hour("2017-02-19 22:00");
        for expected in ["2017-02-19 23:00", "2017-02-20 00:00", "2017-02-20 01:00"] {
            s.advance(Granularity::Hour.step()).unwrap();
            assert_eq!(s, hour(expected));
        }
        s.advance(-Granularity::Hour.step()).unwrap();
        assert_eq!(s, hour("2017-02-20 00:00"));
    }

    #[test]
    fn advance_by_partial_step_floors_to_bucket() {
        let mut s = hour("2017-02-17 14:00");
        s.advance(ChronoDuration::minutes(90)).unwrap();
        assert_eq!(s, hour("2017-02-17 15:00"));
        s.advance(ChronoDuration::minutes(-30)).unwrap();
        assert_eq!(s, hour("2017-02-17 14:00"));
    }

    #[test]
    fn ordering_hashing_and_display_use_the_bucket() {
        let a = hour("2017-04-21 14:10");
        let b = hour("2017-04-21 14:50");
        let c = hour("2017-04-21 15:00");
        assert!(a < c);
        assert_eq!(a.steps_until(&c), 1);
        assert_eq!(c.steps_until(&a), -1);

        let set: HashSet<Timestamp> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);

        assert_eq!(a.to_string(), "2017-04-21 14h");
        assert_eq!(
            Timestamp::new("2017-04-21 14:10", Granularity::Day)
                .unwrap()
                .to_string(),
            "2017-04-21"
        );
        assert_eq!(
            Timestamp::new("2017-04-21 14:10:33", Granularity::Minute)
                .unwrap()
                .to_string(),
            "2017-04-21 14:10"
        );
    }

    #[test]
    fn now_is_quantized_utc() {
        let now = Timestamp::now(Granularity::Hour);
        assert_eq!(now.epoch() % 3_600, 0);
        let wall = Utc::now().timestamp();
        assert!(wall - now.epoch() < 3_600 + 5);
    }

    #[test]
    fn granularity_parsing() {
        assert_eq!(parse_granularity("Hour").unwrap(), Granularity::Hour);
        assert_eq!(parse_granularity("1d").unwrap(), Granularity::Day);
        assert_eq!("minute".parse::<Granularity>().unwrap(), Granularity::Minute);
        assert!(matches!(
            parse_granularity("week"),
            Err(TimestampError::UnknownGranularity(_))
        ));
    }
}
