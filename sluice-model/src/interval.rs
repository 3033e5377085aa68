use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl TimeUnit {
    fn token(self) -> char {
        match self {
            TimeUnit::Second => 's',
            TimeUnit::Minute => 'm',
            TimeUnit::Hour => 'h',
            TimeUnit::Day => 'D',
            TimeUnit::Week => 'W',
            TimeUnit::Month => 'M',
            TimeUnit::Year => 'Y',
        }
    }

    fn seconds(self) -> u64 {
        match self {
            TimeUnit::Second => 1,
            TimeUnit::Minute => 60,
            TimeUnit::Hour => 3_600,
            TimeUnit::Day => 86_400,
            TimeUnit::Week => 604_800,
            // Calendar units approximated for bucket and TTL arithmetic;
            // cron firing stays calendar-exact.
            TimeUnit::Month => 2_592_000,
            TimeUnit::Year => 31_536_000,
        }
    }

    fn allowed_counts(self) -> &'static [u32] {
        match self {
            TimeUnit::Second => &[1, 2, 5, 10, 15, 20, 30],
            TimeUnit::Minute => &[1, 2, 5, 10, 15, 30],
            TimeUnit::Hour => &[1, 2, 4, 6, 8, 12],
            TimeUnit::Day => &[1, 2, 3],
            TimeUnit::Week | TimeUnit::Month | TimeUnit::Year => &[1],
        }
    }
}

/// An ingestion cadence token such as `s5`, `m1`, `h12`, `D1`, `W1`.
///
/// The token set is closed: every member maps deterministically to a
/// duration in seconds and to a UTC floor-aligned cron expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interval {
    pub unit: TimeUnit,
    pub count: u32,
}

impl Interval {
    pub const M5: Interval = Interval {
        unit: TimeUnit::Minute,
        count: 5,
    };
    pub const H1: Interval = Interval {
        unit: TimeUnit::Hour,
        count: 1,
    };

    pub fn seconds(self) -> u64 {
        self.unit.seconds() * u64::from(self.count)
    }

    pub fn delta(self) -> Duration {
        Duration::seconds(self.seconds() as i64)
    }

    /// Six-field cron expression (`sec min hour dom month dow`) firing at
    /// the floor of each interval boundary, UTC.
    pub fn cron(self) -> String {
        let n = self.count;
        match self.unit {
            TimeUnit::Second => format!("*/{n} * * * * *"),
            TimeUnit::Minute => format!("0 */{n} * * * *"),
            TimeUnit::Hour => format!("0 0 */{n} * * *"),
            TimeUnit::Day => format!("0 0 0 */{n} * *"),
            TimeUnit::Week => "0 0 0 * * Mon".to_string(),
            TimeUnit::Month => "0 0 0 1 * *".to_string(),
            TimeUnit::Year => "0 0 0 1 1 *".to_string(),
        }
    }

    /// Bucket identity: the UTC floor of `t` to an epoch-multiple of this
    /// interval's width.
    pub fn bucket_start(self, t: DateTime<Utc>) -> DateTime<Utc> {
        let secs = self.seconds() as i64;
        let floored = t.timestamp().div_euclid(secs) * secs;
        Utc.timestamp_opt(floored, 0).single().unwrap_or(t)
    }

    /// Claim-lock TTL for one (ingester, bucket) pair.
    pub fn claim_ttl(self) -> u64 {
        (self.seconds() * 2).min(300)
    }

    /// Postgres interval literal for `time_bucket`.
    pub fn pg_interval(self) -> String {
        let (noun, n) = match self.unit {
            TimeUnit::Second => ("second", self.count),
            TimeUnit::Minute => ("minute", self.count),
            TimeUnit::Hour => ("hour", self.count),
            TimeUnit::Day => ("day", self.count),
            TimeUnit::Week => ("week", self.count),
            TimeUnit::Month => ("month", self.count),
            TimeUnit::Year => ("year", self.count),
        };
        if n == 1 {
            format!("1 {noun}")
        } else {
            format!("{n} {noun}s")
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.unit.token(), self.count)
    }
}

impl FromStr for Interval {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let unit = match chars.next() {
            Some('s') => TimeUnit::Second,
            Some('m') => TimeUnit::Minute,
            Some('h') => TimeUnit::Hour,
            Some('D') => TimeUnit::Day,
            Some('W') => TimeUnit::Week,
            Some('M') => TimeUnit::Month,
            Some('Y') => TimeUnit::Year,
            _ => return Err(ConfigError::BadInterval(s.to_string())),
        };
        let count: u32 = chars
            .as_str()
            .parse()
            .map_err(|_| ConfigError::BadInterval(s.to_string()))?;
        if !unit.allowed_counts().contains(&count) {
            return Err(ConfigError::BadInterval(s.to_string()));
        }
        Ok(Interval { unit, count })
    }
}

impl Default for Interval {
    fn default() -> Self {
        Interval::H1
    }
}

impl Serialize for Interval {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Interval {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Seconds until the next UTC boundary of a fixed window (60, 3600,
/// 86400). Limiter counters expire there so a fresh window starts clean.
pub fn secs_to_ceil(window_secs: u64, now: DateTime<Utc>) -> u64 {
    let window = window_secs as i64;
    let rem = now.timestamp().rem_euclid(window);
    (window - rem) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_closed_token_set() {
        for token in [
            "s1", "s30", "m1", "m5", "m30", "h1", "h12", "D1", "D3", "W1", "M1", "Y1",
        ] {
            let interval: Interval = token.parse().expect(token);
            assert_eq!(interval.to_string(), token);
        }
    }

    #[test]
    fn rejects_tokens_outside_the_set() {
        for token in ["s3", "m7", "h3", "D4", "W2", "x5", "m", "5m", ""] {
            assert!(token.parse::<Interval>().is_err(), "{token} should fail");
        }
    }

    #[test]
    fn seconds_are_deterministic() {
        assert_eq!("s10".parse::<Interval>().unwrap().seconds(), 10);
        assert_eq!("m5".parse::<Interval>().unwrap().seconds(), 300);
        assert_eq!("h12".parse::<Interval>().unwrap().seconds(), 43_200);
        assert_eq!("W1".parse::<Interval>().unwrap().seconds(), 604_800);
    }

    #[test]
    fn bucket_start_floors_to_epoch_multiples() {
        let interval: Interval = "m5".parse().unwrap();
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 12, 3, 42).unwrap();
        let start = interval.bucket_start(t);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        assert_eq!(start.timestamp() % 300, 0);
        // Already-aligned instants are their own bucket start.
        assert_eq!(interval.bucket_start(start), start);
    }

    #[test]
    fn claim_ttl_is_capped() {
        assert_eq!("s5".parse::<Interval>().unwrap().claim_ttl(), 10);
        assert_eq!("m2".parse::<Interval>().unwrap().claim_ttl(), 240);
        assert_eq!("h1".parse::<Interval>().unwrap().claim_ttl(), 300);
    }

    #[test]
    fn ceil_boundary_math() {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 42).unwrap();
        assert_eq!(secs_to_ceil(60, t), 18);
        assert_eq!(secs_to_ceil(3600, t), 3558);
    }

    #[test]
    fn cron_expressions_floor_align() {
        assert_eq!("m5".parse::<Interval>().unwrap().cron(), "0 */5 * * * *");
        assert_eq!("s10".parse::<Interval>().unwrap().cron(), "*/10 * * * * *");
        assert_eq!("D1".parse::<Interval>().unwrap().cron(), "0 0 0 */1 * *");
        assert_eq!("M1".parse::<Interval>().unwrap().cron(), "0 0 0 1 * *");
    }
}
