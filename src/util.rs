// Mailtrace: Reconstruction of Mail Flows Across SMTP Relays from Syslog Data
// Copyright (C) 2024-2025 The mailtrace developers
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//! Utility module collection of functions

use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;

/// Errors produced while interpreting user-supplied time arguments.
#[derive(Debug, thiserror::Error)]
pub enum TimeError {
    #[error("invalid time {0:?}, expected YYYY-MM-DD HH:MM:SS")]
    InvalidTime(String),
    #[error("invalid time range {0:?}, expected <int><unit> with unit s, m, h or d")]
    InvalidRange(String),
    #[error("invalid timezone offset {0:?}, expected +HH:MM or -HH:MM")]
    InvalidOffset(String),
}

/// A closed time interval. All record timestamps compared against a window
/// are absolute instants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The window `[center - range, center + range]`.
    pub fn around(center: DateTime<Utc>, range: Duration) -> Self {
        Self { start: center - range, end: center + range }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t <= self.end
    }
}

pub fn init_logging(level: log::LevelFilter) {
    let mut builder = pretty_env_logger::formatted_builder();
    builder.filter_level(level);
    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    }
    // keep going if a test harness already installed a logger
    let _ = builder.try_init();
}

/// Parse a `--time` argument of the form `YYYY-MM-DD HH:MM:SS` (UTC).
pub fn parse_time(s: &str) -> Result<DateTime<Utc>, TimeError> {
    NaiveDateTime::parse_from_str(s.trim(), "%Y-%m-%d %H:%M:%S")
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|_| TimeError::InvalidTime(s.to_string()))
}

lazy_static! {
    static ref RANGE_RE: Regex = Regex::new(r"^(\d+)([smhd])$").unwrap();
}

/// Parse a `--time-range` argument of the form `<int><unit>`.
pub fn parse_range(s: &str) -> Result<Duration, TimeError> {
    let caps = RANGE_RE
        .captures(s.trim())
        .ok_or_else(|| TimeError::InvalidRange(s.to_string()))?;
    let n: i64 = caps[1]
        .parse()
        .map_err(|_| TimeError::InvalidRange(s.to_string()))?;
    Ok(match &caps[2] {
        "s" => Duration::seconds(n),
        "m" => Duration::minutes(n),
        "h" => Duration::hours(n),
        _ => Duration::days(n),
    })
}

/// Parse a timezone offset of the form `+HH:MM` or `-HH:MM`.
pub fn parse_offset(s: &str) -> Result<FixedOffset, TimeError> {
    let err = || TimeError::InvalidOffset(s.to_string());
    let (sign, rest) = match s.as_bytes().first() {
        Some(b'+') => (1, &s[1..]),
        Some(b'-') => (-1, &s[1..]),
        _ => return Err(err()),
    };
    let (h, m) = rest.split_once(':').ok_or_else(err)?;
    let h: i32 = h.parse().map_err(|_| err())?;
    let m: i32 = m.parse().map_err(|_| err())?;
    if h > 23 || m > 59 {
        return Err(err());
    }
    FixedOffset::east_opt(sign * (h * 3600 + m * 60)).ok_or_else(err)
}

/// Append the configured DNS suffix to a bare hostname. Names that already
/// contain a dot are left alone.
pub fn qualify(host: &str, domain: Option<&str>) -> String {
    match domain {
        Some(d) if !host.contains('.') && !d.is_empty() => format!("{host}.{d}"),
        _ => host.to_string(),
    }
}

#[cfg(test)]
mod test_time {
    use super::*;

    #[test]
    fn time_roundtrip() {
        let t = parse_time("2024-03-01 12:30:00").unwrap();
        assert_eq!(t.to_rfc3339(), "2024-03-01T12:30:00+00:00");
        assert!(parse_time("yesterday").is_err());
    }

    #[test]
    fn ranges() {
        assert_eq!(parse_range("30s").unwrap(), Duration::seconds(30));
        assert_eq!(parse_range("5m").unwrap(), Duration::minutes(5));
        assert_eq!(parse_range("2h").unwrap(), Duration::hours(2));
        assert_eq!(parse_range("1d").unwrap(), Duration::days(1));
        assert!(parse_range("10w").is_err());
        assert!(parse_range("m5").is_err());
    }

    #[test]
    fn offsets() {
        assert_eq!(parse_offset("+00:00").unwrap().local_minus_utc(), 0);
        assert_eq!(parse_offset("+02:00").unwrap().local_minus_utc(), 7200);
        assert_eq!(parse_offset("-05:30").unwrap().local_minus_utc(), -19800);
        assert!(parse_offset("02:00").is_err());
        assert!(parse_offset("+25:00").is_err());
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let t0 = parse_time("2024-03-01 12:00:00").unwrap();
        let t1 = parse_time("2024-03-01 13:00:00").unwrap();
        let w = TimeWindow::new(t0, t1);
        assert!(w.contains(t0));
        assert!(w.contains(t1));
        assert!(!w.contains(t1 + Duration::seconds(1)));
    }

    #[test]
    fn qualify_bare_names() {
        assert_eq!(qualify("mx1", Some("example.com")), "mx1.example.com");
        assert_eq!(qualify("mx1.example.com", Some("example.com")), "mx1.example.com");
        assert_eq!(qualify("mx1", None), "mx1");
    }
}
