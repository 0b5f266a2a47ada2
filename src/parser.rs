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
//! Parsers turning one raw syslog line into a [`LogRecord`].
//!
//! Two wire formats are supported, plus an auto-detecting variant that picks
//! between them by looking at the first character of the line. Malformed
//! lines are reported as [`ParseError`] and dropped by the aggregators; bulk
//! log streams routinely contain non-mail noise.

use chrono::{DateTime, Datelike, FixedOffset, NaiveDateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::records::LogRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyslogFormat {
    /// ISO 8601 timestamp with explicit timezone, then hostname, appname,
    /// procid, msgid, structured data and message.
    Rfc5424,
    /// `Mmm dd HH:MM:SS host service[pid]: message`; the year is absent on
    /// the wire and inferred from the search window.
    Rfc3164,
    /// Auto-detect: a leading digit selects RFC 5424, a letter RFC 3164.
    #[serde(rename = "syslog")]
    Syslog,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("line does not match the {0:?} layout")]
    Layout(SyslogFormat),
    #[error("unparsable timestamp {0:?}")]
    Timestamp(String),
    #[error("empty line")]
    Empty,
}

lazy_static! {
    // Mmm dd HH:MM:SS host service[pid]: message
    static ref RFC3164_RE: Regex = Regex::new(
        r"^([A-Za-z]{3}\s+\d{1,2}\s+\d{2}:\d{2}:\d{2})\s+(\S+)\s+([^\s:\[]+)(?:\[\d+\])?:\s?(.*)$"
    )
    .unwrap();
    // queue id: uppercase hex token right after the service tag and colon
    static ref QUEUE_ID_RE: Regex = Regex::new(r"^([0-9A-F]+):(?:\s|$)").unwrap();
}

/// Extract the queue id leading the message payload, e.g. `ABC123DEF: ...`.
pub fn extract_queue_id(message: &str) -> Option<String> {
    QUEUE_ID_RE
        .captures(message)
        .map(|caps| caps[1].to_string())
}

/// A line parser configured for one host's log format.
///
/// The `reference` instant (usually the upper bound of the search window)
/// supplies the year for RFC 3164 timestamps and wraps it backward by one
/// year when the resulting instant would lie in the future.
#[derive(Debug, Clone)]
pub struct LineParser {
    format: SyslogFormat,
    time_format: String,
    tz: FixedOffset,
    reference: DateTime<Utc>,
}

impl LineParser {
    pub fn new(
        format: SyslogFormat,
        time_format: impl Into<String>,
        tz: FixedOffset,
        reference: DateTime<Utc>,
    ) -> Self {
        Self { format, time_format: time_format.into(), tz, reference }
    }

    pub fn parse(&self, line: &str) -> Result<LogRecord, ParseError> {
        let line = line.trim_end();
        match self.format {
            SyslogFormat::Rfc5424 => self.parse_rfc5424(line),
            SyslogFormat::Rfc3164 => self.parse_rfc3164(line),
            SyslogFormat::Syslog => match line.chars().next() {
                Some(c) if c.is_ascii_digit() => self.parse_rfc5424(line),
                Some(c) if c.is_ascii_alphabetic() => self.parse_rfc3164(line),
                Some(_) => Err(ParseError::Layout(SyslogFormat::Syslog)),
                None => Err(ParseError::Empty),
            },
        }
    }

    fn parse_rfc5424(&self, line: &str) -> Result<LogRecord, ParseError> {
        let mut fields = line.splitn(6, ' ');
        let ts = fields.next().ok_or(ParseError::Empty)?;
        let (host, service, _procid, _msgid, tail) = match (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) {
            (Some(h), Some(a), Some(p), Some(m), Some(t)) => (h, a, p, m, t),
            _ => return Err(ParseError::Layout(SyslogFormat::Rfc5424)),
        };

        let timestamp = DateTime::parse_from_rfc3339(ts)
            .map_err(|_| ParseError::Timestamp(ts.to_string()))?
            .with_timezone(&Utc);
        let message = strip_structured_data(tail).to_string();

        Ok(LogRecord {
            timestamp,
            host: host.to_string(),
            service: service.to_string(),
            queue_id: extract_queue_id(&message),
            message,
        })
    }

    fn parse_rfc3164(&self, line: &str) -> Result<LogRecord, ParseError> {
        let caps = RFC3164_RE
            .captures(line)
            .ok_or(ParseError::Layout(SyslogFormat::Rfc3164))?;
        let timestamp = self.resolve_year(&caps[1])?;
        let message = caps[4].to_string();

        Ok(LogRecord {
            timestamp,
            host: caps[2].to_string(),
            service: caps[3].to_string(),
            queue_id: extract_queue_id(&message),
            message,
        })
    }

    /// Parse a yearless BSD timestamp against the reference year, wrapping
    /// one year backward when the result lands after the reference.
    fn resolve_year(&self, ts: &str) -> Result<DateTime<Utc>, ParseError> {
        let collapsed = ts.split_whitespace().collect::<Vec<_>>().join(" ");
        let format = format!("%Y {}", self.time_format);
        let with_year = |year: i32| -> Option<DateTime<Utc>> {
            NaiveDateTime::parse_from_str(&format!("{year} {collapsed}"), &format)
                .ok()
                .and_then(|naive| naive.and_local_timezone(self.tz).single())
                .map(|local| local.with_timezone(&Utc))
        };

        let year = self.reference.year();
        let parsed = with_year(year).ok_or_else(|| ParseError::Timestamp(ts.to_string()))?;
        if parsed > self.reference {
            with_year(year - 1).ok_or_else(|| ParseError::Timestamp(ts.to_string()))
        } else {
            Ok(parsed)
        }
    }
}

/// Drop the structured-data element in front of an RFC 5424 message. `-`
/// marks the nil element; otherwise the element is a balanced bracket block.
fn strip_structured_data(tail: &str) -> &str {
    let tail = tail.trim_start();
    if tail == "-" {
        return "";
    }
    if let Some(rest) = tail.strip_prefix("- ") {
        return rest;
    }
    if tail.starts_with('[') {
        let mut depth = 0usize;
        for (i, c) in tail.char_indices() {
            match c {
                '[' => depth += 1,
                ']' => {
                    depth -= 1;
                    if depth == 0 {
                        return tail[i + 1..].trim_start();
                    }
                }
                _ => {}
            }
        }
    }
    tail
}

#[cfg(test)]
mod test_parser {
    use super::*;
    use chrono::TimeZone;

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn reference() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap()
    }

    fn bsd_parser() -> LineParser {
        LineParser::new(SyslogFormat::Rfc3164, "%b %d %H:%M:%S", utc(), reference())
    }

    #[test]
    fn rfc3164_with_queue_id() {
        let record = bsd_parser()
            .parse("Mar  1 06:25:01 mx1 postfix/smtpd[1234]: ABC123DEF: client=mail.example.org[192.0.2.4]")
            .unwrap();
        assert_eq!(record.host, "mx1");
        assert_eq!(record.service, "postfix/smtpd");
        assert_eq!(record.queue_id.as_deref(), Some("ABC123DEF"));
        assert_eq!(
            record.timestamp,
            Utc.with_ymd_and_hms(2024, 3, 1, 6, 25, 1).unwrap()
        );
        assert!(record.message.starts_with("ABC123DEF: client="));
    }

    #[test]
    fn rfc3164_without_queue_id() {
        let record = bsd_parser()
            .parse("Mar  1 06:25:02 mx1 postfix/anvil[99]: statistics: max connection rate 1/60s")
            .unwrap();
        assert_eq!(record.queue_id, None);
        assert_eq!(record.service, "postfix/anvil");
    }

    #[test]
    fn rfc3164_year_wraps_backward() {
        // reference is March 2024, so a December stamp belongs to 2023
        let record = bsd_parser()
            .parse("Dec 31 23:59:59 mx1 postfix/smtp[5]: qmgr idle")
            .unwrap();
        assert_eq!(record.timestamp.year(), 2023);
    }

    #[test]
    fn rfc3164_applies_timezone_offset() {
        let parser = LineParser::new(
            SyslogFormat::Rfc3164,
            "%b %d %H:%M:%S",
            FixedOffset::east_opt(2 * 3600).unwrap(),
            reference(),
        );
        let record = parser
            .parse("Mar  1 06:00:00 mx1 postfix/smtp[5]: ABC: done")
            .unwrap();
        assert_eq!(
            record.timestamp,
            Utc.with_ymd_and_hms(2024, 3, 1, 4, 0, 0).unwrap()
        );
    }

    #[test]
    fn rfc5424_basic() {
        let parser =
            LineParser::new(SyslogFormat::Rfc5424, "%b %d %H:%M:%S", utc(), reference());
        let record = parser
            .parse("2024-03-01T06:25:01+02:00 mx1.example.com postfix/smtpd 1234 - - ABC123: message-id=<x@y>")
            .unwrap();
        assert_eq!(record.host, "mx1.example.com");
        assert_eq!(record.queue_id.as_deref(), Some("ABC123"));
        assert_eq!(
            record.timestamp,
            Utc.with_ymd_and_hms(2024, 3, 1, 4, 25, 1).unwrap()
        );
        assert_eq!(record.message, "ABC123: message-id=<x@y>");
    }

    #[test]
    fn rfc5424_structured_data_block() {
        let parser =
            LineParser::new(SyslogFormat::Rfc5424, "%b %d %H:%M:%S", utc(), reference());
        let record = parser
            .parse("2024-03-01T06:25:01+00:00 mx1 postfix/smtpd 1 - [origin ip=\"192.0.2.1\"] DEF456: removed")
            .unwrap();
        assert_eq!(record.message, "DEF456: removed");
        assert_eq!(record.queue_id.as_deref(), Some("DEF456"));
    }

    #[test]
    fn auto_detection() {
        let parser =
            LineParser::new(SyslogFormat::Syslog, "%b %d %H:%M:%S", utc(), reference());
        assert_eq!(
            parser
                .parse("2024-03-01T06:25:01+00:00 mx1 postfix/smtpd 1 - - ABC: x")
                .unwrap()
                .host,
            "mx1"
        );
        assert_eq!(
            parser
                .parse("Mar  1 06:25:01 mx2 postfix/smtpd[1]: DEF: y")
                .unwrap()
                .host,
            "mx2"
        );
        assert!(parser.parse("-- noise line --").is_err());
        assert!(parser.parse("").is_err());
    }

    #[test]
    fn queue_id_shapes() {
        assert_eq!(extract_queue_id("ABC123DEF: removed"), Some("ABC123DEF".to_string()));
        assert_eq!(extract_queue_id("1A2B3C:"), Some("1A2B3C".to_string()));
        assert_eq!(extract_queue_id("statistics: foo"), None);
        assert_eq!(extract_queue_id("abc123: lowercase"), None);
        assert_eq!(extract_queue_id("warning: ABC123: nested"), None);
    }

    #[test]
    fn roundtrip_is_stable() {
        let parser =
            LineParser::new(SyslogFormat::Syslog, "%b %d %H:%M:%S", utc(), reference());
        let record = parser
            .parse("Mar  1 06:25:01 mx1 postfix/smtpd[1234]: ABC123: client=mail.example.org[192.0.2.4]")
            .unwrap();
        let again = parser.parse(&record.to_syslog()).unwrap();
        assert_eq!(record, again);
    }
}
