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
//! The uniform contract over the two log backends.
//!
//! An aggregator returns, for one host and time window, every log record
//! whose message contains one of the keywords, sorted ascending by
//! timestamp with ties in input order, fully materialized. Which backend
//! serves the query is decided once from the `method` config key.

use async_trait::async_trait;

use crate::config::{Config, ConfigError, Method};
use crate::records::LogRecord;
use crate::util::TimeWindow;

mod opensearch;
mod ssh;

pub use opensearch::IndexAggregator;
pub use ssh::ShellAggregator;

#[derive(Debug, thiserror::Error)]
pub enum AggregatorError {
    #[error("cannot reach {host}: {reason}")]
    Connect { host: String, reason: String },
    #[error("authentication refused on {host}: {reason}")]
    Auth { host: String, reason: String },
    #[error("log source missing on {host}: {reason}")]
    MissingSource { host: String, reason: String },
    #[error("backend failure on {host}: {reason}")]
    Backend { host: String, reason: String },
}

impl AggregatorError {
    /// Auth failures are the one class the continuous pipeline backs off
    /// on instead of retrying at full rate.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }
}

#[async_trait]
pub trait Aggregator: Send + Sync {
    /// Fetch all records on `host` within `window` whose message contains at
    /// least one of `keywords`. An empty keyword list matches everything.
    async fn query(
        &self,
        host: &str,
        keywords: &[String],
        window: TimeWindow,
    ) -> Result<Vec<LogRecord>, AggregatorError>;
}

/// The configured backend, chosen from the `method` config key.
pub enum Backend {
    Shell(ShellAggregator),
    Index(IndexAggregator),
}

impl Backend {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(match config.method {
            Method::Ssh => Self::Shell(ShellAggregator::new(config)?),
            Method::Opensearch => Self::Index(IndexAggregator::new(config)?),
        })
    }
}

#[async_trait]
impl Aggregator for Backend {
    async fn query(
        &self,
        host: &str,
        keywords: &[String],
        window: TimeWindow,
    ) -> Result<Vec<LogRecord>, AggregatorError> {
        match self {
            Self::Shell(aggregator) => aggregator.query(host, keywords, window).await,
            Self::Index(aggregator) => aggregator.query(host, keywords, window).await,
        }
    }
}

/// Shared post-processing: drop records outside the window or without a
/// keyword hit, then sort ascending by timestamp keeping input order on
/// ties.
pub(crate) fn finalize(
    mut records: Vec<LogRecord>,
    keywords: &[String],
    window: TimeWindow,
) -> Vec<LogRecord> {
    records.retain(|record| {
        window.contains(record.timestamp)
            && (keywords.is_empty()
                || keywords.iter().any(|keyword| record.message.contains(keyword)))
    });
    records.sort_by_key(|record| record.timestamp);
    records
}

#[cfg(test)]
mod test_finalize {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn record(second: u32, message: &str) -> LogRecord {
        LogRecord {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, second).unwrap(),
            host: "mx1".to_string(),
            service: "postfix/smtp".to_string(),
            queue_id: None,
            message: message.to_string(),
        }
    }

    #[test]
    fn filters_window_and_keywords() {
        let window = TimeWindow::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 1).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 5).unwrap(),
        );
        let keywords = vec!["ABC123".to_string()];
        let records = vec![
            record(0, "ABC123: too early"),
            record(3, "DEF456: no keyword hit"),
            record(4, "ABC123: kept"),
            record(2, "ABC123: kept but earlier"),
        ];
        let out = finalize(records, &keywords, window);
        assert_eq!(out.len(), 2);
        assert!(out[0].message.contains("earlier"));
    }

    #[test]
    fn sort_is_stable_on_ties() {
        let window = TimeWindow::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 9).unwrap(),
        );
        let out = finalize(
            vec![record(1, "first"), record(1, "second"), record(0, "zeroth")],
            &[],
            window,
        );
        assert_eq!(
            out.iter().map(|r| r.message.as_str()).collect::<Vec<_>>(),
            vec!["zeroth", "first", "second"]
        );
    }
}
