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
//! Index aggregator: queries an OpenSearch-style log index.
//!
//! The `(host, keywords, window)` triple is translated into a bool query
//! against the configured field mapping, with AND semantics over the
//! keywords as phrase matches on the message field. Results are paged until
//! exhausted; a hard cap bounds memory on runaway queries.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

use super::{finalize, Aggregator, AggregatorError};
use crate::config::{Config, ConfigError, OpenSearchConfig};
use crate::parser::extract_queue_id;
use crate::records::LogRecord;
use crate::util::{parse_offset, TimeWindow};

/// Upper bound on hits fetched for one query; exceeding it is reported as a
/// warning, not an error.
const RESULT_CAP: usize = 10_000;
const PAGE_SIZE: usize = 1_000;

pub struct IndexAggregator {
    http: reqwest::Client,
    config: OpenSearchConfig,
    base_url: String,
}

impl IndexAggregator {
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        let config = config
            .opensearch_config
            .clone()
            .ok_or(ConfigError::MissingSection("opensearch_config"))?;

        let scheme = if config.use_ssl { "https" } else { "http" };
        let base_url = format!("{scheme}://{}:{}", config.host, config.port);

        // long-lived client, reused for every query of the run
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!config.verify_certs)
            .timeout(std::time::Duration::from_secs(config.timeout))
            .build()
            .map_err(|e| ConfigError::Backend(e.to_string()))?;

        Ok(Self { http, config, base_url })
    }

    fn search_body(
        &self,
        host: &str,
        keywords: &[String],
        window: TimeWindow,
        from: usize,
    ) -> Value {
        let mapping = &self.config.mapping;
        let must: Vec<Value> = keywords
            .iter()
            .map(|keyword| json!({ "match_phrase": { (mapping.message.as_str()): keyword } }))
            .collect();
        json!({
            "query": {
                "bool": {
                    "filter": [
                        { "term": { (mapping.hostname.as_str()): host } },
                        { "range": { (mapping.timestamp.as_str()): {
                            "gte": window.start.to_rfc3339_opts(SecondsFormat::Millis, true),
                            "lte": window.end.to_rfc3339_opts(SecondsFormat::Millis, true),
                            "time_zone": (&self.config.time_zone),
                        }}},
                    ],
                    "must": must,
                }
            },
            "sort": [ { (mapping.timestamp.as_str()): { "order": "asc" } } ],
            "from": from,
            "size": PAGE_SIZE,
        })
    }

    async fn fetch_page(
        &self,
        host: &str,
        body: &Value,
    ) -> Result<Vec<Value>, AggregatorError> {
        let url = format!("{}/{}/_search", self.base_url, self.config.index);
        let mut request = self.http.post(&url).json(body);
        if let Some(username) = self.config.username.as_deref() {
            request = request.basic_auth(username, self.config.password.as_deref());
        }

        let response = request.send().await.map_err(|e| AggregatorError::Connect {
            host: host.to_string(),
            reason: e.to_string(),
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(AggregatorError::Auth {
                host: host.to_string(),
                reason: format!("index returned {status}"),
            });
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(AggregatorError::MissingSource {
                host: host.to_string(),
                reason: format!("index {:?} not found", self.config.index),
            });
        }
        if !status.is_success() {
            return Err(AggregatorError::Backend {
                host: host.to_string(),
                reason: format!("index returned {status}"),
            });
        }

        let payload: Value = response.json().await.map_err(|e| AggregatorError::Backend {
            host: host.to_string(),
            reason: format!("malformed response: {e}"),
        })?;
        match payload.pointer("/hits/hits") {
            Some(Value::Array(hits)) => Ok(hits.clone()),
            _ => Err(AggregatorError::Backend {
                host: host.to_string(),
                reason: "response carries no hits array".to_string(),
            }),
        }
    }

    fn decode_hit(&self, host: &str, hit: &Value) -> Option<LogRecord> {
        let mapping = &self.config.mapping;
        let source = hit.get("_source")?;
        let field = |name: &str| source.get(name).and_then(Value::as_str);

        let timestamp = self.decode_timestamp(field(&mapping.timestamp)?)?;
        let message = field(&mapping.message)?.to_string();
        Some(LogRecord {
            timestamp,
            host: field(&mapping.hostname).unwrap_or(host).to_string(),
            service: field(&mapping.service).unwrap_or_default().to_string(),
            queue_id: extract_queue_id(&message),
            message,
        })
    }

    /// Indexed timestamps either carry an offset or are naive in the
    /// configured timezone.
    fn decode_timestamp(&self, raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
            return Some(t.with_timezone(&Utc));
        }
        let tz = parse_offset(&self.config.time_zone).ok()?;
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .and_then(|naive| naive.and_local_timezone(tz).single())
            .map(|local| local.with_timezone(&Utc))
    }
}

#[async_trait]
impl Aggregator for IndexAggregator {
    async fn query(
        &self,
        host: &str,
        keywords: &[String],
        window: TimeWindow,
    ) -> Result<Vec<LogRecord>, AggregatorError> {
        let mut records = Vec::new();
        let mut dropped = 0usize;
        let mut from = 0usize;

        loop {
            let body = self.search_body(host, keywords, window, from);
            let hits = self.fetch_page(host, &body).await?;
            let page_len = hits.len();

            for hit in &hits {
                match self.decode_hit(host, hit) {
                    Some(record) => records.push(record),
                    None => dropped += 1,
                }
            }

            from += page_len;
            if page_len < PAGE_SIZE {
                break;
            }
            if from >= RESULT_CAP {
                log::warn!(
                    "[{host}] result cap of {RESULT_CAP} hits reached, trace may be incomplete"
                );
                break;
            }
        }

        if dropped > 0 {
            log::debug!("[{host}] dropped {dropped} undecodable index hits");
        }
        Ok(finalize(records, keywords, window))
    }
}

#[cfg(test)]
mod test_opensearch {
    use super::*;
    use crate::config::{Config, Method};
    use chrono::TimeZone;

    fn aggregator() -> IndexAggregator {
        let config = Config {
            method: Method::Opensearch,
            log_level: "INFO".to_string(),
            ssh_config: None,
            opensearch_config: Some(OpenSearchConfig {
                host: "search.example.com".to_string(),
                port: 9200,
                username: Some("admin".to_string()),
                password: Some("secret".to_string()),
                index: "mail-logs".to_string(),
                use_ssl: false,
                verify_certs: false,
                time_zone: "+02:00".to_string(),
                timeout: 10,
                mapping: Default::default(),
            }),
            clusters: Default::default(),
            tracing: Default::default(),
            domain: None,
            final_relays: vec!["local".to_string()],
            max_parallel_queries: 8,
        };
        IndexAggregator::new(&config).unwrap()
    }

    fn window() -> TimeWindow {
        TimeWindow::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 13, 0, 0).unwrap(),
        )
    }

    #[test]
    fn dsl_shape() {
        let aggregator = aggregator();
        let body = aggregator.search_body(
            "mx1.example.com",
            &["ABC123".to_string(), "user@example.com".to_string()],
            window(),
            0,
        );
        assert_eq!(
            body.pointer("/query/bool/filter/0/term/hostname").unwrap(),
            "mx1.example.com"
        );
        assert_eq!(
            body.pointer("/query/bool/filter/1/range/@timestamp/time_zone")
                .unwrap(),
            "+02:00"
        );
        // all keywords must match
        assert_eq!(body.pointer("/query/bool/must").unwrap().as_array().unwrap().len(), 2);
        assert_eq!(
            body.pointer("/sort/0/@timestamp/order").unwrap(),
            "asc"
        );
        assert_eq!(body.pointer("/size").unwrap(), 1000);
    }

    #[test]
    fn hit_decoding() {
        let aggregator = aggregator();
        let hit = json!({
            "_source": {
                "@timestamp": "2024-03-01T14:10:00.123",
                "hostname": "mx1.example.com",
                "programname": "postfix/smtpd",
                "message": "ABC123: client=mail.example.org[192.0.2.4]",
                "facility": "mail",
            }
        });
        let record = aggregator.decode_hit("mx1.example.com", &hit).unwrap();
        // naive timestamp shifted out of the +02:00 index timezone
        assert_eq!(
            record.timestamp,
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 10, 0).unwrap()
                + chrono::Duration::milliseconds(123)
        );
        assert_eq!(record.queue_id.as_deref(), Some("ABC123"));
        assert_eq!(record.service, "postfix/smtpd");

        let bad = json!({ "_source": { "message": "no timestamp" } });
        assert!(aggregator.decode_hit("mx1.example.com", &bad).is_none());
    }
}
