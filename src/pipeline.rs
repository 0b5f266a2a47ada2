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
//! The continuous tracing pipeline.
//!
//! Every round, all hosts named by the clusters configuration are queried
//! with an empty keyword list, the hits are buffered per message id, and
//! buffers that stayed quiet for `hold_rounds` rounds are flushed as
//! OpenTelemetry traces. Consecutive windows overlap by `go_back_seconds`
//! to catch records whose syslog timestamp predates their ingest time; the
//! overlap is deduplicated per record. Per-round errors never stop the
//! loop; only cancellation does, and a cancelled pipeline still finishes
//! the round in progress.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use itertools::Itertools;
use tokio::sync::Semaphore;

use crate::aggregator::Aggregator;
use crate::config::Config;
use crate::event::{extract, MailEvent, MailEventKind};
use crate::otel::SpanShipper;
use crate::records::LogRecord;
use crate::util::TimeWindow;

/// Everything buffered so far for one message id.
#[derive(Debug, Clone)]
pub struct TraceState {
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Hosts that contributed records.
    pub hosts: BTreeSet<String>,
    /// Dedup keys of every ingested record.
    pub seen: HashSet<(DateTime<Utc>, String, String)>,
    /// Records in ingestion order.
    pub records: Vec<LogRecord>,
    /// Rounds since the last new record; reset on every arrival.
    pub rounds_since_new: u32,
}

impl TraceState {
    fn new(first_seen: DateTime<Utc>) -> Self {
        Self {
            first_seen,
            last_seen: first_seen,
            hosts: BTreeSet::new(),
            seen: HashSet::new(),
            records: Vec::new(),
            rounds_since_new: 0,
        }
    }

    /// Returns true when the record was new to this trace.
    fn ingest(&mut self, record: &LogRecord) -> bool {
        if !self.seen.insert(record.dedup_key()) {
            return false;
        }
        self.first_seen = self.first_seen.min(record.timestamp);
        self.last_seen = self.last_seen.max(record.timestamp);
        self.hosts.insert(record.host.clone());
        self.records.push(record.clone());
        true
    }
}

/// Records with a queue id but no resolvable message id yet, parked for a
/// later join.
#[derive(Debug, Default)]
struct OrphanGroup {
    records: Vec<LogRecord>,
    age: u32,
}

pub struct Pipeline {
    aggregator: Arc<dyn Aggregator>,
    config: Arc<Config>,
    shipper: SpanShipper,
    limit: Arc<Semaphore>,
    buffer: BTreeMap<String, TraceState>,
    /// Learned queue-id to message-id joins, per host.
    qid_msgid: HashMap<(String, String), String>,
    orphans: HashMap<(String, String), OrphanGroup>,
    prev_end: Option<DateTime<Utc>>,
    auth_failures: u32,
    round: u64,
}

impl Pipeline {
    pub fn new(
        aggregator: Arc<dyn Aggregator>,
        config: Arc<Config>,
        otel_endpoint: impl Into<String>,
    ) -> Self {
        let limit = Arc::new(Semaphore::new(config.max_parallel_queries));
        Self {
            aggregator,
            config,
            shipper: SpanShipper::new(otel_endpoint),
            limit,
            buffer: BTreeMap::new(),
            qid_msgid: HashMap::new(),
            orphans: HashMap::new(),
            prev_end: None,
            auth_failures: 0,
            round: 0,
        }
    }

    /// Run rounds until `shutdown` resolves. The round in progress always
    /// completes its flush before the loop exits.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        loop {
            self.round += 1;
            let window = self.compute_window(Utc::now());
            let (records, auth_seen) = self.collect(window).await;
            self.auth_failures = if auth_seen { (self.auth_failures + 1).min(6) } else { 0 };

            let flushed = self.ingest_round(records);
            for (message_id, state) in flushed {
                match self.shipper.ship(&message_id, &state, &self.config) {
                    Ok(spans) => log::info!(
                        "round {}: flushed {message_id:?} with {spans} spans across {} hosts",
                        self.round,
                        state.hosts.len()
                    ),
                    Err(e) => log::error!("round {}: export of {message_id:?} failed: {e}", self.round),
                }
            }
            self.shipper.flush();

            let sleep = self.config.tracing.sleep_seconds << self.auth_failures;
            if self.auth_failures > 0 {
                log::warn!("authentication failing, backing off to {sleep}s rounds");
            }
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(std::time::Duration::from_secs(sleep)) => {}
            }
        }
        log::info!("shutting down after round {}", self.round);
        self.shipper.shutdown();
    }

    /// Round R queries `[prev_end - go_back, now]`; the first round starts
    /// one sleep interval back.
    fn compute_window(&mut self, now: DateTime<Utc>) -> TimeWindow {
        let sleep = Duration::seconds(self.config.tracing.sleep_seconds as i64);
        let go_back = Duration::seconds(self.config.tracing.go_back_seconds as i64);
        let prev_end = self.prev_end.unwrap_or(now - sleep);
        self.prev_end = Some(now);
        TimeWindow::new(prev_end - go_back, now)
    }

    /// Fan out one empty-keyword query per configured host.
    async fn collect(&self, window: TimeWindow) -> (Vec<LogRecord>, bool) {
        let hosts = self.config.all_cluster_hosts();
        if hosts.is_empty() {
            log::warn!("clusters configuration names no hosts, nothing to trace");
        }

        let jobs: Vec<_> = hosts
            .into_iter()
            .map(|host| {
                let aggregator = Arc::clone(&self.aggregator);
                let limit = Arc::clone(&self.limit);
                tokio::spawn(async move {
                    let _permit = limit.acquire().await.expect("semaphore closed");
                    let result = aggregator.query(&host, &[], window).await;
                    (host, result)
                })
            })
            .collect();

        let mut records = Vec::new();
        let mut auth_seen = false;
        for job in jobs {
            match job.await {
                Ok((_, Ok(mut hits))) => records.append(&mut hits),
                Ok((host, Err(e))) => {
                    auth_seen |= e.is_auth();
                    log::warn!("skipping {host} this round: {e}");
                }
                Err(e) => log::warn!("collector task failed: {e}"),
            }
        }
        (records, auth_seen)
    }

    /// Buffer one round of records and return the traces due for flushing.
    fn ingest_round(&mut self, records: Vec<LogRecord>) -> Vec<(String, TraceState)> {
        let mut refreshed: HashSet<String> = HashSet::new();

        let (groups, loose) = prepare_groups(records, &self.config);
        self.learn_joins(&groups);

        // append grouped records to their message buffer, or park them
        for ((host, queue_id), group, _) in &groups {
            match self.qid_msgid.get(&(host.clone(), queue_id.clone())).cloned() {
                Some(message_id) => {
                    if self.ingest_into(&message_id, group) {
                        refreshed.insert(message_id);
                    }
                }
                None => {
                    let orphan = self
                        .orphans
                        .entry((host.clone(), queue_id.clone()))
                        .or_default();
                    orphan.records.extend(group.iter().cloned());
                }
            }
        }

        // loose records only join through their own message-id
        for (record, message_id) in &loose {
            if self.ingest_into(message_id, std::slice::from_ref(record)) {
                refreshed.insert(message_id.clone());
            }
        }

        // retry parked groups, aging out the ones that never resolve
        let parked: Vec<_> = self.orphans.keys().cloned().collect();
        for key in parked {
            if let Some(message_id) = self.qid_msgid.get(&key).cloned() {
                if let Some(orphan) = self.orphans.remove(&key) {
                    if self.ingest_into(&message_id, &orphan.records) {
                        refreshed.insert(message_id);
                    }
                }
            } else if let Some(orphan) = self.orphans.get_mut(&key) {
                orphan.age += 1;
                if orphan.age > self.config.tracing.hold_rounds {
                    log::debug!(
                        "dropping {} unjoinable records for {}/{}",
                        orphan.records.len(),
                        key.0,
                        key.1
                    );
                    self.orphans.remove(&key);
                }
            }
        }

        // quiescence bookkeeping, then flush whatever is due
        let mut flushed = Vec::new();
        let buffered: Vec<String> = self.buffer.keys().cloned().collect();
        for message_id in buffered {
            let Some(state) = self.buffer.get_mut(&message_id) else {
                continue;
            };
            if refreshed.contains(&message_id) {
                state.rounds_since_new = 0;
            } else {
                state.rounds_since_new += 1;
            }
            if state.rounds_since_new >= self.config.tracing.hold_rounds {
                if let Some(state) = self.buffer.remove(&message_id) {
                    self.qid_msgid.retain(|_, mapped| mapped != &message_id);
                    flushed.push((message_id, state));
                }
            }
        }
        flushed
    }

    fn ingest_into(&mut self, message_id: &str, records: &[LogRecord]) -> bool {
        let Some(first) = records.first() else {
            return false;
        };
        let state = self
            .buffer
            .entry(message_id.to_string())
            .or_insert_with(|| TraceState::new(first.timestamp));
        let mut any_new = false;
        for record in records {
            any_new |= state.ingest(record);
        }
        any_new
    }

    /// Learn queue-id to message-id joins from this round's Receive events,
    /// then push them across Forward handoffs until nothing changes.
    fn learn_joins(&mut self, groups: &[PreparedGroup]) {
        for ((host, queue_id), _, events) in groups {
            for event in events {
                if let (MailEventKind::Receive, Some(message_id)) =
                    (event.kind, event.message_id.as_ref())
                {
                    self.qid_msgid
                        .insert((host.clone(), queue_id.clone()), message_id.clone());
                }
            }
        }

        loop {
            let mut changed = false;
            for ((host, queue_id), _, events) in groups {
                let Some(message_id) =
                    self.qid_msgid.get(&(host.clone(), queue_id.clone())).cloned()
                else {
                    continue;
                };
                for event in events {
                    if event.kind != MailEventKind::Forward {
                        continue;
                    }
                    let (Some(relay), Some(peer_queue_id)) =
                        (event.next_host.as_deref(), event.peer_queue_id.clone())
                    else {
                        continue;
                    };
                    let key = (self.config.qualify(relay), peer_queue_id);
                    if self.qid_msgid.get(&key) != Some(&message_id) {
                        self.qid_msgid.insert(key, message_id.clone());
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
    }
}

type PreparedGroup = ((String, String), Vec<LogRecord>, Vec<MailEvent>);

/// Sort chronologically, group by `(host, queue_id)` in first-appearance
/// order and classify each group. Loose records are kept only when they
/// carry a message-id of their own.
fn prepare_groups(
    records: Vec<LogRecord>,
    config: &Config,
) -> (Vec<PreparedGroup>, Vec<(LogRecord, String)>) {
    let mut order: Vec<(String, String)> = Vec::new();
    let mut map: HashMap<(String, String), Vec<LogRecord>> = HashMap::new();
    let mut loose = Vec::new();

    for record in records.into_iter().sorted_by_key(|record| record.timestamp) {
        match record.queue_id.clone() {
            Some(queue_id) => {
                let key = (record.host.clone(), queue_id);
                if !map.contains_key(&key) {
                    order.push(key.clone());
                }
                map.entry(key).or_default().push(record);
            }
            None => {
                let events = extract(std::slice::from_ref(&record), &config.final_relays);
                if let Some(message_id) =
                    events.first().and_then(|event| event.message_id.clone())
                {
                    loose.push((record, message_id));
                }
            }
        }
    }

    let groups = order
        .into_iter()
        .filter_map(|key| {
            let group = map.remove(&key)?;
            let events = extract(&group, &config.final_relays);
            Some((key, group, events))
        })
        .collect();
    (groups, loose)
}

#[cfg(test)]
mod test_pipeline {
    use super::*;
    use crate::aggregator::AggregatorError;
    use crate::config::{Config, Method, SshConfig, TracingConfig};
    use async_trait::async_trait;
    use chrono::TimeZone;

    struct NullAggregator;

    #[async_trait]
    impl Aggregator for NullAggregator {
        async fn query(
            &self,
            _host: &str,
            _keywords: &[String],
            _window: TimeWindow,
        ) -> Result<Vec<LogRecord>, AggregatorError> {
            Ok(Vec::new())
        }
    }

    fn config(hold_rounds: u32) -> Arc<Config> {
        Arc::new(Config {
            method: Method::Ssh,
            log_level: "INFO".to_string(),
            ssh_config: Some(SshConfig::default()),
            opensearch_config: None,
            clusters: Default::default(),
            tracing: TracingConfig {
                sleep_seconds: 10,
                hold_rounds,
                go_back_seconds: 5,
            },
            domain: None,
            final_relays: vec!["local".to_string()],
            max_parallel_queries: 8,
        })
    }

    fn pipeline(hold_rounds: u32) -> Pipeline {
        Pipeline::new(
            Arc::new(NullAggregator),
            config(hold_rounds),
            "http://127.0.0.1:4317",
        )
    }

    fn record(host: &str, queue_id: &str, second: u32, message: &str) -> LogRecord {
        LogRecord {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, second).unwrap(),
            host: host.to_string(),
            service: "postfix/smtpd".to_string(),
            queue_id: Some(queue_id.to_string()),
            message: message.to_string(),
        }
    }

    #[test]
    fn window_arithmetic_with_overlap() {
        let mut pipeline = pipeline(2);
        let t100 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 1, 40).unwrap();
        let first = pipeline.compute_window(t100);
        // first round reaches one sleep interval plus the overlap back
        assert_eq!(first.end, t100);
        assert_eq!(first.start, t100 - Duration::seconds(15));

        let t110 = t100 + Duration::seconds(10);
        let second = pipeline.compute_window(t110);
        assert_eq!(second.start, t100 - Duration::seconds(5));
        assert_eq!(second.end, t110);
    }

    #[test]
    fn hold_rounds_buffering() {
        let mut pipeline = pipeline(2);

        let r1 = pipeline.ingest_round(vec![
            record("mx1", "AA11", 1, "AA11: message-id=<m@example.com>"),
            record("mx1", "AA11", 2, "AA11: from=<a@b>, size=1024"),
        ]);
        assert!(r1.is_empty());

        let r2 = pipeline.ingest_round(vec![record(
            "mx1",
            "AA11",
            3,
            "AA11: to=<u@v>, relay=local, status=sent (delivered)",
        )]);
        assert!(r2.is_empty());

        let r3 = pipeline.ingest_round(Vec::new());
        assert!(r3.is_empty());

        let r4 = pipeline.ingest_round(Vec::new());
        assert_eq!(r4.len(), 1);
        let (message_id, state) = &r4[0];
        assert_eq!(message_id, "m@example.com");
        assert_eq!(state.records.len(), 3);
        assert_eq!(state.first_seen, Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 1).unwrap());
        assert_eq!(state.last_seen, Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 3).unwrap());
    }

    #[test]
    fn hold_rounds_zero_flushes_immediately() {
        let mut pipeline = pipeline(0);
        let flushed = pipeline.ingest_round(vec![record(
            "mx1",
            "AA11",
            1,
            "AA11: message-id=<now@example.com>",
        )]);
        assert_eq!(flushed.len(), 1);
        assert!(pipeline.buffer.is_empty());
    }

    #[test]
    fn late_arrival_is_deduplicated() {
        let mut pipeline = pipeline(3);
        let line = record("mx1", "AA11", 7, "AA11: message-id=<late@example.com>");

        pipeline.ingest_round(vec![line.clone()]);
        pipeline.ingest_round(vec![line.clone()]);

        let state = &pipeline.buffer["late@example.com"];
        assert_eq!(state.records.len(), 1);
        // the duplicate did not count as activity
        assert_eq!(state.rounds_since_new, 1);
    }

    #[test]
    fn cross_host_join_through_forward() {
        let mut pipeline = pipeline(2);

        // round 1: only the downstream host shows up, unjoinable so far
        let r1 = pipeline.ingest_round(vec![record(
            "mailer.example.com",
            "DEF456",
            5,
            "DEF456: client=mx.example.com[192.0.2.1]",
        )]);
        assert!(r1.is_empty());
        assert_eq!(pipeline.buffer.len(), 0);
        assert_eq!(pipeline.orphans.len(), 1);

        // round 2: the upstream receive and forward arrive late
        pipeline.ingest_round(vec![
            record("mx.example.com", "ABC123", 1, "ABC123: message-id=<j@example.com>"),
            record(
                "mx.example.com",
                "ABC123",
                2,
                "ABC123: to=<u@v>, relay=mailer.example.com[10.0.0.2]:25, status=sent (queued as DEF456)",
            ),
        ]);

        let state = &pipeline.buffer["j@example.com"];
        assert_eq!(state.records.len(), 3);
        assert!(state.hosts.contains("mx.example.com"));
        assert!(state.hosts.contains("mailer.example.com"));
        assert!(pipeline.orphans.is_empty());
    }

    #[test]
    fn unjoinable_groups_age_out() {
        let mut pipeline = pipeline(1);
        pipeline.ingest_round(vec![record("mx1", "ZZ99", 1, "ZZ99: removed")]);
        assert_eq!(pipeline.orphans.len(), 1);
        pipeline.ingest_round(Vec::new());
        assert!(pipeline.orphans.is_empty());
    }
}
