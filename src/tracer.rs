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
//! The hop-following tracer.
//!
//! Starting from `(host, keyword)`, the tracer queries the host's logs,
//! groups the hits by queue id and chases every Forward event to the next
//! relay, where the sending queue id serves as the new keyword. A cluster
//! alias fans out to its physical members in parallel; everything else walks
//! depth-first. The visited set and the graph live behind one mutex, so
//! concurrent cluster walkers serialize their insertions.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Semaphore};

use crate::aggregator::Aggregator;
use crate::config::Config;
use crate::event::{extract, MailEventKind};
use crate::graph::MailGraph;
use crate::records::{group_by_queue, LogRecord};
use crate::util::TimeWindow;

#[derive(Debug, Default)]
struct WalkState {
    visited: HashSet<(String, String)>,
    graph: MailGraph,
    queries_ok: usize,
    queries_failed: usize,
    auth_error: Option<String>,
}

pub struct Tracer {
    aggregator: Arc<dyn Aggregator>,
    config: Arc<Config>,
    window: TimeWindow,
    limit: Semaphore,
    state: Mutex<WalkState>,
}

impl Tracer {
    pub fn new(
        aggregator: Arc<dyn Aggregator>,
        config: Arc<Config>,
        window: TimeWindow,
    ) -> Arc<Self> {
        let limit = Semaphore::new(config.max_parallel_queries);
        Arc::new(Self {
            aggregator,
            config,
            window,
            limit,
            state: Mutex::new(WalkState::default()),
        })
    }

    /// Walk the mail flow reachable from `start_host` and return the graph.
    ///
    /// `trace_id` is a user keyword on the first host and a queue id on
    /// every recursive visit. Per-host failures shrink the frontier but
    /// never abort the walk; an empty result is a valid graph.
    pub async fn trace(self: &Arc<Self>, start_host: &str, trace_id: &str) -> MailGraph {
        self.walk(start_host.to_string(), trace_id.to_string()).await;
        self.snapshot()
    }

    /// The graph accumulated so far; used for partial results after a
    /// cancelled walk.
    pub fn snapshot(&self) -> MailGraph {
        self.state.lock().expect("walk state poisoned").graph.clone()
    }

    /// Successful and failed host queries of this run.
    pub fn query_stats(&self) -> (usize, usize) {
        let state = self.state.lock().expect("walk state poisoned");
        (state.queries_ok, state.queries_failed)
    }

    /// The first authentication failure seen, if any. Bad credentials are
    /// not a per-host condition worth walking around.
    pub fn auth_error(&self) -> Option<String> {
        self.state.lock().expect("walk state poisoned").auth_error.clone()
    }

    fn walk(
        self: &Arc<Self>,
        host: String,
        trace_id: String,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let this = Arc::clone(self);
        Box::pin(async move {
            // a cluster alias fans out; a physical name is a frontier of one
            let members = this.config.cluster_members(&host);
            let (tx, mut rx) = mpsc::unbounded_channel();
            for member in members {
                let walker = Arc::clone(&this);
                let keyword = trace_id.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let records = walker.query_member(&member, &keyword).await;
                    let _ = tx.send((member, records));
                });
            }
            drop(tx);

            // the channel yields results in completion order, so the
            // earliest-responding member inserts its edges first
            while let Some((member, records)) = rx.recv().await {
                this.walk_member(&member, records).await;
            }
        })
    }

    /// Query one physical host, bounded by the global concurrency cap. A
    /// failing host is logged and removed from the frontier.
    async fn query_member(&self, member: &str, keyword: &str) -> Vec<LogRecord> {
        let _permit = self.limit.acquire().await.expect("semaphore closed");
        let keywords = vec![keyword.to_string()];
        match self.aggregator.query(member, &keywords, self.window).await {
            Ok(records) => {
                log::debug!("[{member}] {} records for {keyword:?}", records.len());
                self.state.lock().expect("walk state poisoned").queries_ok += 1;
                records
            }
            Err(e) => {
                log::warn!("skipping {member}: {e}");
                let mut state = self.state.lock().expect("walk state poisoned");
                state.queries_failed += 1;
                if e.is_auth() && state.auth_error.is_none() {
                    state.auth_error = Some(e.to_string());
                }
                Vec::new()
            }
        }
    }

    async fn walk_member(self: &Arc<Self>, member: &str, records: Vec<LogRecord>) {
        let member = self.config.qualify(member);
        let (groups, _context) = group_by_queue(records);

        for (queue_id, group) in groups {
            {
                let mut state = self.state.lock().expect("walk state poisoned");
                if !state.visited.insert((member.clone(), queue_id.clone())) {
                    continue;
                }
            }

            let events = extract(&group, &self.config.final_relays);
            let seen_here = events.iter().any(|event| {
                matches!(event.kind, MailEventKind::Receive | MailEventKind::Connect)
            });
            if seen_here {
                self.state
                    .lock()
                    .expect("walk state poisoned")
                    .graph
                    .add_node(member.clone());
            }

            for event in events {
                match event.kind {
                    MailEventKind::Forward => {
                        let Some(relay) = event.next_host.as_deref() else {
                            continue;
                        };
                        let next_host = self.config.qualify(relay);
                        if next_host == member {
                            // same-host queue rename: no hop, pivot to the
                            // id the daemon reassigned
                            if let Some(new_id) = event.peer_queue_id.as_deref() {
                                log::debug!("[{member}] queue {queue_id} renamed to {new_id}");
                                self.walk(member.clone(), new_id.to_string()).await;
                            }
                            continue;
                        }
                        self.state
                            .lock()
                            .expect("walk state poisoned")
                            .graph
                            .add_hop(&member, &next_host, &queue_id);
                        self.walk(next_host, queue_id.clone()).await;
                    }
                    MailEventKind::Deliver => {
                        log::debug!(
                            "[{member}] {queue_id} delivered: {}",
                            event.status.as_deref().unwrap_or("sent")
                        );
                    }
                    _ => {}
                }
            }
        }
    }
}
