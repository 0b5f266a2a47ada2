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
//! OpenTelemetry export of reconstructed traces.
//!
//! Trace and span ids are derived from message and queue ids, so the same
//! mail maps to the same ids across rounds and process restarts and late
//! hops coalesce into one trace in the OTLP backend. Spans are emitted
//! through one tracer provider per traced host, each carrying the host name
//! as its service name.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use itertools::Itertools;
use opentelemetry::trace::{
    Span, SpanContext, SpanId, SpanKind, TraceContextExt, TraceFlags, TraceId, Tracer,
    TracerProvider, TraceState as SpanTraceState,
};
use opentelemetry::{Context, KeyValue};
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::event::{extract, MailEventKind};
use crate::pipeline::TraceState;

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("cannot build OTLP exporter: {0}")]
    Build(#[from] opentelemetry_otlp::ExporterBuildError),
    #[error("OTLP export failed: {0}")]
    Sdk(#[from] opentelemetry_sdk::error::OTelSdkError),
}

/// First 128 bits of SHA-256 over the raw message-id bytes.
pub fn trace_id_for(message_id: &str) -> TraceId {
    let digest = Sha256::digest(message_id.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    TraceId::from_bytes(bytes)
}

/// First 64 bits of SHA-256 over the raw queue-id bytes.
pub fn span_id_for(queue_id: &str) -> SpanId {
    let digest = Sha256::digest(queue_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    SpanId::from_bytes(bytes)
}

/// One planned span: a `(host, queue_id)` pair of the buffered trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanPlan {
    pub host: String,
    pub queue_id: String,
    pub service: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub parent: Option<(String, String)>,
    pub kind_counts: [(MailEventKind, usize); 5],
    pub status: String,
}

/// Derive the span topology of one buffered trace.
///
/// The span for `(H, Q)` parents `(R, Q2)` when a Forward on `H` names `R`
/// and either hands over the new queue id directly (`queued as Q2`) or the
/// receiving group's records reference `Q` as their upstream id.
pub fn plan_spans(state: &TraceState, config: &Config) -> Vec<SpanPlan> {
    // group in first-appearance order per (host, queue id)
    let mut order: Vec<(String, String)> = Vec::new();
    let mut groups: HashMap<(String, String), Vec<&crate::records::LogRecord>> = HashMap::new();
    let sorted = state
        .records
        .iter()
        .sorted_by_key(|record| record.timestamp)
        .collect::<Vec<_>>();
    for record in &sorted {
        let Some(queue_id) = record.queue_id.clone() else {
            continue;
        };
        let key = (record.host.clone(), queue_id);
        groups
            .entry(key.clone())
            .or_insert_with(|| {
                order.push(key.clone());
                Vec::new()
            })
            .push(*record);
    }

    let mut parents: HashMap<(String, String), (String, String)> = HashMap::new();
    let mut plans = Vec::new();

    for key in &order {
        let group: Vec<_> = groups[key].iter().map(|r| (*r).clone()).collect();
        let events = extract(&group, &config.final_relays);

        for event in &events {
            if event.kind != MailEventKind::Forward {
                continue;
            }
            let Some(relay) = event.next_host.as_deref() else {
                continue;
            };
            let next_host = config.qualify(relay);
            if let Some(peer_queue_id) = event.peer_queue_id.clone() {
                parents.entry((next_host, peer_queue_id)).or_insert_with(|| key.clone());
            } else {
                // fall back to the receive line on the next host that
                // mentions our queue id as its upstream reference
                for other in &order {
                    if other.0 == next_host
                        && other != key
                        && groups[other].iter().any(|r| r.message.contains(&key.1))
                    {
                        parents.entry(other.clone()).or_insert_with(|| key.clone());
                        break;
                    }
                }
            }
        }

        let mut counts = [
            (MailEventKind::Receive, 0),
            (MailEventKind::Connect, 0),
            (MailEventKind::Forward, 0),
            (MailEventKind::Deliver, 0),
            (MailEventKind::Other, 0),
        ];
        for event in &events {
            for slot in counts.iter_mut() {
                if slot.0 == event.kind {
                    slot.1 += 1;
                }
            }
        }
        let status = events
            .iter()
            .rev()
            .find(|event| event.kind == MailEventKind::Deliver)
            .and_then(|event| event.status.clone())
            .unwrap_or_else(|| "in-flight".to_string());

        plans.push(SpanPlan {
            host: key.0.clone(),
            queue_id: key.1.clone(),
            service: group
                .first()
                .map(|record| record.service.clone())
                .unwrap_or_default(),
            start: group.first().map(|record| record.timestamp).unwrap_or(state.first_seen),
            end: group.last().map(|record| record.timestamp).unwrap_or(state.last_seen),
            parent: None,
            kind_counts: counts,
            status,
        });
    }

    for plan in plans.iter_mut() {
        plan.parent = parents.get(&(plan.host.clone(), plan.queue_id.clone())).cloned();
    }
    plans
}

fn to_system_time(t: DateTime<Utc>) -> SystemTime {
    let nanos = t.timestamp_nanos_opt().unwrap_or(0).max(0) as u64;
    UNIX_EPOCH + Duration::from_nanos(nanos)
}

/// Ships planned spans over gRPC OTLP, one tracer provider per traced host.
pub struct SpanShipper {
    endpoint: String,
    providers: HashMap<String, SdkTracerProvider>,
}

impl SpanShipper {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self { endpoint: endpoint.into(), providers: HashMap::new() }
    }

    /// Providers are created lazily, the first time a host contributes a
    /// span, and live until shutdown.
    fn provider(&mut self, host: &str) -> Result<&SdkTracerProvider, ExportError> {
        if !self.providers.contains_key(host) {
            let exporter = SpanExporter::builder()
                .with_tonic()
                .with_endpoint(&self.endpoint)
                .build()?;
            let provider = SdkTracerProvider::builder()
                .with_resource(
                    Resource::builder().with_service_name(host.to_string()).build(),
                )
                .with_batch_exporter(exporter)
                .build();
            self.providers.insert(host.to_string(), provider);
        }
        Ok(&self.providers[host])
    }

    /// Emit one trace for a flushed message id. Returns the span count.
    pub fn ship(
        &mut self,
        message_id: &str,
        state: &TraceState,
        config: &Config,
    ) -> Result<usize, ExportError> {
        let trace_id = trace_id_for(message_id);
        let plans = plan_spans(state, config);

        for plan in &plans {
            let parent_cx = match &plan.parent {
                Some((_, parent_queue_id)) => Context::new().with_remote_span_context(
                    SpanContext::new(
                        trace_id,
                        span_id_for(parent_queue_id),
                        TraceFlags::SAMPLED,
                        true,
                        SpanTraceState::default(),
                    ),
                ),
                None => Context::new(),
            };

            let mut attributes = vec![
                KeyValue::new("mail.host", plan.host.clone()),
                KeyValue::new("mail.queue_id", plan.queue_id.clone()),
                KeyValue::new("mail.service", plan.service.clone()),
                KeyValue::new("mail.message_id", message_id.to_string()),
                KeyValue::new("mail.status", plan.status.clone()),
            ];
            for (kind, count) in plan.kind_counts {
                attributes.push(KeyValue::new(
                    format!("mail.events.{}", format!("{kind:?}").to_lowercase()),
                    count as i64,
                ));
            }

            let tracer = self.provider(&plan.host)?.tracer("mailtrace");
            let mut span = tracer
                .span_builder(format!("{}/{}", plan.host, plan.queue_id))
                .with_trace_id(trace_id)
                .with_span_id(span_id_for(&plan.queue_id))
                .with_kind(SpanKind::Server)
                .with_start_time(to_system_time(plan.start))
                .with_attributes(attributes)
                .start_with_context(&tracer, &parent_cx);
            span.end_with_timestamp(to_system_time(plan.end));
        }

        Ok(plans.len())
    }

    /// Push buffered spans out; called at every round boundary.
    pub fn flush(&self) {
        for (host, provider) in &self.providers {
            if let Err(e) = provider.force_flush() {
                log::warn!("OTLP flush for {host} failed: {e}");
            }
        }
    }

    pub fn shutdown(self) {
        for (host, provider) in self.providers {
            if let Err(e) = provider.shutdown() {
                log::warn!("OTLP shutdown for {host} failed: {e}");
            }
        }
    }
}
