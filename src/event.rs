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
//! Classification of log records into mail events.
//!
//! The extractor is pattern-based: each record of a `(host, queue_id)` group
//! is matched against the standard wording of mail-daemon logs. A shape that
//! matches but misses a field degrades to [`MailEventKind::Other`] instead
//! of failing the group.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::records::LogRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum MailEventKind {
    /// The queue id first appears, optionally carrying a message-id.
    Receive,
    /// The queue id is associated with a peer host during the handshake.
    Connect,
    /// The queue id is handed off to a next-hop relay.
    Forward,
    /// Terminal delivery, successful or bounced.
    Deliver,
    Other,
}

/// A classified log record plus the fields pulled out of its message.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MailEvent {
    pub record: LogRecord,
    pub kind: MailEventKind,
    /// Hostname inside `client=...`, for Connect.
    pub peer_host: Option<String>,
    /// `message-id=<...>` with angle brackets stripped, for Receive.
    pub message_id: Option<String>,
    /// Relay hostname, for Forward and Deliver.
    pub next_host: Option<String>,
    /// Queue id assigned by the next hop, from `queued as ...`.
    pub peer_queue_id: Option<String>,
    /// Delivery status, e.g. `sent`, `bounced` or `deferred`.
    pub status: Option<String>,
}

impl MailEvent {
    fn other(record: LogRecord) -> Self {
        Self {
            record,
            kind: MailEventKind::Other,
            peer_host: None,
            message_id: None,
            next_host: None,
            peer_queue_id: None,
            status: None,
        }
    }
}

lazy_static! {
    static ref CLIENT_RE: Regex = Regex::new(r"client=([A-Za-z0-9._-]+)\[").unwrap();
    static ref MESSAGE_ID_RE: Regex = Regex::new(r"message-id=<?([^<>\s,]+?)>?(?:,|\s|$)").unwrap();
    static ref RELAY_RE: Regex =
        Regex::new(r"relay=([A-Za-z0-9._-]+)(?:\[[^\]]*\])?(?::\d+)?[,\s]").unwrap();
    static ref STATUS_RE: Regex = Regex::new(r"status=(sent|bounced|deferred|expired)").unwrap();
    static ref QUEUED_AS_RE: Regex = Regex::new(r"queued as ([0-9A-F]+)").unwrap();
}

/// Classify every record of one `(host, queue_id)` group.
///
/// `final_relays` names the relay tags that mark final delivery in addition
/// to the standard `local` transport.
pub fn extract(records: &[LogRecord], final_relays: &[String]) -> Vec<MailEvent> {
    records
        .iter()
        .map(|record| classify(record.clone(), final_relays))
        .collect()
}

fn classify(record: LogRecord, final_relays: &[String]) -> MailEvent {
    let message = record.message.clone();

    if let Some(caps) = CLIENT_RE.captures(&message) {
        return MailEvent {
            peer_host: Some(caps[1].to_string()),
            kind: MailEventKind::Connect,
            ..MailEvent::other(record)
        };
    }

    if let Some(caps) = MESSAGE_ID_RE.captures(&message) {
        return MailEvent {
            message_id: Some(caps[1].to_string()),
            kind: MailEventKind::Receive,
            ..MailEvent::other(record)
        };
    }

    let status = STATUS_RE.captures(&message).map(|caps| caps[1].to_string());
    let relay = RELAY_RE.captures(&message).map(|caps| caps[1].to_string());

    match (relay, status) {
        (Some(relay), Some(status)) if status == "sent" => {
            let terminal = relay == "local" || final_relays.iter().any(|r| *r == relay);
            MailEvent {
                kind: if terminal { MailEventKind::Deliver } else { MailEventKind::Forward },
                next_host: Some(relay),
                peer_queue_id: QUEUED_AS_RE.captures(&message).map(|caps| caps[1].to_string()),
                status: Some(status),
                ..MailEvent::other(record)
            }
        }
        (relay, Some(status)) if status != "sent" => MailEvent {
            kind: MailEventKind::Deliver,
            next_host: relay,
            status: Some(status),
            ..MailEvent::other(record)
        },
        // relay without a status, or neither: nothing to act on
        _ => MailEvent::other(record),
    }
}

#[cfg(test)]
mod test_extract {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn record(message: &str) -> LogRecord {
        LogRecord {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            host: "mx.example.com".to_string(),
            service: "postfix/smtp".to_string(),
            queue_id: Some("ABC123".to_string()),
            message: message.to_string(),
        }
    }

    fn classify_one(message: &str) -> MailEvent {
        classify(record(message), &[])
    }

    #[test]
    fn connect() {
        let event = classify_one("ABC123: client=mail.example.org[192.0.2.4]");
        assert_eq!(event.kind, MailEventKind::Connect);
        assert_eq!(event.peer_host.as_deref(), Some("mail.example.org"));
    }

    #[test]
    fn receive_strips_angle_brackets() {
        let event = classify_one("ABC123: message-id=<20240301.x@y.example>");
        assert_eq!(event.kind, MailEventKind::Receive);
        assert_eq!(event.message_id.as_deref(), Some("20240301.x@y.example"));

        let bare = classify_one("ABC123: message-id=20240301.x@y.example");
        assert_eq!(bare.message_id.as_deref(), Some("20240301.x@y.example"));
    }

    #[test]
    fn forward_with_peer_queue_id() {
        let event = classify_one(
            "ABC123: to=<u@v>, relay=mailer.example.com[10.0.0.2]:25, delay=0.5, \
             status=sent (250 2.0.0 Ok: queued as DEF456)",
        );
        assert_eq!(event.kind, MailEventKind::Forward);
        assert_eq!(event.next_host.as_deref(), Some("mailer.example.com"));
        assert_eq!(event.peer_queue_id.as_deref(), Some("DEF456"));
        assert_eq!(event.status.as_deref(), Some("sent"));
    }

    #[test]
    fn local_relay_is_delivery() {
        let event = classify_one("ABC123: to=<u@v>, relay=local, delay=0.1, status=sent (delivered to mailbox)");
        assert_eq!(event.kind, MailEventKind::Deliver);
    }

    #[test]
    fn configured_final_relay_is_delivery() {
        let event = classify(
            record("ABC123: to=<u@v>, relay=dovecot, delay=0.1, status=sent (delivered)"),
            &["dovecot".to_string()],
        );
        assert_eq!(event.kind, MailEventKind::Deliver);
    }

    #[test]
    fn bounce_and_deferral_are_terminal() {
        let bounced = classify_one(
            "ABC123: to=<u@v>, relay=mailer.example.com[10.0.0.2]:25, status=bounced (user unknown)",
        );
        assert_eq!(bounced.kind, MailEventKind::Deliver);
        assert_eq!(bounced.status.as_deref(), Some("bounced"));

        let deferred = classify_one("ABC123: status=deferred (connection timed out)");
        assert_eq!(deferred.kind, MailEventKind::Deliver);
        assert_eq!(deferred.status.as_deref(), Some("deferred"));
    }

    #[test]
    fn unrecognized_and_partial_shapes_are_other() {
        assert_eq!(classify_one("ABC123: removed").kind, MailEventKind::Other);
        // relay without a status is a recognized shape with missing fields
        assert_eq!(
            classify_one("ABC123: relay=mailer.example.com[10.0.0.2]:25, dsn=4.0.0").kind,
            MailEventKind::Other
        );
    }
}
