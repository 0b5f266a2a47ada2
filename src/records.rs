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
//! Module defining the parsed log record type shared by all layers.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// One parsed mail log line. Immutable once produced by a parser.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LogRecord {
    /// Absolute instant, already resolved to UTC.
    pub timestamp: DateTime<Utc>,
    /// The relay that emitted the line.
    pub host: String,
    /// The mail daemon subprogram, e.g. `postfix/smtp`.
    pub service: String,
    /// Queue id assigned by the daemon, if the line carries one.
    pub queue_id: Option<String>,
    /// Free-form text payload after the service tag.
    pub message: String,
}

impl LogRecord {
    /// Deduplication key used by the continuous pipeline when the same line
    /// is returned by overlapping query windows.
    pub fn dedup_key(&self) -> (DateTime<Utc>, String, String) {
        (self.timestamp, self.host.clone(), self.message.clone())
    }

    /// Render the record back into a canonical RFC 5424 shaped line. Parsing
    /// the result again yields an identical record.
    pub fn to_syslog(&self) -> String {
        format!(
            "{} {} {} - - - {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, false),
            self.host,
            self.service,
            self.message,
        )
    }
}

/// Group records by queue id, preserving the order in which each queue id
/// first appears. Records without a queue id are returned separately; they
/// only serve as context for message-id lookups.
pub fn group_by_queue(records: Vec<LogRecord>) -> (Vec<(String, Vec<LogRecord>)>, Vec<LogRecord>) {
    let mut groups: Vec<(String, Vec<LogRecord>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut loose = Vec::new();

    for record in records {
        match record.queue_id.clone() {
            Some(queue_id) => {
                let i = *index.entry(queue_id.clone()).or_insert_with(|| {
                    groups.push((queue_id, Vec::new()));
                    groups.len() - 1
                });
                groups[i].1.push(record);
            }
            None => loose.push(record),
        }
    }

    (groups, loose)
}
