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
//! Library for reconstructing the path a mail took across a fleet of SMTP
//! relays from their syslog-style mail logs.

pub mod aggregator;
pub mod config;
pub mod event;
pub mod graph;
pub mod otel;
pub mod parser;
pub mod pipeline;
pub mod records;
pub mod tracer;
pub mod util;

pub mod prelude {
    pub use super::{
        aggregator::{Aggregator, AggregatorError, Backend},
        config::Config,
        event::{MailEvent, MailEventKind},
        graph::{MailGraph, MailHop},
        records::LogRecord,
        tracer::Tracer,
        util::TimeWindow,
    };
}
