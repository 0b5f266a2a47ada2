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
//! The directed multigraph of mail hops accumulated by the tracer.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// One host-to-host handoff. The queue id is the one used on `from_host`
/// when handing the mail to `to_host`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct MailHop {
    pub from_host: String,
    pub to_host: String,
    pub queue_id: String,
}

/// Directed multigraph over host names. Nodes are recorded in order of first
/// mention, edges in insertion order; a hop equal to an existing one on all
/// three fields is suppressed.
#[derive(Debug, Clone, Default)]
pub struct MailGraph {
    nodes: Vec<String>,
    node_set: HashSet<String>,
    hops: Vec<MailHop>,
    hop_set: HashSet<MailHop>,
}

impl MailGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, host: impl Into<String>) {
        let host = host.into();
        if self.node_set.insert(host.clone()) {
            self.nodes.push(host);
        }
    }

    /// Insert a hop, registering both endpoints as nodes. Duplicate hops are
    /// ignored.
    pub fn add_hop(&mut self, from_host: &str, to_host: &str, queue_id: &str) {
        self.add_node(from_host);
        self.add_node(to_host);
        let hop = MailHop {
            from_host: from_host.to_string(),
            to_host: to_host.to_string(),
            queue_id: queue_id.to_string(),
        };
        if self.hop_set.insert(hop.clone()) {
            self.hops.push(hop);
        }
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn hops(&self) -> &[MailHop] {
        &self.hops
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Serialize to Graphviz DOT. The shape is fixed: nodes in order of
    /// first mention, then edges in insertion order with a monotonically
    /// increasing `key` starting at 0.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph {\n");
        for node in &self.nodes {
            out.push_str(node);
            out.push_str(";\n");
        }
        for (key, hop) in self.hops.iter().enumerate() {
            out.push_str(&format!(
                "{} -> {} [key={}, label={}];\n",
                hop.from_host, hop.to_host, key, hop.queue_id
            ));
        }
        out.push_str("}\n");
        out
    }
}

impl fmt::Display for MailGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return writeln!(f, "no mail flow found");
        }
        writeln!(f, "hosts: {}", self.nodes.join(", "))?;
        for hop in &self.hops {
            writeln!(f, "{} -> {} ({})", hop.from_host, hop.to_host, hop.queue_id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test_graph {
    use super::*;

    #[test]
    fn duplicate_hops_are_suppressed() {
        let mut graph = MailGraph::new();
        graph.add_hop("A", "B", "Q1");
        graph.add_hop("A", "C", "Q2");
        graph.add_hop("A", "B", "Q1");
        assert_eq!(graph.hops().len(), 2);
        assert_eq!(graph.nodes(), &["A", "B", "C"]);
    }

    #[test]
    fn parallel_edges_with_distinct_queue_ids_survive() {
        let mut graph = MailGraph::new();
        graph.add_hop("A", "B", "Q1");
        graph.add_hop("A", "B", "Q2");
        assert_eq!(graph.hops().len(), 2);
    }

    #[test]
    fn dot_output_shape() {
        let mut graph = MailGraph::new();
        graph.add_hop("A", "B", "Q1");
        graph.add_hop("A", "C", "Q2");
        graph.add_hop("A", "B", "Q1");
        assert_eq!(
            graph.to_dot(),
            "digraph {\n\
             A;\n\
             B;\n\
             C;\n\
             A -> B [key=0, label=Q1];\n\
             A -> C [key=1, label=Q2];\n\
             }\n"
        );
    }

    #[test]
    fn dot_is_deterministic() {
        let build = || {
            let mut graph = MailGraph::new();
            graph.add_hop("mx.example.com", "mailer.example.com", "ABC123");
            graph.add_node("spare.example.com");
            graph.to_dot()
        };
        assert_eq!(build(), build());
    }
}
