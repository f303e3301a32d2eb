//! The directed multigraph of host-to-host mail handoffs.

use std::collections::HashSet;
use std::fmt::Write as _;

/// One handoff edge. The queue id is the one used on `from_host` while
/// handing the message to `to_host`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MailHop {
    pub from_host: String,
    pub to_host: String,
    pub queue_id: String,
}

/// Insertion-ordered edge set over host-name nodes. Duplicate hops
/// (same from, to, and queue id) are suppressed.
#[derive(Debug, Default)]
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

    pub fn add_node(&mut self, host: &str) {
        if self.node_set.insert(host.to_string()) {
            self.nodes.push(host.to_string());
        }
    }

    /// Returns false when the identical hop was already present.
    pub fn add_hop(&mut self, from_host: &str, to_host: &str, queue_id: &str) -> bool {
        let hop = MailHop {
            from_host: from_host.to_string(),
            to_host: to_host.to_string(),
            queue_id: queue_id.to_string(),
        };
        if !self.hop_set.insert(hop.clone()) {
            return false;
        }
        self.add_node(from_host);
        self.add_node(to_host);
        self.hops.push(hop);
        true
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn hops(&self) -> &[MailHop] {
        &self.hops
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.hops.is_empty()
    }

    /// Render as Graphviz DOT. Nodes appear in order of first mention
    /// and edges in insertion order, each edge labelled with its queue
    /// id and keyed by a counter starting at zero.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph {\n");
        for node in &self.nodes {
            let _ = writeln!(out, "{node};");
        }
        for (key, hop) in self.hops.iter().enumerate() {
            let _ = writeln!(
                out,
                "{} -> {} [key={key}, label={}];",
                hop.from_host, hop.to_host, hop.queue_id
            );
        }
        out.push_str("}\n");
        out
    }
}
