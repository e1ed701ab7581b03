//! Chooses which node serves the next attempt of a request.
//!
//! The selector owns the current [`Topology`], a health record per node and the outcome of the
//! one-time speed test. It performs no I/O; the request executor keeps it behind a short-held
//! lock and does all network work outside of it.

use std::collections::HashMap;

use tokio::time::{Duration, Instant};

use crate::{request_executor::NodeFailure, server_node::ServerNode, topology::Topology};

/// How long a failure keeps a node at the back of the failover order.
pub const NODE_FAILURE_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHealth {
    pub last_failure: Instant,
    pub consecutive_failures: u32,
}

impl NodeHealth {
    fn is_suspect(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_failure) < NODE_FAILURE_COOLDOWN
    }
}

/// Nodes that already failed during one `execute` call, in the order they failed.
#[derive(Debug, Clone, Default)]
pub struct FailedNodes {
    entries: Vec<(ServerNode, NodeFailure)>,
}

impl FailedNodes {
    pub fn contains(&self, node: &ServerNode) -> bool {
        self.entries.iter().any(|(n, _)| n == node)
    }

    pub fn insert(&mut self, node: ServerNode, failure: NodeFailure) {
        match self.entries.iter_mut().find(|(n, _)| *n == node) {
            Some(entry) => entry.1 = failure,
            None => self.entries.push((node, failure)),
        }
    }

    pub fn get(&self, node: &ServerNode) -> Option<&NodeFailure> {
        self.entries
            .iter()
            .find(|(n, _)| n == node)
            .map(|(_, failure)| failure)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(ServerNode, NodeFailure)> {
        self.entries.iter()
    }
}

impl std::fmt::Display for FailedNodes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (node, failure) in &self.entries {
            writeln!(f, "\t{} -> {}", node, failure)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct NodeSelector {
    /// Holds the topology
    topology: Topology,
    /// Set when topology updates are disabled. The single node is always returned.
    fixed: bool,
    /// Failure records, cleared by a successful response
    health: HashMap<ServerNode, NodeHealth>,
    /// Winner of the speed test, preferred over list order
    fastest: Option<ServerNode>,
    speed_test_started: bool,
}

impl NodeSelector {
    pub fn new(topology: Topology) -> Self {
        Self {
            topology,
            fixed: false,
            health: HashMap::new(),
            fastest: None,
            speed_test_started: false,
        }
    }

    /// Selector for a single node that never changes, used when topology updates are disabled.
    pub fn new_single_node(node: ServerNode) -> Self {
        Self {
            fixed: true,
            ..Self::new(Topology::single_node(node))
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn etag(&self) -> i64 {
        self.topology.etag
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    /// Replaces the topology if `topology` is strictly newer than the current one.
    ///
    /// Stale and empty topologies are dropped and `false` is returned, so concurrent refreshes
    /// can be applied in any order and the highest etag always wins.
    pub fn try_update_topology(&mut self, topology: Topology) -> bool {
        if self.fixed || topology.is_empty() || topology.etag <= self.topology.etag {
            return false;
        }

        self.health.retain(|node, _| topology.nodes.contains(node));
        if let Some(fastest) = &self.fastest {
            if !topology.nodes.contains(fastest) {
                self.fastest = None;
            }
        }
        self.topology = topology;
        true
    }

    /// Returns the node that should serve the next attempt, or `None` when every node of the
    /// topology already failed during this call.
    ///
    /// Order: the speed-test winner when `prefer_fastest` is set (read requests), then the
    /// nodes in topology order. Nodes that failed recently (in an earlier call) are kept but
    /// moved behind the healthy ones.
    pub fn pick(&self, failed_nodes: &FailedNodes, prefer_fastest: bool) -> Option<ServerNode> {
        if self.fixed {
            return self.topology.nodes.first().cloned();
        }

        let now = Instant::now();
        let fastest = self.fastest.as_ref().filter(|_| prefer_fastest);
        let candidates = fastest
            .into_iter()
            .chain(self.topology.nodes.iter().filter(|n| Some(*n) != fastest))
            .filter(|n| !failed_nodes.contains(n));

        let mut suspect = None;
        for node in candidates {
            match self.health.get(node) {
                Some(health) if health.is_suspect(now) => {
                    suspect.get_or_insert(node);
                }
                _ => return Some(node.clone()),
            }
        }
        suspect.cloned()
    }

    /// Records a failure. The node stays in the topology and may be tried by later calls.
    pub fn mark_failed(&mut self, node: &ServerNode) {
        let now = Instant::now();
        self.health
            .entry(node.clone())
            .and_modify(|h| {
                h.last_failure = now;
                h.consecutive_failures += 1;
            })
            .or_insert(NodeHealth {
                last_failure: now,
                consecutive_failures: 1,
            });
    }

    pub fn mark_succeeded(&mut self, node: &ServerNode) {
        self.health.remove(node);
    }

    pub fn health(&self, node: &ServerNode) -> Option<NodeHealth> {
        self.health.get(node).copied()
    }

    pub fn fastest(&self) -> Option<&ServerNode> {
        self.fastest.as_ref()
    }

    /// Claims the one-time speed test if the topology has more than one node and no test ran
    /// yet. Returns the nodes to probe.
    pub fn begin_speed_test(&mut self) -> Option<Vec<ServerNode>> {
        if self.fixed || self.speed_test_started || self.topology.nodes.len() < 2 {
            return None;
        }
        self.speed_test_started = true;
        Some(self.topology.nodes.clone())
    }

    pub fn record_speed_test(&mut self, winner: Option<ServerNode>) {
        match winner {
            Some(node) if self.topology.nodes.contains(&node) => {
                tracing::debug!("Speed test winner: {}", &node);
                self.fastest = Some(node);
            }
            Some(node) => {
                tracing::debug!("Speed test winner {} left the topology, ignoring", node);
            }
            None => tracing::debug!("Speed test found no responsive node"),
        }
    }
}
