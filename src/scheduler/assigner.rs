use std::collections::{BTreeMap, HashSet};

use crate::config::NodeSpec;
use crate::scheduler::job::{JobRequest, Placement};

/// Node state tracking
#[derive(Debug, Clone)]
pub struct NodeState {
    pub spec: NodeSpec,
    pub failed: bool,
    pub running_jobs: HashSet<u64>,
}

impl NodeState {
    pub fn new(spec: NodeSpec) -> Self {
        Self {
            spec,
            failed: false,
            running_jobs: HashSet::new(),
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.failed
    }
}

/// Places job ranks on cluster nodes.
#[derive(Debug, Default)]
pub struct NodeAssigner {
    nodes: BTreeMap<String, NodeState>,
}

impl NodeAssigner {
    pub fn new(nodes: impl IntoIterator<Item = NodeSpec>) -> Self {
        let mut assigner = Self::default();
        for spec in nodes {
            assigner.register_node(spec);
        }
        assigner
    }

    pub fn register_node(&mut self, spec: NodeSpec) {
        tracing::info!(node = %spec.name, host = %spec.host, cores = spec.cores, "Node registered");
        self.nodes.insert(spec.name.clone(), NodeState::new(spec));
    }

    /// Names of nodes that have not failed.
    pub fn available_nodes(&self) -> Vec<&str> {
        self.nodes
            .values()
            .filter(|n| n.is_alive())
            .map(|n| n.spec.name.as_str())
            .collect()
    }

    /// Places the `request.procs` ranks of job `number` on the least loaded
    /// live nodes. Rank `r` goes to the `r mod n`th chosen node, where `n`
    /// is the requested node count capped at the process count. Returns
    /// `None` when fewer than `n` live nodes exist.
    pub fn assign(&mut self, number: u64, request: &JobRequest) -> Option<Vec<Placement>> {
        let wanted = request.nodes.min(request.procs).max(1) as usize;
        let mut live: Vec<&NodeState> = self.nodes.values().filter(|n| n.is_alive()).collect();
        if live.len() < wanted {
            return None;
        }
        // Stable sort keeps name order among equally loaded nodes.
        live.sort_by_key(|n| n.running_jobs.len());
        let chosen: Vec<NodeSpec> = live.into_iter().take(wanted).map(|n| n.spec.clone()).collect();

        let placements: Vec<Placement> = (0..request.procs)
            .map(|rank| {
                let slot = rank as usize % wanted;
                let node = &chosen[slot];
                let ranks_here = (request.procs as usize - slot).div_ceil(wanted) as u32;
                let threads = if request.threads > 0 {
                    request.threads
                } else {
                    (node.cores / ranks_here).max(1)
                };
                Placement {
                    rank,
                    node: node.name.clone(),
                    host: node.host.clone(),
                    threads,
                }
            })
            .collect();

        for node in &chosen {
            if let Some(state) = self.nodes.get_mut(&node.name) {
                state.running_jobs.insert(number);
            }
        }
        tracing::info!(job = number, nodes = wanted, procs = request.procs, "Job placed");
        Some(placements)
    }

    /// Frees every node held by job `number`.
    pub fn release(&mut self, number: u64) {
        for node in self.nodes.values_mut() {
            node.running_jobs.remove(&number);
        }
    }

    /// Excludes a node from later placements. Returns false for unknown names.
    pub fn mark_failed(&mut self, name: &str) -> bool {
        match self.nodes.get_mut(name) {
            Some(node) => {
                if !node.failed {
                    tracing::warn!(node = %name, "Node marked failed");
                }
                node.failed = true;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<&NodeState> {
        self.nodes.get(name)
    }

    pub fn all_nodes(&self) -> Vec<&NodeState> {
        self.nodes.values().collect()
    }
}
