//! Allocation Pool
//!
//! Spreads the replicas of one workload over the ready nodes. The pool is
//! a sequence of levels where level `k` holds the nodes currently hosting
//! exactly `k` replicas of the workload. It is rebuilt for every reconcile
//! pass from the live pods and thrown away afterwards.

use std::collections::BTreeMap;

// =============================================================================
// Placement
// =============================================================================

/// Outcome of placing one replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    /// Node the replica is pinned to
    pub node: String,
    /// The node came from the workload's placement history
    pub reused: bool,
}

// =============================================================================
// Allocation Pool
// =============================================================================

/// Level-indexed node pool
#[derive(Debug, Clone, Default)]
pub struct AllocationPool {
    levels: Vec<Vec<String>>,
}

impl AllocationPool {
    /// Create a pool where every node hosts nothing yet.
    ///
    /// Nodes are picked in the order given.
    pub fn new<S: AsRef<str>>(ready_nodes: &[S]) -> Self {
        let level0: Vec<String> = ready_nodes
            .iter()
            .rev()
            .map(|n| n.as_ref().to_string())
            .collect();
        Self {
            levels: vec![level0],
        }
    }

    /// Number of nodes in the pool
    pub fn node_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    /// Whether the pool holds no node at all
    pub fn is_empty(&self) -> bool {
        self.node_count() == 0
    }

    /// Level the node currently sits on
    pub fn level_of(&self, node: &str) -> Option<usize> {
        self.levels
            .iter()
            .position(|level| level.iter().any(|n| n == node))
    }

    /// Replica count per node
    pub fn load(&self) -> BTreeMap<String, usize> {
        let mut load = BTreeMap::new();
        for (k, level) in self.levels.iter().enumerate() {
            for node in level {
                load.insert(node.clone(), k);
            }
        }
        load
    }

    /// Account one more replica on `node`.
    ///
    /// Returns false when the node is not part of the pool (not ready,
    /// or unknown), in which case nothing changes.
    pub fn bump(&mut self, node: &str) -> bool {
        let Some(level) = self.level_of(node) else {
            return false;
        };
        if let Some(pos) = self.levels[level].iter().position(|n| n == node) {
            let name = self.levels[level].remove(pos);
            self.promote(level, name);
            return true;
        }
        false
    }

    /// Give back one replica accounted on `node`.
    ///
    /// Returns false when the node is not part of the pool or hosts
    /// nothing, in which case nothing changes.
    pub fn release(&mut self, node: &str) -> bool {
        let Some(level) = self.level_of(node).filter(|&k| k > 0) else {
            return false;
        };
        let Some(pos) = self.levels[level].iter().position(|n| n == node) else {
            return false;
        };
        let name = self.levels[level].remove(pos);
        // Back at the picking end, where pick() took it from
        self.levels[level - 1].push(name);
        true
    }

    /// Take a node from the least loaded level.
    ///
    /// Returns `None` when the pool has no node left.
    pub fn pick(&mut self) -> Option<String> {
        let level = self.levels.iter().position(|l| !l.is_empty())?;
        let name = self.levels[level].pop()?;
        self.promote(level, name.clone());
        Some(name)
    }

    /// Place the replica `pod_name`.
    ///
    /// A node recorded for this exact pod wins over spreading so a
    /// recreated pod returns to its data. Otherwise the least loaded node
    /// is used.
    pub fn place(&mut self, pod_name: &str, recorded: Option<&str>) -> Option<Placement> {
        if let Some(node) = recorded.filter(|n| !n.is_empty()) {
            if !self.bump(node) {
                tracing::debug!(pod = %pod_name, node = %node, "Recorded node is not in the ready pool");
            }
            return Some(Placement {
                node: node.to_string(),
                reused: true,
            });
        }
        self.pick().map(|node| Placement {
            node,
            reused: false,
        })
    }

    fn promote(&mut self, from: usize, name: String) {
        let to = from + 1;
        if self.levels.len() <= to {
            self.levels.resize_with(to + 1, Vec::new);
        }
        // Oldest arrival sits last so each level is served round-robin
        self.levels[to].insert(0, name);
    }
}
