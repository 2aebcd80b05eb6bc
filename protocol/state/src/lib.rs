use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

pub type NodeId = String;

/// Node id -> score. Cloning shares the underlying table, so the selection
/// worker and request handlers see the same scores.
///
/// Scores are never floored: enough penalties drive a score negative.
#[derive(Clone, Default, Debug)]
pub struct ReputationTable {
    inner: Arc<Mutex<BTreeMap<NodeId, f64>>>,
}

impl ReputationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uniform<I, S>(nodes: I, score: f64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        let scores = nodes.into_iter().map(|n| (n.into(), score)).collect();
        Self {
            inner: Arc::new(Mutex::new(scores)),
        }
    }

    /// Scores drawn from `[low, high)` with a seeded generator over the
    /// sorted ids, so nodes sharing a seed and a peer set agree.
    pub fn seeded<I, S>(nodes: I, seed: u64, (low, high): (f64, f64)) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        let ids: std::collections::BTreeSet<NodeId> = nodes.into_iter().map(Into::into).collect();
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let scores = ids
            .into_iter()
            .map(|id| {
                let score = if high > low { rng.gen_range(low..high) } else { low };
                (id, score)
            })
            .collect();
        Self {
            inner: Arc::new(Mutex::new(scores)),
        }
    }

    pub fn score(&self, node: &str) -> Option<f64> {
        self.inner.lock().unwrap().get(node).copied()
    }

    pub fn contains(&self, node: &str) -> bool {
        self.inner.lock().unwrap().contains_key(node)
    }

    /// Ids in ascending order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.inner.lock().unwrap().keys().cloned().collect()
    }

    pub fn snapshot(&self) -> BTreeMap<NodeId, f64> {
        self.inner.lock().unwrap().clone()
    }

    pub fn insert(&self, node: impl Into<NodeId>, score: f64) {
        self.inner.lock().unwrap().insert(node.into(), score);
    }

    /// Returns false when the node is unknown.
    pub fn reward(&self, node: &str, amount: f64) -> bool {
        self.adjust(node, amount)
    }

    pub fn penalize(&self, node: &str, amount: f64) -> bool {
        self.adjust(node, -amount)
    }

    fn adjust(&self, node: &str, delta: f64) -> bool {
        let mut guard = self.inner.lock().unwrap();
        match guard.get_mut(node) {
            Some(score) => {
                *score += delta;
                debug!(node, delta, score = *score, "reputation adjusted");
                true
            }
            None => {
                warn!(node, "reputation change for unknown node ignored");
                false
            }
        }
    }

    /// `score *= 1 - rate` for every node.
    pub fn decay(&self, rate: f64) {
        let mut guard = self.inner.lock().unwrap();
        for score in guard.values_mut() {
            *score *= 1.0 - rate;
        }
    }
}

/// Synthetic per-node properties used to group nodes into clusters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodeProperties {
    pub uptime: f64,
    pub network_proximity: f64,
}

/// Generated once at startup. Ids are visited in sorted order so the same
/// seed yields the same properties on every node.
pub fn generate_node_properties(nodes: &[NodeId], seed: u64) -> BTreeMap<NodeId, NodeProperties> {
    let mut sorted: Vec<&NodeId> = nodes.iter().collect();
    sorted.sort();
    sorted.dedup();
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    sorted
        .into_iter()
        .map(|id| {
            let props = NodeProperties {
                uptime: rng.gen_range(0.9..1.0),
                network_proximity: rng.gen_range(0.0..1.0),
            };
            (id.clone(), props)
        })
        .collect()
}
