//! Grouping nodes into clusters and electing a leader per cluster.

use serde::Serialize;
use state::{NodeId, NodeProperties};
use std::cmp::Ordering;
use std::collections::BTreeMap;

pub type ClusterId = usize;

/// Fixed for the lifetime of a node; only leadership moves.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClusterAssignment {
    clusters: Vec<Vec<NodeId>>,
}

impl ClusterAssignment {
    /// Sort by network proximity (ties by id) and cut into `count` slices of
    /// `len / count` nodes. The last slice absorbs the remainder, so with
    /// fewer nodes than clusters the leading slices are empty.
    pub fn form(properties: &BTreeMap<NodeId, NodeProperties>, count: usize) -> Self {
        if count == 0 {
            return Self::default();
        }
        let mut sorted: Vec<(&NodeId, &NodeProperties)> = properties.iter().collect();
        sorted.sort_by(|a, b| {
            a.1.network_proximity
                .partial_cmp(&b.1.network_proximity)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });
        let ids: Vec<NodeId> = sorted.into_iter().map(|(id, _)| id.clone()).collect();
        let size = ids.len() / count;
        let clusters = (0..count)
            .map(|i| {
                let start = i * size;
                let end = if i + 1 == count { ids.len() } else { start + size };
                ids[start..end].to_vec()
            })
            .collect();
        Self { clusters }
    }

    pub fn clusters(&self) -> &[Vec<NodeId>] {
        &self.clusters
    }

    pub fn members(&self, cluster: ClusterId) -> &[NodeId] {
        self.clusters.get(cluster).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn cluster_of(&self, node: &str) -> Option<ClusterId> {
        self.clusters
            .iter()
            .position(|members| members.iter().any(|m| m == node))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Leadership {
    pub leaders: BTreeMap<ClusterId, NodeId>,
    pub super_node: Option<NodeId>,
}

impl Leadership {
    /// Highest reputation wins, smallest id breaks ties. Empty clusters get
    /// no leader.
    pub fn elect(assignment: &ClusterAssignment, scores: &BTreeMap<NodeId, f64>) -> Self {
        let leaders: BTreeMap<ClusterId, NodeId> = assignment
            .clusters()
            .iter()
            .enumerate()
            .filter_map(|(id, members)| best_of(members.iter(), scores).map(|l| (id, l)))
            .collect();
        let super_node = best_of(leaders.values(), scores);
        Self { leaders, super_node }
    }

    pub fn leader_of(&self, cluster: ClusterId) -> Option<&NodeId> {
        self.leaders.get(&cluster)
    }

    /// Leaders in cluster order.
    pub fn leaders(&self) -> Vec<NodeId> {
        self.leaders.values().cloned().collect()
    }

    pub fn is_leader(&self, node: &str) -> bool {
        self.leaders.values().any(|l| l == node)
    }
}

fn best_of<'a>(
    candidates: impl Iterator<Item = &'a NodeId>,
    scores: &BTreeMap<NodeId, f64>,
) -> Option<NodeId> {
    let mut best: Option<(&NodeId, f64)> = None;
    for id in candidates {
        let score = scores.get(id).copied().unwrap_or(0.0);
        best = match best {
            Some((best_id, best_score))
                if best_score > score || (best_score == score && best_id <= id) =>
            {
                Some((best_id, best_score))
            }
            _ => Some((id, score)),
        };
    }
    best.map(|(id, _)| id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(entries: &[(&str, f64)]) -> BTreeMap<NodeId, NodeProperties> {
        entries
            .iter()
            .map(|(id, proximity)| {
                (
                    id.to_string(),
                    NodeProperties {
                        uptime: 0.95,
                        network_proximity: *proximity,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn remainder_lands_in_last_cluster() {
        let properties = props(&[
            ("a", 0.1),
            ("b", 0.9),
            ("c", 0.3),
            ("d", 0.5),
            ("e", 0.7),
            ("f", 0.2),
            ("g", 0.8),
        ]);
        let assignment = ClusterAssignment::form(&properties, 3);
        let sizes: Vec<usize> = assignment.clusters().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 3]);
        assert_eq!(assignment.members(0), ["a".to_string(), "f".to_string()]);
        assert_eq!(assignment.cluster_of("b"), Some(2));
    }

    #[test]
    fn fewer_nodes_than_clusters_leaves_leading_clusters_empty() {
        let properties = props(&[("a", 0.4), ("b", 0.2)]);
        let assignment = ClusterAssignment::form(&properties, 3);
        assert!(assignment.members(0).is_empty());
        assert!(assignment.members(1).is_empty());
        assert_eq!(assignment.members(2).len(), 2);

        let scores = BTreeMap::from([("a".to_string(), 1.0), ("b".to_string(), 2.0)]);
        let leadership = Leadership::elect(&assignment, &scores);
        assert_eq!(leadership.leader_of(0), None);
        assert_eq!(leadership.leader_of(2).map(String::as_str), Some("b"));
        assert_eq!(leadership.super_node.as_deref(), Some("b"));
    }

    #[test]
    fn ties_go_to_smallest_id() {
        let properties = props(&[("n2", 0.1), ("n1", 0.2), ("n3", 0.3)]);
        let assignment = ClusterAssignment::form(&properties, 1);
        let scores = BTreeMap::from([
            ("n1".to_string(), 70.0),
            ("n2".to_string(), 70.0),
            ("n3".to_string(), 10.0),
        ]);
        let leadership = Leadership::elect(&assignment, &scores);
        assert_eq!(leadership.leader_of(0).map(String::as_str), Some("n1"));
        assert!(leadership.is_leader("n1"));
        assert!(!leadership.is_leader("n2"));
    }
}
