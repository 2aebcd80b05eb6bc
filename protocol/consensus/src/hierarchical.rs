//! Reputation-based hierarchical consensus.
//!
//! Nodes are split into clusters once at startup. The highest-reputation
//! member of each cluster leads it, and the highest-reputation leader is the
//! super node. Only leaders mine; a leader's block is committed when enough
//! of the other leaders vote for it. Rewards, penalties and decay move
//! reputation, and leadership is re-elected after every change.

use crate::mining::run_search;
use crate::pow::job_for;
use crate::voting::{collect_votes, inter_cluster_threshold};
use crate::{
    check_hash, check_link, check_work, CancelSignal, ChainTip, ClusterAssignment, ConsensusEngine,
    ConsensusError, ConsensusNetwork, EngineContext, Leadership, Proposal, SearchOutcome, Selection,
};
use async_trait::async_trait;
use runtime::{Block, BlockMetrics, Chain, ConsensusKind, Timestamp};
use state::{generate_node_properties, NodeId, NodeProperties, ReputationTable};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct Hierarchical {
    node_id: NodeId,
    difficulty: u32,
    reward: f64,
    penalty: f64,
    decay_rate: f64,
    max_attempts: Option<u64>,
    vote_timeout: Duration,
    reputation: ReputationTable,
    network: Arc<dyn ConsensusNetwork>,
    signal: Arc<CancelSignal>,
    properties: BTreeMap<NodeId, NodeProperties>,
    clusters: ClusterAssignment,
    leadership: Mutex<Leadership>,
}

impl Hierarchical {
    pub fn new(ctx: EngineContext) -> Self {
        let ids = ctx.reputation.node_ids();
        let properties = generate_node_properties(&ids, ctx.params.cluster_seed);
        let clusters = ClusterAssignment::form(&properties, ctx.params.cluster_count);
        let leadership = Leadership::elect(&clusters, &ctx.reputation.snapshot());
        info!(
            node = %ctx.node_id,
            clusters = clusters.clusters().len(),
            leaders = ?leadership.leaders(),
            super_node = ?leadership.super_node,
            "clusters formed"
        );
        Self {
            node_id: ctx.node_id,
            difficulty: ctx.params.difficulty,
            reward: ctx.params.reward,
            penalty: ctx.params.penalty,
            decay_rate: ctx.params.decay_rate,
            max_attempts: ctx.params.max_attempts,
            vote_timeout: Duration::from_millis(ctx.params.vote_timeout_ms),
            reputation: ctx.reputation,
            network: ctx.network,
            signal: Arc::new(CancelSignal::new()),
            properties,
            clusters,
            leadership: Mutex::new(leadership),
        }
    }

    pub fn clusters(&self) -> &ClusterAssignment {
        &self.clusters
    }

    pub fn properties(&self) -> &BTreeMap<NodeId, NodeProperties> {
        &self.properties
    }

    pub fn leadership(&self) -> Leadership {
        self.leadership.lock().unwrap().clone()
    }

    pub fn signal(&self) -> Arc<CancelSignal> {
        self.signal.clone()
    }

    fn reelect(&self) {
        let next = Leadership::elect(&self.clusters, &self.reputation.snapshot());
        let mut current = self.leadership.lock().unwrap();
        if *current != next {
            info!(leaders = ?next.leaders(), super_node = ?next.super_node, "leadership changed");
        }
        *current = next;
    }
}

#[async_trait]
impl ConsensusEngine for Hierarchical {
    fn kind(&self) -> ConsensusKind {
        ConsensusKind::Hierarchical
    }

    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn select(&self, proposal: Proposal, tip: ChainTip) -> Result<Selection, ConsensusError> {
        let Some(cluster) = self.clusters.cluster_of(&self.node_id) else {
            warn!(node = %self.node_id, "node is not in any cluster");
            return Ok(Selection::NotSelected { winner: None });
        };
        let (leader, leaders) = {
            let leadership = self.leadership.lock().unwrap();
            (leadership.leader_of(cluster).cloned(), leadership.leaders())
        };
        if leader.as_deref() != Some(self.node_id.as_str()) {
            return Ok(Selection::NotSelected { winner: leader });
        }

        self.signal.reset();
        let job = job_for(proposal, &tip, self.difficulty, self.max_attempts);
        let block = match run_search(job, self.signal.clone()).await? {
            SearchOutcome::Found(block) => block,
            SearchOutcome::Cancelled => return Ok(Selection::Cancelled),
            SearchOutcome::Exhausted(attempts) => {
                return Err(ConsensusError::SearchExhausted(attempts))
            }
        };
        self.network
            .announce_selection(&self.node_id, block.timestamp)
            .await;
        let candidate = block.fields();

        let members: Vec<NodeId> = self
            .clusters
            .members(cluster)
            .iter()
            .filter(|m| **m != self.node_id)
            .cloned()
            .collect();
        if !members.is_empty() {
            let tally = collect_votes(
                self.network.as_ref(),
                &members,
                &candidate,
                self.vote_timeout,
            )
            .await;
            // Advisory only; the leader speaks for its cluster.
            debug!(cluster, yes = tally.yes, no = tally.no, "intra-cluster votes");
        }

        let others: Vec<NodeId> = leaders
            .iter()
            .filter(|l| **l != self.node_id)
            .cloned()
            .collect();
        let required = inter_cluster_threshold(leaders.len());
        let tally =
            collect_votes(self.network.as_ref(), &others, &candidate, self.vote_timeout).await;
        info!(yes = tally.yes, no = tally.no, required, "inter-cluster votes");
        if tally.yes < required {
            return Err(ConsensusError::InsufficientVotes {
                yes: tally.yes,
                required,
            });
        }
        Ok(Selection::Won {
            block,
            proposer: self.node_id.clone(),
        })
    }

    fn check(&self, chain: &Chain, block: &Block) -> Result<(), ConsensusError> {
        check_hash(block)?;
        check_work(block, self.difficulty)?;
        check_link(chain, block)
    }

    fn validate(&self, chain: &Chain, block: &Block, proposer: &str) -> Result<(), ConsensusError> {
        let result = self.check(chain, block);
        match &result {
            Ok(()) => {
                self.reputation.reward(proposer, self.reward);
            }
            Err(err) => {
                warn!(proposer, error = %err, "block rejected");
                self.reputation.penalize(proposer, self.penalty);
            }
        }
        self.reelect();
        result
    }

    fn commit(&self, chain: &mut Chain, block: Block) -> BlockMetrics {
        let sample = chain.append(block, Some(self.difficulty));
        self.reputation.decay(self.decay_rate);
        self.reelect();
        sample
    }

    fn cancel(&self, remote_found_at: Timestamp) -> bool {
        self.signal.try_abort(remote_found_at)
    }

    fn difficulty(&self) -> Option<u32> {
        Some(self.difficulty)
    }
}
