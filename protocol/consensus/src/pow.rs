use crate::mining::run_search;
use crate::{
    check_hash, check_link, check_work, CancelSignal, ChainTip, ConsensusEngine, ConsensusError,
    ConsensusNetwork, EngineContext, Proposal, SearchJob, SearchOutcome, Selection,
};
use async_trait::async_trait;
use rand::Rng;
use runtime::{Block, BlockFields, BlockMetrics, Chain, ConsensusKind, Timestamp};
use state::{NodeId, ReputationTable};
use std::sync::Arc;
use tracing::{info, warn};

/// Every node races for a hash with `difficulty` leading zeros. The first
/// to find one announces it and the others stop.
pub struct ProofOfWork {
    node_id: NodeId,
    difficulty: u32,
    reward: f64,
    penalty: f64,
    max_attempts: Option<u64>,
    reputation: ReputationTable,
    network: Arc<dyn ConsensusNetwork>,
    signal: Arc<CancelSignal>,
}

impl ProofOfWork {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            node_id: ctx.node_id,
            difficulty: ctx.params.difficulty,
            reward: ctx.params.reward,
            penalty: ctx.params.penalty,
            max_attempts: ctx.params.max_attempts,
            reputation: ctx.reputation,
            network: ctx.network,
            signal: Arc::new(CancelSignal::new()),
        }
    }

    pub fn signal(&self) -> Arc<CancelSignal> {
        self.signal.clone()
    }
}

pub(crate) fn job_for(
    proposal: Proposal,
    tip: &ChainTip,
    difficulty: u32,
    max_attempts: Option<u64>,
) -> SearchJob {
    SearchJob {
        template: BlockFields {
            user_id: proposal.user_id,
            previous_hash: tip.block.hash.clone(),
            transaction: proposal.transaction,
            commitment: proposal.commitment,
            timestamp: 0.0,
            nonce: 0,
            validator: None,
        },
        difficulty,
        start_nonce: rand::thread_rng().gen_range(0..10_000_000),
        max_attempts,
    }
}

#[async_trait]
impl ConsensusEngine for ProofOfWork {
    fn kind(&self) -> ConsensusKind {
        ConsensusKind::ProofOfWork
    }

    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn select(&self, proposal: Proposal, tip: ChainTip) -> Result<Selection, ConsensusError> {
        self.signal.reset();
        let job = job_for(proposal, &tip, self.difficulty, self.max_attempts);
        match run_search(job, self.signal.clone()).await? {
            SearchOutcome::Found(block) => {
                info!(node = %self.node_id, hash = %block.hash, nonce = block.nonce, "proof of work found");
                self.network
                    .announce_selection(&self.node_id, block.timestamp)
                    .await;
                Ok(Selection::Won {
                    block,
                    proposer: self.node_id.clone(),
                })
            }
            SearchOutcome::Cancelled => {
                info!(node = %self.node_id, "search cancelled by an earlier peer");
                Ok(Selection::Cancelled)
            }
            SearchOutcome::Exhausted(attempts) => Err(ConsensusError::SearchExhausted(attempts)),
        }
    }

    fn check(&self, chain: &Chain, block: &Block) -> Result<(), ConsensusError> {
        check_hash(block)?;
        check_work(block, self.difficulty)?;
        check_link(chain, block)
    }

    fn validate(&self, chain: &Chain, block: &Block, proposer: &str) -> Result<(), ConsensusError> {
        match self.check(chain, block) {
            Ok(()) => {
                self.reputation.reward(proposer, self.reward);
                Ok(())
            }
            Err(err) => {
                warn!(proposer, error = %err, "proof of work rejected");
                self.reputation.penalize(proposer, self.penalty);
                Err(err)
            }
        }
    }

    fn commit(&self, chain: &mut Chain, block: Block) -> BlockMetrics {
        chain.append(block, Some(self.difficulty))
    }

    fn cancel(&self, remote_found_at: Timestamp) -> bool {
        self.signal.try_abort(remote_found_at)
    }

    fn difficulty(&self) -> Option<u32> {
        Some(self.difficulty)
    }
}
