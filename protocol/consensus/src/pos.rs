use crate::{
    check_hash, check_link, ChainTip, ConsensusEngine, ConsensusError, EngineContext, Proposal,
    Selection,
};
use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use runtime::{now_secs, Block, BlockFields, BlockMetrics, Chain, ConsensusKind};
use sha2::{Digest, Sha256};
use state::{NodeId, ReputationTable};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Weighted draw over reputation, seeded from the tail hash so every node
/// with the same scores picks the same validator.
pub struct ProofOfStake {
    node_id: NodeId,
    reward: f64,
    penalty: f64,
    reputation: ReputationTable,
}

impl ProofOfStake {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            node_id: ctx.node_id,
            reward: ctx.params.reward,
            penalty: ctx.params.penalty,
            reputation: ctx.reputation,
        }
    }
}

/// Negative scores weigh nothing. `None` when no node has positive weight.
pub fn select_validator(scores: &BTreeMap<NodeId, f64>, last_hash: &str) -> Option<NodeId> {
    let weighted: Vec<(&NodeId, f64)> = scores
        .iter()
        .map(|(id, score)| (id, score.max(0.0)))
        .filter(|(_, weight)| *weight > 0.0)
        .collect();
    let total: f64 = weighted.iter().map(|(_, w)| w).sum();
    if total <= 0.0 {
        return None;
    }
    let mut rng = ChaCha20Rng::from_seed(seed_from_hash(last_hash));
    let draw = rng.gen_range(0.0..total);
    let mut cumulative = 0.0;
    for (id, weight) in &weighted {
        cumulative += weight;
        if cumulative >= draw {
            return Some((*id).clone());
        }
    }
    weighted.last().map(|(id, _)| (*id).clone())
}

fn seed_from_hash(hash: &str) -> [u8; 32] {
    match hex::decode(hash) {
        Ok(bytes) if bytes.len() == 32 => {
            let mut seed = [0u8; 32];
            seed.copy_from_slice(&bytes);
            seed
        }
        _ => Sha256::digest(hash.as_bytes()).into(),
    }
}

#[async_trait]
impl ConsensusEngine for ProofOfStake {
    fn kind(&self) -> ConsensusKind {
        ConsensusKind::ProofOfStake
    }

    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn select(&self, proposal: Proposal, tip: ChainTip) -> Result<Selection, ConsensusError> {
        let winner = select_validator(&self.reputation.snapshot(), &tip.block.hash)
            .ok_or(ConsensusError::NoStake)?;
        debug!(node = %self.node_id, %winner, "stake draw");
        if winner != self.node_id {
            return Ok(Selection::NotSelected {
                winner: Some(winner),
            });
        }
        let block = BlockFields {
            user_id: proposal.user_id,
            previous_hash: tip.block.hash,
            transaction: proposal.transaction,
            commitment: proposal.commitment,
            timestamp: now_secs(),
            nonce: 0,
            validator: None,
        }
        .seal();
        Ok(Selection::Won {
            block,
            proposer: winner,
        })
    }

    fn check(&self, chain: &Chain, block: &Block) -> Result<(), ConsensusError> {
        check_hash(block)?;
        check_link(chain, block)
    }

    fn validate(&self, chain: &Chain, block: &Block, proposer: &str) -> Result<(), ConsensusError> {
        match self.check(chain, block) {
            Ok(()) => {
                self.reputation.reward(proposer, self.reward);
                Ok(())
            }
            Err(err) => {
                warn!(proposer, error = %err, "stake block rejected");
                self.reputation.penalize(proposer, self.penalty);
                Err(err)
            }
        }
    }

    fn commit(&self, chain: &mut Chain, block: Block) -> BlockMetrics {
        chain.append(block, None)
    }
}
