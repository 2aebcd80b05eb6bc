use crate::{
    check_hash, check_link, ChainTip, ConsensusEngine, ConsensusError, Proposal, Selection,
};
use async_trait::async_trait;
use runtime::{now_secs, Block, BlockFields, BlockMetrics, Chain, ConfigError, ConsensusKind};
use state::NodeId;
use tracing::{debug, warn};

/// A fixed list of authorities takes turns by height.
pub struct ProofOfAuthority {
    node_id: NodeId,
    authorities: Vec<NodeId>,
}

impl ProofOfAuthority {
    pub fn new(node_id: NodeId, authorities: Vec<NodeId>) -> Result<Self, ConfigError> {
        if authorities.is_empty() {
            return Err(ConfigError::MissingAuthorities);
        }
        Ok(Self {
            node_id,
            authorities,
        })
    }

    pub fn authorities(&self) -> &[NodeId] {
        &self.authorities
    }

    /// Authority allowed to produce the block at `height`.
    pub fn designated(&self, height: u64) -> &NodeId {
        let index = (height % self.authorities.len() as u64) as usize;
        &self.authorities[index]
    }

    pub fn is_authority(&self, node: &str) -> bool {
        self.authorities.iter().any(|a| a == node)
    }
}

#[async_trait]
impl ConsensusEngine for ProofOfAuthority {
    fn kind(&self) -> ConsensusKind {
        ConsensusKind::ProofOfAuthority
    }

    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn select(&self, proposal: Proposal, tip: ChainTip) -> Result<Selection, ConsensusError> {
        let designated = self.designated(tip.height + 1).clone();
        debug!(node = %self.node_id, %designated, height = tip.height + 1, "authority turn");
        if designated != self.node_id {
            return Ok(Selection::NotSelected {
                winner: Some(designated),
            });
        }
        let block = BlockFields {
            user_id: proposal.user_id,
            previous_hash: tip.block.hash,
            transaction: proposal.transaction,
            commitment: proposal.commitment,
            timestamp: now_secs(),
            nonce: 0,
            validator: Some(designated.clone()),
        }
        .seal();
        Ok(Selection::Won {
            block,
            proposer: designated,
        })
    }

    fn check(&self, chain: &Chain, block: &Block) -> Result<(), ConsensusError> {
        match block.validator.as_deref() {
            Some(v) if self.is_authority(v) => {}
            other => return Err(ConsensusError::UnauthorizedValidator(other.map(str::to_owned))),
        }
        check_hash(block)?;
        check_link(chain, block)
    }

    fn validate(&self, chain: &Chain, block: &Block, proposer: &str) -> Result<(), ConsensusError> {
        self.check(chain, block).map_err(|err| {
            warn!(proposer, error = %err, "authority block rejected");
            err
        })
    }

    fn commit(&self, chain: &mut Chain, block: Block) -> BlockMetrics {
        chain.append(block, None)
    }
}
