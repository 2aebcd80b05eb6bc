use async_trait::async_trait;
use runtime::{
    meets_difficulty, Block, BlockMetrics, Chain, ConfigError, ConsensusKind, ConsensusParams,
    Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use state::{NodeId, ReputationTable};
use std::sync::Arc;
use thiserror::Error;

mod cancel;
pub mod cluster;
mod hierarchical;
mod ledger;
mod mining;
mod network;
mod poa;
mod pos;
mod pow;
pub mod voting;

pub use cancel::CancelSignal;
pub use cluster::{ClusterAssignment, ClusterId, Leadership};
pub use hierarchical::Hierarchical;
pub use ledger::{CommittedBlock, Ledger, LedgerError};
pub use mining::{search, SearchJob, SearchOutcome};
pub use network::{ConsensusNetwork, NoopConsensusNetwork};
pub use poa::ProofOfAuthority;
pub use pos::{select_validator, ProofOfStake};
pub use pow::ProofOfWork;
pub use voting::{collect_votes, inter_cluster_threshold, VoteTally};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConsensusError {
    #[error("stored hash {stored} does not match contents ({computed})")]
    HashMismatch { stored: String, computed: String },
    #[error("previous hash {got} does not extend tail {expected}")]
    BrokenLink { expected: String, got: String },
    #[error("hash {hash} lacks {difficulty} leading zeros")]
    InsufficientWork { hash: String, difficulty: u32 },
    #[error("validator {0:?} is not an authority")]
    UnauthorizedValidator(Option<String>),
    #[error("inter-cluster vote failed: {yes} yes votes, {required} required")]
    InsufficientVotes { yes: usize, required: usize },
    #[error("no stake to draw a validator from")]
    NoStake,
    #[error("nonce search exhausted after {0} attempts")]
    SearchExhausted(u64),
    #[error("mining worker failed: {0}")]
    Worker(String),
}

/// What the caller wants recorded in the next block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub user_id: String,
    pub transaction: Value,
    pub commitment: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChainTip {
    pub block: Block,
    pub height: u64,
}

impl ChainTip {
    pub fn of(chain: &Chain) -> Self {
        Self {
            block: chain.tail().clone(),
            height: chain.height(),
        }
    }
}

/// Outcome of a selection round. Losing the round is not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Won { block: Block, proposer: NodeId },
    NotSelected { winner: Option<NodeId> },
    Cancelled,
}

#[async_trait]
pub trait ConsensusEngine: Send + Sync {
    fn kind(&self) -> ConsensusKind;

    fn node_id(&self) -> &str;

    /// Produce the next block or report that this node did not win.
    async fn select(&self, proposal: Proposal, tip: ChainTip) -> Result<Selection, ConsensusError>;

    /// Protocol rules only, no side effects.
    fn check(&self, chain: &Chain, block: &Block) -> Result<(), ConsensusError>;

    /// `check` plus reputation bookkeeping for the proposer.
    fn validate(&self, chain: &Chain, block: &Block, proposer: &str) -> Result<(), ConsensusError>;

    fn commit(&self, chain: &mut Chain, block: Block) -> BlockMetrics;

    /// Ask an in-flight search to stop because a peer found a block at
    /// `remote_found_at`. Returns whether this node yielded.
    fn cancel(&self, _remote_found_at: Timestamp) -> bool {
        false
    }

    /// This node's vote when a peer asks for one.
    fn approve(&self, chain: &Chain, block: &Block) -> bool {
        self.check(chain, block).is_ok()
    }

    fn difficulty(&self) -> Option<u32> {
        None
    }
}

/// Everything a strategy may need, handed over once at startup.
#[derive(Clone)]
pub struct EngineContext {
    pub node_id: NodeId,
    pub reputation: ReputationTable,
    pub network: Arc<dyn ConsensusNetwork>,
    pub params: ConsensusParams,
}

pub fn build_engine(
    kind: ConsensusKind,
    ctx: EngineContext,
) -> Result<Arc<dyn ConsensusEngine>, ConfigError> {
    tracing::info!(node = %ctx.node_id, consensus = %kind, "building consensus engine");
    let engine: Arc<dyn ConsensusEngine> = match kind {
        ConsensusKind::ProofOfWork => Arc::new(ProofOfWork::new(ctx)),
        ConsensusKind::ProofOfStake => Arc::new(ProofOfStake::new(ctx)),
        ConsensusKind::ProofOfAuthority => Arc::new(ProofOfAuthority::new(
            ctx.node_id,
            ctx.params.authorities,
        )?),
        ConsensusKind::Hierarchical => Arc::new(Hierarchical::new(ctx)),
    };
    Ok(engine)
}

pub(crate) fn check_hash(block: &Block) -> Result<(), ConsensusError> {
    let computed = block.recompute_hash();
    if computed != block.hash {
        return Err(ConsensusError::HashMismatch {
            stored: block.hash.clone(),
            computed,
        });
    }
    Ok(())
}

pub(crate) fn check_link(chain: &Chain, block: &Block) -> Result<(), ConsensusError> {
    if !chain.links_to_tail(block) {
        return Err(ConsensusError::BrokenLink {
            expected: chain.tail().hash.clone(),
            got: block.previous_hash.clone(),
        });
    }
    Ok(())
}

pub(crate) fn check_work(block: &Block, difficulty: u32) -> Result<(), ConsensusError> {
    if !meets_difficulty(&block.hash, difficulty) {
        return Err(ConsensusError::InsufficientWork {
            hash: block.hash.clone(),
            difficulty,
        });
    }
    Ok(())
}
