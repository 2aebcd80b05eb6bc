use anyhow::{anyhow, Result};
use async_trait::async_trait;
use runtime::{Block, BlockFields, Timestamp};

/// Outbound peer calls a strategy needs. The node wires in an HTTP
/// implementation; tests script their own.
#[async_trait]
pub trait ConsensusNetwork: Send + Sync {
    /// Tell every peer this node found a block at `found_at`.
    async fn announce_selection(&self, node_id: &str, found_at: Timestamp);

    /// Ask `peer` to vote on a candidate. Transport failures are errors;
    /// callers count them as NO.
    async fn request_vote(&self, peer: &str, candidate: &BlockFields) -> Result<bool>;

    /// Push a committed block to every peer.
    async fn broadcast_block(&self, block: &Block, proposer: &str);
}

/// Single-node setups. Announcements and broadcasts go nowhere and every
/// vote request fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopConsensusNetwork;

#[async_trait]
impl ConsensusNetwork for NoopConsensusNetwork {
    async fn announce_selection(&self, _node_id: &str, _found_at: Timestamp) {}

    async fn request_vote(&self, peer: &str, _candidate: &BlockFields) -> Result<bool> {
        Err(anyhow!("no transport configured for {peer}"))
    }

    async fn broadcast_block(&self, _block: &Block, _proposer: &str) {}
}
