use crate::{ChainTip, ConsensusEngine, ConsensusError, Proposal, Selection};
use runtime::{
    Block, BlockFields, BlockMetrics, Chain, ChainMetrics, CommitObserver, Timestamp,
    TracingObserver,
};
use serde_json::Value;
use state::NodeId;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("this node was not selected (winner: {winner:?})")]
    NotSelected { winner: Option<NodeId> },
    #[error("round cancelled by an earlier peer")]
    Cancelled,
    #[error(transparent)]
    Rejected(#[from] ConsensusError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommittedBlock {
    pub block: Block,
    pub proposer: NodeId,
}

/// The chain plus the consensus strategy that guards it.
///
/// One local round runs at a time. The chain lock is never held across an
/// await, so peers can still read the chain and ask for votes mid-round.
pub struct Ledger {
    engine: Arc<dyn ConsensusEngine>,
    chain: Mutex<Chain>,
    pending: Mutex<Vec<Value>>,
    round: tokio::sync::Mutex<()>,
    observer: Arc<dyn CommitObserver>,
}

impl Ledger {
    pub fn new(engine: Arc<dyn ConsensusEngine>) -> Self {
        Self {
            engine,
            chain: Mutex::new(Chain::new()),
            pending: Mutex::new(Vec::new()),
            round: tokio::sync::Mutex::new(()),
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn CommitObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn engine(&self) -> &Arc<dyn ConsensusEngine> {
        &self.engine
    }

    pub fn tip(&self) -> ChainTip {
        ChainTip::of(&self.chain.lock().unwrap())
    }

    pub fn blocks(&self) -> Vec<Block> {
        self.chain.lock().unwrap().blocks().to_vec()
    }

    pub fn metrics(&self) -> ChainMetrics {
        self.chain.lock().unwrap().metrics().clone()
    }

    pub fn height(&self) -> u64 {
        self.chain.lock().unwrap().height()
    }

    /// Held until the next local round, which folds it into its block.
    pub fn enqueue_transaction(&self, transaction: Value) -> usize {
        let mut pending = self.pending.lock().unwrap();
        pending.push(transaction);
        pending.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Run one selection round for a new block and commit it if this node
    /// wins. Queued transactions ride along and are requeued if it doesn't.
    pub async fn add_block(
        &self,
        user_id: impl Into<String>,
        transaction: Value,
        commitment: Value,
    ) -> Result<CommittedBlock, LedgerError> {
        let _round = self.round.lock().await;
        let requeue = Requeue {
            pending: &self.pending,
            queued: std::mem::take(&mut *self.pending.lock().unwrap()),
        };
        let proposal = Proposal {
            user_id: user_id.into(),
            transaction: merge_pending(&requeue.queued, transaction),
            commitment,
        };
        let result = self.run_round(proposal).await;
        if result.is_ok() {
            requeue.consumed();
        }
        result
    }

    async fn run_round(&self, proposal: Proposal) -> Result<CommittedBlock, LedgerError> {
        match self.engine.select(proposal, self.tip()).await? {
            Selection::Won { block, proposer } => {
                self.accept(block.clone(), &proposer)?;
                Ok(CommittedBlock { block, proposer })
            }
            Selection::NotSelected { winner } => Err(LedgerError::NotSelected { winner }),
            Selection::Cancelled => Err(LedgerError::Cancelled),
        }
    }

    /// A block produced elsewhere. Goes through the same validate and commit
    /// path as a local one.
    pub fn receive_block(
        &self,
        block: Block,
        proposer: &str,
    ) -> Result<BlockMetrics, ConsensusError> {
        self.accept(block, proposer)
    }

    fn accept(&self, block: Block, proposer: &str) -> Result<BlockMetrics, ConsensusError> {
        let (sample, committed) = {
            let mut chain = self.chain.lock().unwrap();
            self.engine.validate(&chain, &block, proposer)?;
            let sample = self.engine.commit(&mut chain, block);
            (sample, chain.tail().clone())
        };
        info!(height = self.height(), %proposer, hash = %committed.hash, "block accepted");
        self.observer.on_commit(&committed, &sample);
        Ok(sample)
    }

    /// Vote on a peer's candidate against the current tail.
    pub fn approve(&self, candidate: BlockFields) -> bool {
        let block = candidate.seal();
        let chain = self.chain.lock().unwrap();
        self.engine.approve(&chain, &block)
    }

    pub fn cancel(&self, remote_found_at: Timestamp) -> bool {
        self.engine.cancel(remote_found_at)
    }
}

/// Transactions taken for a round. Put back in front of anything queued
/// since, unless the round committed them. Also covers a dropped round.
struct Requeue<'a> {
    pending: &'a Mutex<Vec<Value>>,
    queued: Vec<Value>,
}

impl Requeue<'_> {
    fn consumed(mut self) {
        self.queued.clear();
    }
}

impl Drop for Requeue<'_> {
    fn drop(&mut self) {
        if self.queued.is_empty() {
            return;
        }
        let mut pending = self.pending.lock().unwrap();
        let newer = std::mem::replace(&mut *pending, std::mem::take(&mut self.queued));
        pending.extend(newer);
    }
}

fn merge_pending(queued: &[Value], transaction: Value) -> Value {
    if queued.is_empty() {
        return transaction;
    }
    let mut merged = queued.to_vec();
    if !transaction.is_null() {
        merged.push(transaction);
    }
    Value::Array(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pending_transactions_come_first() {
        let merged = merge_pending(&[json!({"a": 1})], json!({"b": 2}));
        assert_eq!(merged, json!([{"a": 1}, {"b": 2}]));
    }

    #[test]
    fn nothing_pending_keeps_transaction() {
        assert_eq!(merge_pending(&[], json!("tx")), json!("tx"));
        assert_eq!(merge_pending(&[json!(1)], Value::Null), json!([1]));
    }
}
