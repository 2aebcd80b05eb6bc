use crate::{genesis_block, Block, Timestamp};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Observational metrics accumulated per committed block. Never consulted by
/// consensus.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainMetrics {
    pub block_times: Vec<f64>,
    pub transactions_per_block: Vec<usize>,
    pub block_sizes: Vec<usize>,
    pub total_size: usize,
    pub difficulty: Vec<u32>,
    #[serde(skip)]
    last_block_time: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlockMetrics {
    pub block_time: f64,
    pub transactions: usize,
    pub size: usize,
    pub difficulty: u32,
}

impl ChainMetrics {
    fn starting_at(timestamp: Timestamp) -> Self {
        Self {
            last_block_time: timestamp,
            ..Self::default()
        }
    }

    pub fn record(&mut self, block: &Block, difficulty: Option<u32>) -> BlockMetrics {
        let sample = BlockMetrics {
            block_time: block.timestamp - self.last_block_time,
            transactions: block.transaction_count(),
            size: block.size_in_bytes(),
            difficulty: difficulty.unwrap_or(0),
        };
        self.last_block_time = block.timestamp;
        self.block_times.push(sample.block_time);
        self.transactions_per_block.push(sample.transactions);
        self.block_sizes.push(sample.size);
        self.total_size += sample.size;
        self.difficulty.push(sample.difficulty);
        debug!(
            block_time = sample.block_time,
            size = sample.size,
            total_size = self.total_size,
            "metrics updated"
        );
        sample
    }
}

/// Append-only, hash-linked block list rooted at the fixed genesis block.
#[derive(Debug, Clone)]
pub struct Chain {
    blocks: Vec<Block>,
    metrics: ChainMetrics,
}

impl Default for Chain {
    fn default() -> Self {
        Self::new()
    }
}

impl Chain {
    pub fn new() -> Self {
        let genesis = genesis_block();
        let metrics = ChainMetrics::starting_at(genesis.timestamp);
        Self {
            blocks: vec![genesis],
            metrics,
        }
    }

    pub fn tail(&self) -> &Block {
        // the genesis block is never removed
        &self.blocks[self.blocks.len() - 1]
    }

    /// Index of the tail block; genesis is height 0.
    pub fn height(&self) -> u64 {
        (self.blocks.len() - 1) as u64
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn metrics(&self) -> &ChainMetrics {
        &self.metrics
    }

    /// Whether `block` extends the current tail.
    pub fn links_to_tail(&self, block: &Block) -> bool {
        block.previous_hash == self.tail().hash
    }

    pub fn append(&mut self, block: Block, difficulty: Option<u32>) -> BlockMetrics {
        let sample = self.metrics.record(&block, difficulty);
        info!(
            height = self.blocks.len(),
            proposer = %block.user_id,
            hash = %block.hash,
            "block appended"
        );
        self.blocks.push(block);
        sample
    }

    pub fn is_continuous(&self) -> bool {
        self.blocks
            .windows(2)
            .all(|pair| pair[1].previous_hash == pair[0].hash)
    }
}

/// Receives every committed block together with its metrics sample.
pub trait CommitObserver: Send + Sync {
    fn on_commit(&self, block: &Block, metrics: &BlockMetrics);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl CommitObserver for TracingObserver {
    fn on_commit(&self, block: &Block, metrics: &BlockMetrics) {
        info!(
            proposer = %block.user_id,
            block_time = metrics.block_time,
            transactions = metrics.transactions,
            size = metrics.size,
            difficulty = metrics.difficulty,
            "block committed"
        );
    }
}
